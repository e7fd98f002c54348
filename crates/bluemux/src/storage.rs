//! Persistent key storage
//!
//! The stack does not persist anything itself. Link keys handed out by the
//! controller and LE bonding data are written to and read from a
//! [`KeyStore`] supplied by the application, addressed by device address.

use crate::gap::BdAddr;
use std::collections::HashMap;

/// LE Long Term Key with the values used to identify it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongTermKey {
    /// Key value
    pub key: [u8; 16],
    /// EDIV (Encrypted Diversifier)
    pub ediv: u16,
    /// RAND (Random number)
    pub rand: [u8; 8],
    /// Whether the key was created with an authenticated pairing
    pub authenticated: bool,
}

impl LongTermKey {
    /// Create a new Long Term Key
    pub fn new(key: [u8; 16], ediv: u16, rand: [u8; 8], authenticated: bool) -> Self {
        Self {
            key,
            ediv,
            rand,
            authenticated,
        }
    }

    /// Create an LTK from Secure Connections pairing, which uses zero EDIV and Rand
    pub fn new_secure_connections(key: [u8; 16], authenticated: bool) -> Self {
        Self::new(key, 0, [0; 8], authenticated)
    }

    /// Whether this key answers an LTK request carrying `ediv` and `rand`
    pub fn matches(&self, ediv: u16, rand: &[u8; 8]) -> bool {
        self.ediv == ediv && &self.rand == rand
    }
}

/// Key material stored for one peer device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredKey {
    /// BR/EDR link key and its key type
    LinkKey { key: [u8; 16], key_type: u8 },
    /// LE bonding data
    LongTermKey(LongTermKey),
}

/// Key/value storage collaborator for bonding data
pub trait KeyStore {
    /// Look up the key stored for a device
    fn get(&self, address: &BdAddr) -> Option<StoredKey>;

    /// Store (or replace) the key for a device
    fn put(&mut self, address: BdAddr, key: StoredKey);

    /// Forget the key for a device
    fn delete(&mut self, address: &BdAddr);
}

/// In-memory implementation of KeyStore
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    keys: HashMap<BdAddr, StoredKey>,
}

impl MemoryKeyStore {
    /// Create a new empty in-memory key store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of devices with stored keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no keys are stored
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl KeyStore for MemoryKeyStore {
    fn get(&self, address: &BdAddr) -> Option<StoredKey> {
        self.keys.get(address).copied()
    }

    fn put(&mut self, address: BdAddr, key: StoredKey) {
        self.keys.insert(address, key);
    }

    fn delete(&mut self, address: &BdAddr) {
        self.keys.remove(address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_key_store() {
        let mut store = MemoryKeyStore::new();
        let addr = BdAddr::new([1, 2, 3, 4, 5, 6]);

        assert!(store.get(&addr).is_none());

        store.put(addr, StoredKey::LinkKey { key: [7; 16], key_type: 4 });
        assert_eq!(store.get(&addr), Some(StoredKey::LinkKey { key: [7; 16], key_type: 4 }));

        let ltk = LongTermKey::new([9; 16], 0x1234, [1; 8], true);
        store.put(addr, StoredKey::LongTermKey(ltk));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&addr), Some(StoredKey::LongTermKey(ltk)));

        store.delete(&addr);
        assert!(store.is_empty());
    }

    #[test]
    fn test_long_term_key_matching() {
        let ltk = LongTermKey::new([0; 16], 0xBEEF, [1, 2, 3, 4, 5, 6, 7, 8], false);
        assert!(ltk.matches(0xBEEF, &[1, 2, 3, 4, 5, 6, 7, 8]));
        assert!(!ltk.matches(0xBEEF, &[0; 8]));

        let sc = LongTermKey::new_secure_connections([0; 16], true);
        assert!(sc.matches(0, &[0; 8]));
    }
}
