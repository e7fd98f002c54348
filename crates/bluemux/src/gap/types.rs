use std::fmt;

/// Peer address type as reported by LE connection events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum AddressType {
    #[default]
    Public = 0x00,
    Random = 0x01,
    /// Resolved from a resolvable private address, identity is public
    PublicIdentity = 0x02,
    /// Resolved from a resolvable private address, identity is static random
    RandomIdentity = 0x03,
}

impl AddressType {
    pub fn is_random(self) -> bool {
        matches!(self, AddressType::Random | AddressType::RandomIdentity)
    }
}

/// Reserved values decode as [`AddressType::Public`]
impl From<u8> for AddressType {
    fn from(value: u8) -> Self {
        match value {
            0x01 => AddressType::Random,
            0x02 => AddressType::PublicIdentity,
            0x03 => AddressType::RandomIdentity,
            _ => AddressType::Public,
        }
    }
}

impl From<AddressType> for u8 {
    fn from(value: AddressType) -> Self {
        value as u8
    }
}

/// Bluetooth device address in wire order (least significant byte first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<[u8; 6]> for BdAddr {
    fn from(bytes: [u8; 6]) -> Self {
        Self::new(bytes)
    }
}

/// Printed most significant byte first, the way users read addresses
impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.bytes.iter().rev().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}
