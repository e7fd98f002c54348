//! Connection handle table
//!
//! Records live in a fixed arena of slots. A handle index maps the 12 bit
//! connection handle to its slot; freed slots are reused.

use crate::error::{HciError, HciResult};
use crate::gap::{AddressType, BdAddr};
use crate::hci::event::LeRole;
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// Kind of baseband link behind a connection handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkType {
    /// BR/EDR ACL link
    Classic,
    /// LE ACL link
    Le,
    /// SCO or eSCO link
    Sco,
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkType::Classic => write!(f, "BR/EDR"),
            LinkType::Le => write!(f, "LE"),
            LinkType::Sco => write!(f, "SCO"),
        }
    }
}

/// An outgoing L2CAP PDU waiting to be cut into ACL fragments
#[derive(Debug)]
pub(crate) struct PendingPdu {
    pub data: Vec<u8>,
    pub offset: usize,
    pub flushable: bool,
    pub started: bool,
}

impl PendingPdu {
    pub fn new(data: Vec<u8>, flushable: bool) -> Self {
        Self {
            data,
            offset: 0,
            flushable,
            started: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.started && self.offset >= self.data.len()
    }
}

/// State of one established connection
#[derive(Debug)]
pub struct ConnectionRecord {
    pub handle: u16,
    pub address: BdAddr,
    pub address_type: AddressType,
    pub link_type: LinkType,
    /// Local role, LE links only
    pub role: Option<LeRole>,
    /// Packets sent to the controller and not yet reported completed
    pub acl_in_flight: u16,
    /// Connection interval in 1.25 ms units
    pub interval: u16,
    pub latency: u16,
    /// Supervision timeout in 10 ms units
    pub supervision_timeout: u16,
    pub encrypted: bool,
    pub(crate) pending: VecDeque<PendingPdu>,
}

impl ConnectionRecord {
    /// Create a record for a new connection
    pub fn new(handle: u16, address: BdAddr, address_type: AddressType, link_type: LinkType) -> Self {
        Self {
            handle,
            address,
            address_type,
            link_type,
            role: None,
            acl_in_flight: 0,
            interval: 0,
            latency: 0,
            supervision_timeout: 0,
            encrypted: false,
            pending: VecDeque::new(),
        }
    }

    /// Number of outgoing PDUs not yet fully handed to the controller
    pub fn pending_pdus(&self) -> usize {
        self.pending.len()
    }

    /// Whether outgoing data is waiting for controller buffers
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Arena of connection records indexed by handle
pub struct ConnectionTable {
    slots: Vec<Option<ConnectionRecord>>,
    free: Vec<usize>,
    index: HashMap<u16, usize>,
}

impl ConnectionTable {
    /// Create a table with room for `capacity` connections
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            free: (0..capacity).rev().collect(),
            index: HashMap::with_capacity(capacity),
        }
    }

    /// Add a record, replacing any stale record with the same handle
    pub fn insert(&mut self, record: ConnectionRecord) -> HciResult<()> {
        if let Some(&slot) = self.index.get(&record.handle) {
            self.slots[slot] = Some(record);
            return Ok(());
        }

        let slot = self.free.pop().ok_or(HciError::ConnectionTableFull)?;
        self.index.insert(record.handle, slot);
        self.slots[slot] = Some(record);
        Ok(())
    }

    /// Remove the record for `handle`
    pub fn remove(&mut self, handle: u16) -> Option<ConnectionRecord> {
        let slot = self.index.remove(&handle)?;
        self.free.push(slot);
        self.slots[slot].take()
    }

    pub fn get(&self, handle: u16) -> Option<&ConnectionRecord> {
        self.index.get(&handle).and_then(|&slot| self.slots[slot].as_ref())
    }

    pub fn get_mut(&mut self, handle: u16) -> Option<&mut ConnectionRecord> {
        match self.index.get(&handle) {
            Some(&slot) => self.slots[slot].as_mut(),
            None => None,
        }
    }

    pub fn contains(&self, handle: u16) -> bool {
        self.index.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Records in slot order
    pub fn iter(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.slots.iter().filter_map(|slot| slot.as_ref())
    }

    /// Handles of all connections, in slot order
    pub fn handles(&self) -> Vec<u16> {
        self.iter().map(|record| record.handle).collect()
    }

    /// Record in a given slot
    pub(crate) fn slot_mut(&mut self, slot: usize) -> Option<&mut ConnectionRecord> {
        self.slots.get_mut(slot).and_then(|slot| slot.as_mut())
    }

    /// Remove every record
    pub fn drain(&mut self) -> Vec<ConnectionRecord> {
        let handles = self.handles();
        handles.into_iter().filter_map(|handle| self.remove(handle)).collect()
    }
}

impl fmt::Debug for ConnectionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.iter().map(|record| format!("0x{:04X} {} {}", record.handle, record.link_type, record.address)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(handle: u16) -> ConnectionRecord {
        ConnectionRecord::new(handle, BdAddr::new([handle as u8; 6]), AddressType::Public, LinkType::Le)
    }

    #[test]
    fn test_insert_and_remove() {
        let mut table = ConnectionTable::new(2);
        table.insert(record(0x0040)).unwrap();
        table.insert(record(0x0041)).unwrap();
        assert_eq!(table.len(), 2);

        assert!(matches!(table.insert(record(0x0042)), Err(HciError::ConnectionTableFull)));

        let removed = table.remove(0x0040).unwrap();
        assert_eq!(removed.handle, 0x0040);
        assert!(!table.contains(0x0040));
        assert!(table.get(0x0041).is_some());

        // Freed slot is reused
        table.insert(record(0x0042)).unwrap();
        assert_eq!(table.handles(), vec![0x0042, 0x0041]);
    }

    #[test]
    fn test_duplicate_handle_replaces_record() {
        let mut table = ConnectionTable::new(1);
        table.insert(record(0x0001)).unwrap();
        let mut updated = record(0x0001);
        updated.encrypted = true;
        table.insert(updated).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.get(0x0001).unwrap().encrypted);
    }

    #[test]
    fn test_drain() {
        let mut table = ConnectionTable::new(3);
        table.insert(record(1)).unwrap();
        table.insert(record(2)).unwrap();
        let drained = table.drain();
        assert_eq!(drained.len(), 2);
        assert!(table.is_empty());
        assert!(table.remove(1).is_none());
    }
}
