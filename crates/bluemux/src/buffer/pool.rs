//! Fixed-capacity packet pool
//!
//! The pool never grows. All storage is allocated once in [`PacketPool::new`]
//! and lent out slot by slot; an exhausted class is an expected condition
//! that callers resolve by deferring and retrying.

use crate::config::PoolConfig;
use crate::hci::constants::*;
use log::{error, trace};
use std::convert::TryFrom;
use std::fmt;
use thiserror::Error;

/// HCI packet type, using the H4 packet indicator values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// HCI command (host to controller)
    Command = HCI_COMMAND_PKT,
    /// ACL data
    Acl = HCI_ACL_PKT,
    /// SCO data
    Sco = HCI_SCO_PKT,
    /// HCI event (controller to host)
    Event = HCI_EVENT_PKT,
}

impl PacketType {
    /// All packet types, in pool class order
    pub const ALL: [PacketType; 4] = [PacketType::Command, PacketType::Acl, PacketType::Sco, PacketType::Event];

    /// H4 packet indicator byte
    pub fn indicator(self) -> u8 {
        self as u8
    }

    fn class_index(self) -> usize {
        match self {
            PacketType::Command => 0,
            PacketType::Acl => 1,
            PacketType::Sco => 2,
            PacketType::Event => 3,
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            HCI_COMMAND_PKT => Ok(PacketType::Command),
            HCI_ACL_PKT => Ok(PacketType::Acl),
            HCI_SCO_PKT => Ok(PacketType::Sco),
            HCI_EVENT_PKT => Ok(PacketType::Event),
            other => Err(other),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::Command => write!(f, "command"),
            PacketType::Acl => write!(f, "ACL"),
            PacketType::Sco => write!(f, "SCO"),
            PacketType::Event => write!(f, "event"),
        }
    }
}

/// Errors reported by the packet pool
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("No free {0} buffer")]
    Exhausted(PacketType),

    #[error("Release of a {0} buffer that is not on loan from this pool (slot {1})")]
    InvalidRelease(PacketType, usize),

    #[error("Data of {len} bytes does not fit a {capacity} byte buffer")]
    Overflow { len: usize, capacity: usize },
}

/// A packet buffer on loan from a [`PacketPool`]
///
/// Holds the HCI packet without the H4 packet indicator byte. The buffer has
/// exactly one owner; it is moved along the pipeline and handed back with
/// [`PacketPool::release`].
pub struct PacketBuffer {
    packet_type: PacketType,
    slot: usize,
    data: Box<[u8]>,
    len: usize,
}

impl PacketBuffer {
    /// Packet type tag
    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    /// Index of the pool slot this buffer belongs to
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Number of valid bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no data
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total capacity of the buffer
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Valid bytes of the packet
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Mutable view of the valid bytes
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    /// Discard the contents
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Append bytes, failing if they do not fit
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<(), PoolError> {
        let end = self.len + bytes.len();
        if end > self.data.len() {
            return Err(PoolError::Overflow {
                len: end,
                capacity: self.data.len(),
            });
        }
        self.data[self.len..end].copy_from_slice(bytes);
        self.len = end;
        Ok(())
    }

    /// Replace the contents with `bytes`
    pub fn fill(&mut self, bytes: &[u8]) -> Result<(), PoolError> {
        self.clear();
        self.extend_from_slice(bytes)
    }
}

impl fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("packet_type", &self.packet_type)
            .field("slot", &self.slot)
            .field("len", &self.len)
            .field("data", &hex::encode(self.as_slice()))
            .finish()
    }
}

/// Slots of one packet type
struct SlotClass {
    /// `Some` while the slot is free, `None` while it is on loan
    slots: Vec<Option<Box<[u8]>>>,
    /// Free slot indices
    free: Vec<usize>,
    buffer_size: usize,
    in_use: usize,
}

impl SlotClass {
    fn new(count: usize, buffer_size: usize) -> Self {
        Self {
            slots: (0..count).map(|_| Some(vec![0u8; buffer_size].into_boxed_slice())).collect(),
            // Pop from the end hands out slot 0 first
            free: (0..count).rev().collect(),
            buffer_size,
            in_use: 0,
        }
    }
}

/// Fixed-capacity arena of packet buffers, one class per packet type
pub struct PacketPool {
    classes: [SlotClass; 4],
}

impl PacketPool {
    /// Allocate every slot described by `config`
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            classes: [
                SlotClass::new(config.command_buffers, config.command_buffer_size()),
                SlotClass::new(config.acl_buffers, config.acl_buffer_size()),
                SlotClass::new(config.sco_buffers, config.sco_buffer_size()),
                SlotClass::new(config.event_buffers, config.event_buffer_size()),
            ],
        }
    }

    /// Take a free buffer of the given type
    pub fn acquire(&mut self, packet_type: PacketType) -> Result<PacketBuffer, PoolError> {
        let class = &mut self.classes[packet_type.class_index()];
        let slot = class.free.pop().ok_or(PoolError::Exhausted(packet_type))?;
        let data = match class.slots[slot].take() {
            Some(data) => data,
            None => {
                // Free list and slot guard disagree; never hand out a loaned slot twice
                error!("{} pool slot {} on free list while on loan", packet_type, slot);
                debug_assert!(false, "pool free list corrupted");
                return Err(PoolError::Exhausted(packet_type));
            }
        };
        class.in_use += 1;
        debug_assert!(class.in_use <= class.slots.len());
        trace!("acquired {} buffer slot {} ({} in use)", packet_type, slot, class.in_use);

        Ok(PacketBuffer {
            packet_type,
            slot,
            data,
            len: 0,
        })
    }

    /// Return a buffer to its slot
    ///
    /// Releasing a buffer that did not come from this pool, or whose slot is
    /// already free, is a programming error: it asserts in debug builds and
    /// is reported as [`PoolError::InvalidRelease`] otherwise.
    pub fn release(&mut self, buffer: PacketBuffer) -> Result<(), PoolError> {
        let packet_type = buffer.packet_type;
        let slot = buffer.slot;
        let class = &mut self.classes[packet_type.class_index()];

        let valid = slot < class.slots.len()
            && class.slots[slot].is_none()
            && buffer.data.len() == class.buffer_size
            && class.in_use > 0;
        if !valid {
            error!("invalid release of {} buffer slot {}", packet_type, slot);
            debug_assert!(false, "invalid release of {} buffer slot {}", packet_type, slot);
            return Err(PoolError::InvalidRelease(packet_type, slot));
        }

        class.slots[slot] = Some(buffer.data);
        class.free.push(slot);
        class.in_use -= 1;
        trace!("released {} buffer slot {} ({} in use)", packet_type, slot, class.in_use);
        Ok(())
    }

    /// Number of buffers of the given type currently on loan
    pub fn in_use(&self, packet_type: PacketType) -> usize {
        self.classes[packet_type.class_index()].in_use
    }

    /// Number of buffers of the given type available for [`PacketPool::acquire`]
    pub fn available(&self, packet_type: PacketType) -> usize {
        self.classes[packet_type.class_index()].free.len()
    }

    /// Configured number of buffers of the given type
    pub fn capacity(&self, packet_type: PacketType) -> usize {
        self.classes[packet_type.class_index()].slots.len()
    }

    /// Size in bytes of one buffer of the given type
    pub fn buffer_size(&self, packet_type: PacketType) -> usize {
        self.classes[packet_type.class_index()].buffer_size
    }
}

impl fmt::Debug for PacketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("PacketPool");
        for packet_type in PacketType::ALL {
            let class = &self.classes[packet_type.class_index()];
            s.field(
                &packet_type.to_string(),
                &format_args!("{}/{} x {}B", class.in_use, class.slots.len(), class.buffer_size),
            );
        }
        s.finish()
    }
}
