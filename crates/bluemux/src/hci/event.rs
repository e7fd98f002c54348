//! Decoded HCI events
//!
//! The dispatcher only interprets a fixed catalogue of events; everything
//! else is passed upward as [`Event::Unknown`] with the raw packet.

use crate::error::{HciError, HciResult};
use crate::gap::{AddressType, BdAddr};
use crate::hci::constants::*;
use crate::hci::packet::HciEvent;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

/// Role of the local device on an LE connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeRole {
    Central,
    Peripheral,
}

/// An HCI event from the dispatcher's catalogue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ConnectionComplete {
        status: u8,
        handle: u16,
        bd_addr: BdAddr,
        link_type: u8,
        encryption_enabled: bool,
    },
    SynchronousConnectionComplete {
        status: u8,
        handle: u16,
        bd_addr: BdAddr,
        link_type: u8,
    },
    DisconnectionComplete {
        status: u8,
        handle: u16,
        reason: u8,
    },
    EncryptionChange {
        status: u8,
        handle: u16,
        enabled: bool,
    },
    CommandComplete {
        num_hci_command_packets: u8,
        opcode: u16,
        return_parameters: Vec<u8>,
    },
    CommandStatus {
        status: u8,
        num_hci_command_packets: u8,
        opcode: u16,
    },
    NumberOfCompletedPackets {
        /// (connection handle, completed packets)
        completed: Vec<(u16, u16)>,
    },
    LinkKeyRequest {
        bd_addr: BdAddr,
    },
    LinkKeyNotification {
        bd_addr: BdAddr,
        link_key: [u8; 16],
        key_type: u8,
    },
    LeConnectionComplete {
        status: u8,
        handle: u16,
        role: LeRole,
        peer_address_type: AddressType,
        peer_address: BdAddr,
        interval: u16,
        latency: u16,
        supervision_timeout: u16,
    },
    LeConnectionUpdateComplete {
        status: u8,
        handle: u16,
        interval: u16,
        latency: u16,
        supervision_timeout: u16,
    },
    LeLongTermKeyRequest {
        handle: u16,
        random: [u8; 8],
        ediv: u16,
    },
    /// Any event outside the catalogue
    Unknown(HciEvent),
}

fn read_addr(cursor: &mut Cursor<&[u8]>) -> std::io::Result<BdAddr> {
    let mut bytes = [0u8; 6];
    cursor.read_exact(&mut bytes)?;
    Ok(BdAddr::new(bytes))
}

fn read_handle(cursor: &mut Cursor<&[u8]>) -> std::io::Result<u16> {
    Ok(cursor.read_u16::<LittleEndian>()? & HCI_HANDLE_MASK)
}

impl Event {
    /// Decode a raw event
    ///
    /// Events from the catalogue that are too short are reported as
    /// [`HciError::InvalidPacketFormat`].
    pub fn decode(raw: &HciEvent) -> HciResult<Event> {
        Self::decode_parameters(raw).map_err(|_| HciError::InvalidPacketFormat)
    }

    fn decode_parameters(raw: &HciEvent) -> std::io::Result<Event> {
        let mut cursor = Cursor::new(raw.parameters.as_slice());
        let c = &mut cursor;

        let event = match raw.event_code {
            EVT_CONN_COMPLETE => Event::ConnectionComplete {
                status: c.read_u8()?,
                handle: read_handle(c)?,
                bd_addr: read_addr(c)?,
                link_type: c.read_u8()?,
                encryption_enabled: c.read_u8()? != 0,
            },
            EVT_SYNC_CONN_COMPLETE => Event::SynchronousConnectionComplete {
                status: c.read_u8()?,
                handle: read_handle(c)?,
                bd_addr: read_addr(c)?,
                link_type: c.read_u8()?,
            },
            EVT_DISCONN_COMPLETE => Event::DisconnectionComplete {
                status: c.read_u8()?,
                handle: read_handle(c)?,
                reason: c.read_u8()?,
            },
            EVT_ENCRYPTION_CHANGE => Event::EncryptionChange {
                status: c.read_u8()?,
                handle: read_handle(c)?,
                enabled: c.read_u8()? != 0,
            },
            EVT_CMD_COMPLETE => {
                let num_hci_command_packets = c.read_u8()?;
                let opcode = c.read_u16::<LittleEndian>()?;
                let mut return_parameters = Vec::new();
                c.read_to_end(&mut return_parameters)?;
                Event::CommandComplete {
                    num_hci_command_packets,
                    opcode,
                    return_parameters,
                }
            }
            EVT_CMD_STATUS => Event::CommandStatus {
                status: c.read_u8()?,
                num_hci_command_packets: c.read_u8()?,
                opcode: c.read_u16::<LittleEndian>()?,
            },
            EVT_NUM_COMP_PKTS => {
                let count = c.read_u8()? as usize;
                let mut completed = Vec::with_capacity(count);
                for _ in 0..count {
                    let handle = read_handle(c)?;
                    let packets = c.read_u16::<LittleEndian>()?;
                    completed.push((handle, packets));
                }
                Event::NumberOfCompletedPackets { completed }
            }
            EVT_LINK_KEY_REQUEST => Event::LinkKeyRequest { bd_addr: read_addr(c)? },
            EVT_LINK_KEY_NOTIFICATION => {
                let bd_addr = read_addr(c)?;
                let mut link_key = [0u8; 16];
                c.read_exact(&mut link_key)?;
                Event::LinkKeyNotification {
                    bd_addr,
                    link_key,
                    key_type: c.read_u8()?,
                }
            }
            EVT_LE_META_EVENT => return Self::decode_le_meta(raw, c),
            _ => Event::Unknown(raw.clone()),
        };

        Ok(event)
    }

    fn decode_le_meta(raw: &HciEvent, c: &mut Cursor<&[u8]>) -> std::io::Result<Event> {
        let subevent = c.read_u8()?;

        let event = match subevent {
            EVT_LE_CONN_COMPLETE | EVT_LE_ENHANCED_CONN_COMPLETE => {
                let status = c.read_u8()?;
                let handle = read_handle(c)?;
                let role = if c.read_u8()? == 0 { LeRole::Central } else { LeRole::Peripheral };
                let peer_address_type = AddressType::from(c.read_u8()?);
                let peer_address = read_addr(c)?;
                if subevent == EVT_LE_ENHANCED_CONN_COMPLETE {
                    // Local and peer resolvable private addresses
                    let mut skipped = [0u8; 12];
                    c.read_exact(&mut skipped)?;
                }
                Event::LeConnectionComplete {
                    status,
                    handle,
                    role,
                    peer_address_type,
                    peer_address,
                    interval: c.read_u16::<LittleEndian>()?,
                    latency: c.read_u16::<LittleEndian>()?,
                    supervision_timeout: c.read_u16::<LittleEndian>()?,
                }
            }
            EVT_LE_CONN_UPDATE_COMPLETE => Event::LeConnectionUpdateComplete {
                status: c.read_u8()?,
                handle: read_handle(c)?,
                interval: c.read_u16::<LittleEndian>()?,
                latency: c.read_u16::<LittleEndian>()?,
                supervision_timeout: c.read_u16::<LittleEndian>()?,
            },
            EVT_LE_LTK_REQUEST => {
                let handle = read_handle(c)?;
                let mut random = [0u8; 8];
                c.read_exact(&mut random)?;
                Event::LeLongTermKeyRequest {
                    handle,
                    random,
                    ediv: c.read_u16::<LittleEndian>()?,
                }
            }
            _ => Event::Unknown(raw.clone()),
        };

        Ok(event)
    }

    /// Whether the event returns HCI command credits to the host
    pub fn command_credits(&self) -> Option<u8> {
        match self {
            Event::CommandComplete {
                num_hci_command_packets,
                ..
            }
            | Event::CommandStatus {
                num_hci_command_packets,
                ..
            } => Some(*num_hci_command_packets),
            _ => None,
        }
    }
}
