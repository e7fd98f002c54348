//! HCI packet structures and parsing
//!
//! This module contains structures and methods for handling HCI packets.

use crate::gap::BdAddr;
use crate::hci::constants::*;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// HCI commands issued by the stack
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HciCommand {
    // Link Control Commands (OGF: 0x01)
    Disconnect { handle: u16, reason: u8 },
    LinkKeyRequestReply { bd_addr: BdAddr, link_key: [u8; 16] },
    LinkKeyRequestNegativeReply { bd_addr: BdAddr },

    // Host Controller Commands (OGF: 0x03)
    Reset,
    SetEventMask { event_mask: u64 },

    // Informational Parameters (OGF: 0x04)
    ReadBufferSize,

    // LE Commands (OGF: 0x08)
    LeReadBufferSize,
    LeConnectionUpdate {
        handle: u16,
        interval_min: u16,
        interval_max: u16,
        latency: u16,
        supervision_timeout: u16,
        min_ce_length: u16,
        max_ce_length: u16,
    },
    LeLongTermKeyRequestReply { handle: u16, long_term_key: [u8; 16] },
    LeLongTermKeyRequestNegativeReply { handle: u16 },

    /// Any other command, given as OGF/OCF and raw parameters
    Raw { ogf: u8, ocf: u16, parameters: Vec<u8> },
}

impl HciCommand {
    /// Build a raw command from its opcode parts and parameters
    pub fn new(ogf: u8, ocf: u16, parameters: Vec<u8>) -> Self {
        Self::Raw { ogf, ocf, parameters }
    }

    /// Get the OGF and OCF for this command
    pub fn opcode_parts(&self) -> (u8, u16) {
        match self {
            // Link Control Commands
            Self::Disconnect { .. } => (OGF_LINK_CTL, OCF_DISCONNECT),
            Self::LinkKeyRequestReply { .. } => (OGF_LINK_CTL, OCF_LINK_KEY_REQUEST_REPLY),
            Self::LinkKeyRequestNegativeReply { .. } => (OGF_LINK_CTL, OCF_LINK_KEY_REQUEST_NEGATIVE_REPLY),

            // Host Controller Commands
            Self::Reset => (OGF_HOST_CTL, OCF_RESET),
            Self::SetEventMask { .. } => (OGF_HOST_CTL, OCF_SET_EVENT_MASK),

            Self::ReadBufferSize => (OGF_INFO_PARAM, OCF_READ_BUFFER_SIZE),

            // LE Commands
            Self::LeReadBufferSize => (OGF_LE, OCF_LE_READ_BUFFER_SIZE),
            Self::LeConnectionUpdate { .. } => (OGF_LE, OCF_LE_CONNECTION_UPDATE),
            Self::LeLongTermKeyRequestReply { .. } => (OGF_LE, OCF_LE_LONG_TERM_KEY_REQUEST_REPLY),
            Self::LeLongTermKeyRequestNegativeReply { .. } => (OGF_LE, OCF_LE_LONG_TERM_KEY_REQUEST_NEGATIVE_REPLY),

            Self::Raw { ogf, ocf, .. } => (*ogf, *ocf),
        }
    }

    /// Combined 16 bit opcode
    pub fn opcode(&self) -> u16 {
        let (ogf, ocf) = self.opcode_parts();
        ((ogf as u16) << 10) | (ocf & 0x3ff)
    }

    /// Convert the command to its raw parameter bytes
    pub fn parameters(&self) -> Vec<u8> {
        match self {
            Self::Reset | Self::ReadBufferSize | Self::LeReadBufferSize => vec![],

            Self::Disconnect { handle, reason } => {
                let mut params = Vec::with_capacity(3);
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(*reason);
                params
            }

            Self::LinkKeyRequestReply { bd_addr, link_key } => {
                let mut params = Vec::with_capacity(22);
                params.extend_from_slice(bd_addr.as_slice());
                params.extend_from_slice(link_key);
                params
            }

            Self::LinkKeyRequestNegativeReply { bd_addr } => bd_addr.as_slice().to_vec(),

            Self::SetEventMask { event_mask } => event_mask.to_le_bytes().to_vec(),

            Self::LeConnectionUpdate {
                handle,
                interval_min,
                interval_max,
                latency,
                supervision_timeout,
                min_ce_length,
                max_ce_length,
            } => {
                let mut params = Vec::with_capacity(14);
                for value in [
                    *handle,
                    *interval_min,
                    *interval_max,
                    *latency,
                    *supervision_timeout,
                    *min_ce_length,
                    *max_ce_length,
                ] {
                    // Writing into a Vec cannot fail
                    let _ = params.write_u16::<LittleEndian>(value);
                }
                params
            }

            Self::LeLongTermKeyRequestReply { handle, long_term_key } => {
                let mut params = Vec::with_capacity(18);
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(long_term_key);
                params
            }

            Self::LeLongTermKeyRequestNegativeReply { handle } => handle.to_le_bytes().to_vec(),

            Self::Raw { parameters, .. } => parameters.clone(),
        }
    }

    /// Serialize the command without the H4 packet indicator
    pub fn to_bytes(&self) -> Vec<u8> {
        let params = self.parameters();

        let mut packet = Vec::with_capacity(HCI_COMMAND_HEADER_SIZE + params.len());
        packet.extend_from_slice(&self.opcode().to_le_bytes());
        packet.push(params.len() as u8);
        packet.extend_from_slice(&params);
        packet
    }

    /// Convert the command to a raw H4 packet
    pub fn to_packet(&self) -> Vec<u8> {
        let mut packet = vec![HCI_COMMAND_PKT];
        packet.extend_from_slice(&self.to_bytes());
        packet
    }
}

/// HCI Event packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HciEvent {
    pub event_code: u8,
    pub parameter_total_length: u8,
    pub parameters: Vec<u8>,
}

impl HciEvent {
    /// Build an event from its code and parameters
    pub fn new(event_code: u8, parameters: Vec<u8>) -> Self {
        Self {
            event_code,
            parameter_total_length: parameters.len() as u8,
            parameters,
        }
    }

    /// Parse an HCI event from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HCI_EVENT_HEADER_SIZE {
            return None;
        }

        let event_code = data[0];
        let parameter_total_length = data[1];

        if data.len() < (parameter_total_length as usize + HCI_EVENT_HEADER_SIZE) {
            return None;
        }

        let parameters = data[HCI_EVENT_HEADER_SIZE..(parameter_total_length as usize + HCI_EVENT_HEADER_SIZE)].to_vec();

        Some(HciEvent {
            event_code,
            parameter_total_length,
            parameters,
        })
    }

    /// Serialize the event without the H4 packet indicator
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HCI_EVENT_HEADER_SIZE + self.parameters.len());
        bytes.push(self.event_code);
        bytes.push(self.parameters.len() as u8);
        bytes.extend_from_slice(&self.parameters);
        bytes
    }
}

/// HCI ACL data packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclHeader {
    /// Connection handle (12 bits)
    pub handle: u16,
    /// Packet boundary flag (2 bits)
    pub packet_boundary: u8,
    /// Broadcast flag (2 bits)
    pub broadcast: u8,
    /// Length of the data following the header
    pub data_length: u16,
}

impl AclHeader {
    /// Create a new point-to-point ACL header
    pub fn new(handle: u16, packet_boundary: u8, data_length: u16) -> Self {
        Self {
            handle: handle & HCI_HANDLE_MASK,
            packet_boundary: packet_boundary & 0x03,
            broadcast: 0,
            data_length,
        }
    }

    /// Parse an ACL header from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HCI_ACL_HEADER_SIZE {
            return None;
        }

        let mut cursor = Cursor::new(data);
        let handle_and_flags = cursor.read_u16::<LittleEndian>().ok()?;
        let data_length = cursor.read_u16::<LittleEndian>().ok()?;

        Some(Self {
            handle: handle_and_flags & HCI_HANDLE_MASK,
            packet_boundary: ((handle_and_flags >> 12) & 0x03) as u8,
            broadcast: ((handle_and_flags >> 14) & 0x03) as u8,
            data_length,
        })
    }

    /// Serialize the header to bytes
    pub fn to_bytes(&self) -> [u8; HCI_ACL_HEADER_SIZE] {
        let handle_and_flags = (self.handle & HCI_HANDLE_MASK)
            | ((self.packet_boundary as u16 & 0x03) << 12)
            | ((self.broadcast as u16 & 0x03) << 14);

        let mut result = [0u8; HCI_ACL_HEADER_SIZE];
        result[0..2].copy_from_slice(&handle_and_flags.to_le_bytes());
        result[2..4].copy_from_slice(&self.data_length.to_le_bytes());
        result
    }

    /// Whether this fragment starts a new L2CAP PDU
    pub fn is_start(&self) -> bool {
        self.packet_boundary != ACL_PB_CONTINUING
    }
}

/// A view of an ACL packet held in a buffer
#[derive(Debug, Clone, Copy)]
pub struct AclPacket<'a> {
    pub header: AclHeader,
    pub payload: &'a [u8],
}

impl<'a> AclPacket<'a> {
    /// Parse an ACL packet, checking the declared length against the data
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        let header = AclHeader::parse(data)?;
        let end = HCI_ACL_HEADER_SIZE + header.data_length as usize;
        if data.len() < end {
            return None;
        }

        Some(Self {
            header,
            payload: &data[HCI_ACL_HEADER_SIZE..end],
        })
    }
}

/// HCI SCO data packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoHeader {
    /// Connection handle (12 bits)
    pub handle: u16,
    /// Packet status flag (2 bits)
    pub packet_status: u8,
    /// Length of the data following the header
    pub data_length: u8,
}

impl ScoHeader {
    /// Parse a SCO header from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HCI_SCO_HEADER_SIZE {
            return None;
        }

        let handle_and_flags = u16::from_le_bytes([data[0], data[1]]);
        Some(Self {
            handle: handle_and_flags & HCI_HANDLE_MASK,
            packet_status: ((handle_and_flags >> 12) & 0x03) as u8,
            data_length: data[2],
        })
    }

    /// Serialize the header to bytes
    pub fn to_bytes(&self) -> [u8; HCI_SCO_HEADER_SIZE] {
        let handle_and_flags = (self.handle & HCI_HANDLE_MASK) | ((self.packet_status as u16 & 0x03) << 12);
        let bytes = handle_and_flags.to_le_bytes();
        [bytes[0], bytes[1], self.data_length]
    }
}
