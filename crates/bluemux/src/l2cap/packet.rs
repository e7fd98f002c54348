//! L2CAP Packet handling
//!
//! This module provides structures and functions for handling L2CAP packets:
//! the basic header, signaling command headers and the K-frame segmentation
//! used by credit-based channels.

use super::constants::*;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// L2CAP Packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capHeader {
    /// Length of the L2CAP payload in bytes
    pub length: u16,
    /// Channel Identifier
    pub channel_id: u16,
}

impl L2capHeader {
    /// Create a new L2CAP header
    pub fn new(length: u16, channel_id: u16) -> Self {
        Self { length, channel_id }
    }

    /// Parse an L2CAP header from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < L2CAP_BASIC_HEADER_SIZE {
            return None;
        }

        let mut cursor = Cursor::new(data);
        let length = cursor.read_u16::<LittleEndian>().ok()?;
        let channel_id = cursor.read_u16::<LittleEndian>().ok()?;

        Some(Self { length, channel_id })
    }

    /// Serialize the header to bytes
    pub fn to_bytes(&self) -> [u8; L2CAP_BASIC_HEADER_SIZE] {
        let mut result = [0u8; L2CAP_BASIC_HEADER_SIZE];
        LittleEndian::write_u16(&mut result[0..2], self.length);
        LittleEndian::write_u16(&mut result[2..4], self.channel_id);
        result
    }

    /// Size of the whole PDU this header starts
    pub fn pdu_size(&self) -> usize {
        L2CAP_BASIC_HEADER_SIZE + self.length as usize
    }
}

/// Represents a full L2CAP packet with header and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L2capPacket {
    /// L2CAP header
    pub header: L2capHeader,
    /// Payload data
    pub payload: Vec<u8>,
}

impl L2capPacket {
    /// Create a new L2CAP packet
    pub fn new(channel_id: u16, payload: Vec<u8>) -> Self {
        Self {
            header: L2capHeader::new(payload.len() as u16, channel_id),
            payload,
        }
    }

    /// Parse a complete L2CAP packet from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        let header = L2capHeader::parse(data)?;
        if data.len() < header.pdu_size() {
            return None;
        }

        Some(Self {
            header,
            payload: data[L2CAP_BASIC_HEADER_SIZE..header.pdu_size()].to_vec(),
        })
    }

    /// Serialize the L2CAP packet to a byte vector
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.size());
        result.extend_from_slice(&self.header.to_bytes());
        result.extend_from_slice(&self.payload);
        result
    }

    /// Get the full size of the packet in bytes
    pub fn size(&self) -> usize {
        self.header.pdu_size()
    }
}

/// Build a basic frame for `channel_id` around `payload`
pub fn build_pdu(channel_id: u16, payload: &[u8]) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(L2CAP_BASIC_HEADER_SIZE + payload.len());
    pdu.extend_from_slice(&L2capHeader::new(payload.len() as u16, channel_id).to_bytes());
    pdu.extend_from_slice(payload);
    pdu
}

/// Cut an SDU into K-frames for a credit-based channel
///
/// Every K-frame payload is at most `mps` bytes. The first one starts with
/// the 2 byte SDU length, so it carries `mps - 2` bytes of the SDU. An empty
/// SDU still produces one K-frame.
pub fn segment_sdu(channel_id: u16, sdu: &[u8], mps: usize) -> Vec<Vec<u8>> {
    let mps = mps.max(L2CAP_SDU_LENGTH_SIZE + 1);
    let mut frames = Vec::with_capacity(sdu.len() / mps + 1);

    let first_len = sdu.len().min(mps - L2CAP_SDU_LENGTH_SIZE);
    let mut first = Vec::with_capacity(L2CAP_SDU_LENGTH_SIZE + first_len);
    first.extend_from_slice(&(sdu.len() as u16).to_le_bytes());
    first.extend_from_slice(&sdu[..first_len]);
    frames.push(build_pdu(channel_id, &first));

    for chunk in sdu[first_len..].chunks(mps) {
        frames.push(build_pdu(channel_id, chunk));
    }
    frames
}

/// L2CAP Command header used in signaling packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capCommandHeader {
    /// Command code
    pub code: u8,
    /// Command identifier
    pub identifier: u8,
    /// Length of command parameters
    pub length: u16,
}

impl L2capCommandHeader {
    /// Create a new command header
    pub fn new(code: u8, identifier: u8, length: u16) -> Self {
        Self {
            code,
            identifier,
            length,
        }
    }

    /// Parse a command header from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < L2CAP_SIGNALING_HEADER_SIZE {
            return None;
        }

        Some(Self {
            code: data[0],
            identifier: data[1],
            length: LittleEndian::read_u16(&data[2..4]),
        })
    }

    /// Serialize the command header to bytes
    pub fn to_bytes(&self) -> [u8; L2CAP_SIGNALING_HEADER_SIZE] {
        let mut result = [0u8; L2CAP_SIGNALING_HEADER_SIZE];
        result[0] = self.code;
        result[1] = self.identifier;
        LittleEndian::write_u16(&mut result[2..4], self.length);
        result
    }

    /// Size of the command including its header
    pub fn command_size(&self) -> usize {
        L2CAP_SIGNALING_HEADER_SIZE + self.length as usize
    }
}
