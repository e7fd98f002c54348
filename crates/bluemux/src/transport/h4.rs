//! H4 (UART) framing
//!
//! Every packet on the wire is a one byte packet indicator followed by the
//! HCI packet. The framer tracks where it is inside the current frame so
//! bytes can arrive in arbitrary chunks.

use crate::buffer::{PacketBuffer, PacketPool, PacketType, PoolError};
use crate::hci::constants::*;
use log::{debug, error, trace, warn};
use std::convert::TryFrom;

/// Framing counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct H4Stats {
    /// Frames delivered
    pub frames: u64,
    /// Bytes skipped because they were not a packet indicator
    pub invalid_type_bytes: u64,
    /// Frames discarded because the declared length did not fit a buffer
    pub oversized_frames: u64,
    /// Times a completed frame had to wait for a free buffer
    pub pool_stalls: u64,
}

impl H4Stats {
    /// All framing errors
    pub fn framing_errors(&self) -> u64 {
        self.invalid_type_bytes + self.oversized_frames
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    /// Waiting for a packet indicator
    Indicator,
    /// Collecting the type-specific header
    Header,
    /// Collecting `remaining` payload bytes
    Payload { remaining: usize },
    /// Frame complete, waiting for a pool buffer
    Complete,
}

fn header_size(packet_type: PacketType) -> usize {
    match packet_type {
        PacketType::Command => HCI_COMMAND_HEADER_SIZE,
        PacketType::Acl => HCI_ACL_HEADER_SIZE,
        PacketType::Sco => HCI_SCO_HEADER_SIZE,
        PacketType::Event => HCI_EVENT_HEADER_SIZE,
    }
}

fn payload_length(packet_type: PacketType, header: &[u8]) -> usize {
    match packet_type {
        PacketType::Command => header[2] as usize,
        PacketType::Acl => u16::from_le_bytes([header[2], header[3]]) as usize,
        PacketType::Sco => header[2] as usize,
        PacketType::Event => header[1] as usize,
    }
}

/// Incremental H4 deframer
pub struct H4Framer {
    state: FrameState,
    packet_type: PacketType,
    /// Bytes of the frame in progress, without the indicator
    frame: Vec<u8>,
    /// Set while skipping garbage, so a run of bad bytes logs once
    resyncing: bool,
    stats: H4Stats,
}

impl Default for H4Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl H4Framer {
    pub fn new() -> Self {
        Self {
            state: FrameState::Indicator,
            packet_type: PacketType::Event,
            frame: Vec::new(),
            resyncing: false,
            stats: H4Stats::default(),
        }
    }

    /// Feed bytes from the transport
    ///
    /// Consumes bytes up to the end of at most one frame and returns how many
    /// were consumed together with the completed packet, if any. While the
    /// pool has no buffer for a completed frame nothing further is consumed;
    /// the caller keeps the remaining bytes and feeds them again later.
    pub fn feed(&mut self, data: &[u8], pool: &mut PacketPool) -> (usize, Option<PacketBuffer>) {
        if self.state == FrameState::Complete {
            return (0, self.deliver(pool));
        }

        let mut consumed = 0;
        while consumed < data.len() {
            match self.state {
                FrameState::Indicator => {
                    let byte = data[consumed];
                    consumed += 1;
                    self.start_frame(byte);
                }
                FrameState::Header => {
                    let needed = header_size(self.packet_type) - self.frame.len();
                    let take = needed.min(data.len() - consumed);
                    self.frame.extend_from_slice(&data[consumed..consumed + take]);
                    consumed += take;

                    if self.frame.len() == header_size(self.packet_type) {
                        self.header_complete(pool);
                    }
                }
                FrameState::Payload { remaining } => {
                    let take = remaining.min(data.len() - consumed);
                    self.frame.extend_from_slice(&data[consumed..consumed + take]);
                    consumed += take;

                    self.state = if take == remaining {
                        FrameState::Complete
                    } else {
                        FrameState::Payload {
                            remaining: remaining - take,
                        }
                    };
                }
                FrameState::Complete => break,
            }

            if self.state == FrameState::Complete {
                return (consumed, self.deliver(pool));
            }
        }

        (consumed, None)
    }

    /// Whether a completed frame is waiting for a pool buffer
    pub fn is_stalled(&self) -> bool {
        self.state == FrameState::Complete
    }

    /// Drop any partial frame and wait for the next indicator
    pub fn reset(&mut self) {
        self.state = FrameState::Indicator;
        self.frame.clear();
        self.resyncing = false;
    }

    pub fn stats(&self) -> H4Stats {
        self.stats
    }

    fn start_frame(&mut self, byte: u8) {
        match PacketType::try_from(byte) {
            Ok(packet_type) => {
                if self.resyncing {
                    debug!("H4 resynchronised on {} indicator", packet_type);
                    self.resyncing = false;
                }
                self.packet_type = packet_type;
                self.frame.clear();
                self.state = FrameState::Header;
            }
            Err(byte) => {
                self.stats.invalid_type_bytes += 1;
                if !self.resyncing {
                    warn!("Invalid H4 packet indicator 0x{:02X}, resynchronising", byte);
                    self.resyncing = true;
                }
            }
        }
    }

    fn header_complete(&mut self, pool: &PacketPool) {
        let payload = payload_length(self.packet_type, &self.frame);
        let capacity = pool.buffer_size(self.packet_type);

        if self.frame.len() + payload > capacity {
            self.stats.oversized_frames += 1;
            warn!(
                "Discarding {} frame of {} bytes, buffer holds {}",
                self.packet_type,
                self.frame.len() + payload,
                capacity
            );
            self.frame.clear();
            self.resyncing = true;
            self.state = FrameState::Indicator;
        } else if payload == 0 {
            self.state = FrameState::Complete;
        } else {
            self.frame.reserve(payload);
            self.state = FrameState::Payload { remaining: payload };
        }
    }

    fn deliver(&mut self, pool: &mut PacketPool) -> Option<PacketBuffer> {
        let mut buffer = match pool.acquire(self.packet_type) {
            Ok(buffer) => buffer,
            Err(PoolError::Exhausted(_)) => {
                self.stats.pool_stalls += 1;
                trace!("{} pool exhausted, holding completed frame", self.packet_type);
                return None;
            }
            Err(err) => {
                error!("Unexpected pool error: {}", err);
                return None;
            }
        };

        if let Err(err) = buffer.fill(&self.frame) {
            // Lengths were checked against the buffer size in header_complete
            error!("Dropping {} frame: {}", self.packet_type, err);
            if let Err(err) = pool.release(buffer) {
                error!("Failed to release buffer: {}", err);
            }
            self.reset();
            return None;
        }

        self.stats.frames += 1;
        self.frame.clear();
        self.state = FrameState::Indicator;
        Some(buffer)
    }
}
