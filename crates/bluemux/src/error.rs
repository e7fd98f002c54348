//! Error types for the bluemux library
//!
//! This module defines the HCI-level error type and the crate-level
//! [`Error`] that wraps the errors of every layer.

use crate::buffer::PoolError;
use crate::l2cap::L2capError;
use thiserror::Error;

/// Errors that can occur on the HCI transport and dispatcher
#[derive(Error, Debug)]
pub enum HciError {
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to HCI device: {0}")]
    BindError(std::io::Error),

    #[error("Invalid parameter length: {0}")]
    InvalidParamLength(usize),

    #[error("Invalid HCI packet format")]
    InvalidPacketFormat,

    #[error("Invalid H4 packet indicator: 0x{0:02X}")]
    InvalidPacketType(u8),

    #[error("Unknown connection handle: 0x{0:04X}")]
    UnknownConnectionHandle(u16),

    #[error("Connection table full")]
    ConnectionTableFull,

    #[error("Packet of {len} bytes exceeds buffer capacity of {capacity}")]
    PacketTooLarge { len: usize, capacity: usize },

    #[error("Packet pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Unsupported operation")]
    Unsupported,
}

/// Result type for HCI operations
pub type HciResult<T> = std::result::Result<T, HciError>;

/// Top-level error returned by [`crate::Stack`] operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("HCI error: {0}")]
    Hci(#[from] HciError),

    #[error("L2CAP error: {0}")]
    L2cap(#[from] L2capError),

    #[error("Packet pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Result type for stack operations
pub type Result<T> = std::result::Result<T, Error>;
