//! Type definitions for L2CAP operations
//!
//! This module contains core data structures used in L2CAP operations.

use super::constants::*;
use std::fmt;
use thiserror::Error;

/// Error types specific to L2CAP operations
#[derive(Debug, Error)]
pub enum L2capError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Channel not found")]
    ChannelNotFound,

    #[error("Operation not supported")]
    NotSupported,

    #[error("Invalid state for operation")]
    InvalidState,

    #[error("MTU exceeded: {len} > {mtu}")]
    MtuExceeded { len: usize, mtu: usize },

    #[error("Credit window overflow")]
    CreditOverflow,

    #[error("Resource limit reached")]
    ResourceLimitReached,

    #[error("PSM 0x{0:04X} is not valid")]
    InvalidPsm(u16),

    #[error("No handler registered for CID 0x{0:04X}")]
    FixedChannelNotRegistered(u16),

    #[error("HCI error: {0}")]
    HciError(#[from] crate::error::HciError),

    #[error("Connection not established")]
    NotConnected,
}

/// Result type for L2CAP operations
pub type L2capResult<T> = std::result::Result<T, L2capError>;

/// L2CAP Configuration Options understood by the basic mode engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOptions {
    /// Maximum Transmission Unit
    pub mtu: Option<u16>,
    /// Flush Timeout
    pub flush_timeout: Option<u16>,
    /// Mode requested by a Retransmission and Flow Control option
    pub rfc_mode: Option<u8>,
    /// Types of options that were neither understood nor hints
    pub unknown: Vec<u8>,
}

/// L2CAP Channel State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2capChannelState {
    /// Channel is closed
    Closed,
    /// Channel is waiting for a connection response
    WaitConnectRsp,
    /// Channel is exchanging configuration
    WaitConfig,
    /// Channel is open and ready for data transfer
    Open,
    /// Channel is waiting for a disconnection response
    WaitDisconnect,
}

impl fmt::Display for L2capChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::WaitConnectRsp => write!(f, "Waiting for connection response"),
            Self::WaitConfig => write!(f, "Waiting for configuration"),
            Self::Open => write!(f, "Open"),
            Self::WaitDisconnect => write!(f, "Waiting for disconnection"),
        }
    }
}

/// Why a dynamic channel closed or failed to open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed through [`super::L2capManager::disconnect`]
    LocalRequest,
    /// The peer sent a Disconnection Request
    RemoteRequest,
    /// The underlying HCI connection went away
    LinkDisconnected,
    /// A signaling request got no answer in time
    Timeout,
    /// The peer granted credits past 0xFFFF
    CreditOverflow,
    /// The peer broke the channel's framing or flow control rules
    ProtocolError,
    /// The peer refused the connection with this result code
    Refused(u16),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalRequest => write!(f, "local request"),
            Self::RemoteRequest => write!(f, "remote request"),
            Self::LinkDisconnected => write!(f, "link disconnected"),
            Self::Timeout => write!(f, "signaling timeout"),
            Self::CreditOverflow => write!(f, "credit overflow"),
            Self::ProtocolError => write!(f, "protocol error"),
            Self::Refused(result) => write!(f, "refused (0x{:04X})", result),
        }
    }
}

/// L2CAP Connection Parameter Update request structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionParameterUpdate {
    /// Minimum connection interval (1.25ms units)
    pub conn_interval_min: u16,
    /// Maximum connection interval (1.25ms units)
    pub conn_interval_max: u16,
    /// Peripheral latency (number of events)
    pub conn_latency: u16,
    /// Connection supervision timeout (10ms units)
    pub supervision_timeout: u16,
}

impl ConnectionParameterUpdate {
    /// Whether the parameters are legal and inside `range`
    pub fn validate(&self, range: &ConnectionParameterRange) -> bool {
        let legal = self.conn_interval_min >= LE_CONN_INTERVAL_MIN
            && self.conn_interval_max <= LE_CONN_INTERVAL_MAX
            && self.conn_interval_min <= self.conn_interval_max
            && self.conn_latency <= LE_CONN_LATENCY_MAX
            && self.supervision_timeout >= LE_SUPERVISION_TIMEOUT_MIN
            && self.supervision_timeout <= LE_SUPERVISION_TIMEOUT_MAX;

        let acceptable = self.conn_interval_min >= range.interval_min
            && self.conn_interval_max <= range.interval_max
            && self.conn_latency <= range.latency_max
            && self.supervision_timeout >= range.supervision_timeout_min
            && self.supervision_timeout <= range.supervision_timeout_max;

        // Timeout in ms must exceed (1 + latency) * interval_max * 2
        let relation = (self.supervision_timeout as u32) * 4
            > (self.conn_interval_max as u32) * (self.conn_latency as u32 + 1);

        legal && acceptable && relation
    }
}

/// Connection parameters a central accepts from a peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionParameterRange {
    pub interval_min: u16,
    pub interval_max: u16,
    pub latency_max: u16,
    pub supervision_timeout_min: u16,
    pub supervision_timeout_max: u16,
}

impl Default for ConnectionParameterRange {
    fn default() -> Self {
        Self {
            interval_min: LE_CONN_INTERVAL_MIN,
            interval_max: LE_CONN_INTERVAL_MAX,
            latency_max: LE_CONN_LATENCY_MAX,
            supervision_timeout_min: LE_SUPERVISION_TIMEOUT_MIN,
            supervision_timeout_max: LE_SUPERVISION_TIMEOUT_MAX,
        }
    }
}

/// LE Credit-Based Connection configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeCreditBasedConfig {
    /// Largest SDU we accept
    pub mtu: u16,
    /// Largest K-frame payload we accept
    pub mps: u16,
    /// Credits granted to the peer when the channel opens
    pub initial_credits: u16,
    /// Automatic credit return tops the peer back up below this many
    pub low_watermark: u16,
}

impl Default for LeCreditBasedConfig {
    fn default() -> Self {
        Self {
            mtu: 256,
            mps: 247,
            initial_credits: 8,
            low_watermark: 2,
        }
    }
}

/// L2CAP Security Level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum SecurityLevel {
    /// No security (no authentication, no encryption)
    #[default]
    None = 0,
    /// Authentication required
    Authentication = 1,
    /// Authentication and encryption required
    AuthenticationAndEncryption = 2,
    /// Secure Connections required with encryption
    SecureConnectionsWithEncryption = 3,
}

/// Policy applied to incoming connections for a registered PSM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionPolicy {
    /// Minimum required security level
    ///
    /// Anything above [`SecurityLevel::None`] needs an encrypted link; the
    /// multiplexer does not see how the key was generated.
    pub min_security_level: SecurityLevel,
}

impl ConnectionPolicy {
    pub fn new(min_security_level: SecurityLevel) -> Self {
        Self { min_security_level }
    }

    /// Whether a link with the given encryption state satisfies the policy
    pub fn allows(&self, encrypted: bool) -> bool {
        self.min_security_level == SecurityLevel::None || encrypted
    }
}
