//! Stack configuration
//!
//! Every capacity in the stack is fixed when the stack is built. The values
//! here size the packet pools and tables and set the protocol timeouts.

use crate::error::{Error, Result};
use crate::hci::constants::{
    HCI_ACL_HEADER_SIZE, HCI_COMMAND_HEADER_SIZE, HCI_DEFAULT_EVENT_MASK, HCI_EVENT_HEADER_SIZE, HCI_SCO_HEADER_SIZE,
};
use crate::l2cap::constants::*;
use crate::l2cap::types::{ConnectionParameterRange, LeCreditBasedConfig};
use std::time::Duration;

/// Number of slots and slot size of each packet pool class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Command buffers
    pub command_buffers: usize,
    /// Event buffers
    pub event_buffers: usize,
    /// ACL buffers
    pub acl_buffers: usize,
    /// SCO buffers
    pub sco_buffers: usize,
    /// Largest ACL payload a single buffer can hold (excluding the 4 byte header)
    pub acl_payload_size: usize,
    /// Largest SCO payload a single buffer can hold (excluding the 3 byte header)
    pub sco_payload_size: usize,
}

impl PoolConfig {
    /// Size in bytes of one command buffer
    pub fn command_buffer_size(&self) -> usize {
        HCI_COMMAND_HEADER_SIZE + 255
    }

    /// Size in bytes of one event buffer
    pub fn event_buffer_size(&self) -> usize {
        HCI_EVENT_HEADER_SIZE + 255
    }

    /// Size in bytes of one ACL buffer
    pub fn acl_buffer_size(&self) -> usize {
        HCI_ACL_HEADER_SIZE + self.acl_payload_size
    }

    /// Size in bytes of one SCO buffer
    pub fn sco_buffer_size(&self) -> usize {
        HCI_SCO_HEADER_SIZE + self.sco_payload_size
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            command_buffers: 2,
            event_buffers: 4,
            acl_buffers: 8,
            sco_buffers: 2,
            acl_payload_size: 1021,
            sco_payload_size: 255,
        }
    }
}

/// Configuration for a [`crate::Stack`] instance
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Packet pool sizing
    pub pool: PoolConfig,
    /// Maximum number of simultaneous baseband/LE/SCO connections
    pub max_connections: usize,
    /// Maximum number of dynamic L2CAP channels across all connections
    pub max_channels: usize,
    /// Controller ACL buffers assumed until the controller reports its own
    pub default_acl_credits: u16,
    /// Controller SCO buffers assumed until the controller reports its own
    pub default_sco_credits: u16,
    /// L2CAP signaling response timeout (RTX)
    pub signaling_timeout: Duration,
    /// Time allowed for the controller to answer an HCI command
    pub command_timeout: Duration,
    /// Event mask sent with Set Event Mask during initialization
    pub event_mask: u64,
    /// Local MTU offered on Classic basic mode channels
    pub classic_mtu: u16,
    /// Largest PDU accepted on a fixed channel (ATT, SM, ...)
    pub fixed_channel_mtu: u16,
    /// Defaults for LE credit-based channels
    pub le_credit: LeCreditBasedConfig,
    /// Return receive credits automatically once the peer's window runs low
    pub automatic_credits: bool,
    /// LE connection parameters accepted from a peripheral's update request
    pub connection_parameter_range: ConnectionParameterRange,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            max_connections: 4,
            max_channels: 8,
            default_acl_credits: 1,
            default_sco_credits: 0,
            signaling_timeout: Duration::from_millis(L2CAP_RTX_TIMEOUT_MS),
            command_timeout: Duration::from_secs(2),
            event_mask: HCI_DEFAULT_EVENT_MASK,
            classic_mtu: L2CAP_DEFAULT_MTU,
            fixed_channel_mtu: L2CAP_FIXED_CHANNEL_MTU,
            le_credit: LeCreditBasedConfig::default(),
            automatic_credits: true,
            connection_parameter_range: ConnectionParameterRange::default(),
        }
    }
}

impl StackConfig {
    /// Check the configuration for values the stack cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.pool.command_buffers == 0 || self.pool.event_buffers == 0 || self.pool.acl_buffers == 0 {
            return Err(Error::Config("command, event and ACL pools need at least one buffer".into()));
        }
        if self.pool.acl_payload_size < L2CAP_BASIC_HEADER_SIZE + 1 {
            return Err(Error::Config(format!(
                "ACL payload size {} cannot carry an L2CAP header",
                self.pool.acl_payload_size
            )));
        }
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".into()));
        }
        if self.classic_mtu < L2CAP_MINIMAL_MTU {
            return Err(Error::Config(format!("classic MTU must be at least {}", L2CAP_MINIMAL_MTU)));
        }
        if self.le_credit.mtu < L2CAP_LE_DEFAULT_MTU || self.le_credit.mps < L2CAP_LE_DEFAULT_MTU {
            return Err(Error::Config(format!(
                "LE credit-based MTU and MPS must be at least {}",
                L2CAP_LE_DEFAULT_MTU
            )));
        }
        if self.le_credit.mps > L2CAP_LE_MAX_MPS {
            return Err(Error::Config(format!("LE credit-based MPS must not exceed {}", L2CAP_LE_MAX_MPS)));
        }
        if self.le_credit.initial_credits == 0 {
            return Err(Error::Config("LE credit-based channels need at least one initial credit".into()));
        }
        if self.signaling_timeout.is_zero() || self.command_timeout.is_zero() {
            return Err(Error::Config("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = StackConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.signaling_timeout, Duration::from_secs(10));
        assert_eq!(config.pool.acl_buffer_size(), 1025);
        assert_eq!(config.pool.event_buffer_size(), 257);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = StackConfig::default();
        config.pool.acl_buffers = 0;
        assert!(config.validate().is_err());

        let mut config = StackConfig::default();
        config.le_credit.initial_credits = 0;
        assert!(config.validate().is_err());

        let mut config = StackConfig::default();
        config.classic_mtu = 20;
        assert!(config.validate().is_err());
    }
}
