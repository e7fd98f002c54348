//! L2CAP (Logical Link Control and Adaptation Protocol) implementation
//!
//! This module provides the L2CAP implementation, which is responsible for:
//! - Recombining ACL fragments into L2CAP PDUs
//! - Multiplexing fixed and dynamic channels over one connection
//! - The signaling channels of BR/EDR and LE links
//! - Segmentation, reassembly and credits of LE credit-based channels

pub mod channel;
pub mod constants;
pub mod core;
pub mod fifo;
pub mod packet;
pub mod psm;
pub mod signaling;
pub mod types;

// Re-export the public API
pub use self::channel::{CreditWindow, L2capChannel, L2capChannelType};
pub use self::core::{
    ChannelEvent, ChannelEventCallback, FixedChannelHandler, FixedChannelSender, L2capManager, L2capTimer,
};
pub use self::fifo::{FixedChannelFifo, FixedChannelKey};
pub use self::signaling::{ExtendedFeatures, FixedChannels, SignalId, SignalingMessage};
pub use self::types::*;
