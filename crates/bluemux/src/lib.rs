//! bluemux - HCI and L2CAP multiplexing for Bluetooth hosts
//!
//! This library sits between an H4 byte stream to a Bluetooth controller and
//! the host protocols above L2CAP. It frames and classifies HCI packets,
//! keeps controller credits and the connection table, recombines and
//! fragments ACL data, and multiplexes fixed and dynamic L2CAP channels
//! (including LE credit-based channels) over each connection.
//!
//! Everything runs on a single thread around a [`Stack`], which owns the
//! transport, the packet pool, the dispatcher, the L2CAP manager and the
//! run loop's timers.

pub mod buffer;
pub mod config;
pub mod error;
pub mod gap;
pub mod hci;
pub mod l2cap;
pub mod run_loop;
pub mod stack;
pub mod storage;
pub mod transport;

// Re-export common types for convenience
pub use buffer::{PacketBuffer, PacketPool, PacketType, PoolError};
pub use config::{PoolConfig, StackConfig};
pub use error::{Error, HciError, HciResult, Result};
pub use gap::{AddressType, BdAddr};
pub use hci::{Event, HciCommand, HciDispatcher, HciEvent, LinkType};
pub use l2cap::{
    ChannelEvent, FixedChannelHandler, FixedChannelSender, L2capChannel, L2capChannelType, L2capError, L2capManager,
    LeCreditBasedConfig,
};
pub use run_loop::{DataSource, RunLoop, TimerId};
pub use stack::{ScoHandler, Stack, StackEvent, StackEventCallback, StackTimer};
pub use storage::{KeyStore, MemoryKeyStore};
pub use transport::{H4Framer, Transport};

#[cfg(target_os = "linux")]
pub use transport::H4Socket;
