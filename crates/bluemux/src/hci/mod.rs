//! Bluetooth HCI (Host Controller Interface) layer
//!
//! Packet formats, the decoded event catalogue, the connection table and the
//! dispatcher that ties them to the packet pool.

pub mod connection;
pub mod constants;
pub mod dispatcher;
pub mod event;
pub mod packet;

#[cfg(test)]
mod tests;

pub use connection::{ConnectionRecord, ConnectionTable, LinkType};
pub use dispatcher::{ControllerBuffers, HciDispatcher, HciStats, HciTimer, Inbound};
pub use event::{Event, LeRole};
pub use packet::{AclHeader, AclPacket, HciCommand, HciEvent, ScoHeader};
