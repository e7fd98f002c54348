//! Packet pool and packet buffers
//!
//! Every HCI packet that moves through the stack lives in a [`PacketBuffer`]
//! taken from a fixed-capacity [`PacketPool`]. Each packet type has its own
//! class of slots, mirroring the separate buffer classes of a controller.

pub mod pool;
#[cfg(test)]
mod tests;

pub use self::pool::{PacketBuffer, PacketPool, PacketType, PoolError};
