//! Transport boundary
//!
//! A transport moves raw H4 bytes between the host and the controller. The
//! [`H4Framer`] turns the inbound byte stream into packet buffers; outbound
//! packets are written as an indicator byte followed by the packet.

pub mod h4;
#[cfg(target_os = "linux")]
pub mod socket;

#[cfg(test)]
mod tests;

pub use h4::{H4Framer, H4Stats};
#[cfg(target_os = "linux")]
pub use socket::H4Socket;

use std::io;
use std::time::Duration;

/// Byte stream to and from the controller
pub trait Transport {
    /// Write H4 framed bytes, returning how many were accepted.
    ///
    /// `ErrorKind::WouldBlock` means the transport is not writable right now.
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Read whatever bytes are available.
    ///
    /// Returns 0 when nothing is pending; `ErrorKind::WouldBlock` is treated
    /// the same way.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Block until bytes are readable or `timeout` elapses.
    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<bool>;

    /// Whether a write would be accepted now
    fn can_send(&self) -> bool {
        true
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        (**self).write(data)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        (**self).wait(timeout)
    }

    fn can_send(&self) -> bool {
        (**self).can_send()
    }
}
