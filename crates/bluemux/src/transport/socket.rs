//! Linux HCI user channel transport
//!
//! The user channel gives exclusive access to a controller that is down in
//! the kernel. Reads and writes carry H4 framed packets, one per syscall.

use crate::error::HciError;
use crate::run_loop::DataSource;
use crate::transport::Transport;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

// Bluetooth socket constants
const AF_BLUETOOTH: i32 = 31;
const BTPROTO_HCI: i32 = 1;
const HCI_CHANNEL_USER: u16 = 1;

#[repr(C)]
struct SockaddrHci {
    hci_family: libc::sa_family_t,
    hci_dev: u16,
    hci_channel: u16,
}

/// HCI user channel socket
#[derive(Debug)]
pub struct H4Socket {
    fd: RawFd,
}

impl H4Socket {
    /// Open the user channel of an HCI device
    ///
    /// # Arguments
    ///
    /// * `dev_id` - The device ID to open (0 for hci0)
    pub fn open(dev_id: u16) -> Result<Self, HciError> {
        let fd = unsafe {
            libc::socket(
                AF_BLUETOOTH,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                BTPROTO_HCI,
            )
        };

        if fd < 0 {
            return Err(HciError::Io(io::Error::last_os_error()));
        }

        let addr = SockaddrHci {
            hci_family: AF_BLUETOOTH as libc::sa_family_t,
            hci_dev: dev_id,
            hci_channel: HCI_CHANNEL_USER,
        };

        let result = unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<SockaddrHci>() as libc::socklen_t,
            )
        };

        if result < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(HciError::BindError(err));
        }

        Ok(H4Socket { fd })
    }

    fn poll(&self, events: libc::c_short, timeout: Option<Duration>) -> io::Result<bool> {
        let mut pollfd = libc::pollfd {
            fd: self.fd,
            events,
            revents: 0,
        };
        let timeout_ms = match timeout {
            Some(timeout) => timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
            None => -1,
        };

        let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }
        if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "HCI socket closed"));
        }

        Ok(result > 0 && pollfd.revents & events != 0)
    }
}

impl Transport for H4Socket {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let written = unsafe { libc::write(self.fd, data.as_ptr() as *const libc::c_void, data.len()) };
        if written < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(written as usize)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if read < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(read as usize)
    }

    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        self.poll(libc::POLLIN, timeout)
    }

    fn can_send(&self) -> bool {
        self.poll(libc::POLLOUT, Some(Duration::ZERO)).unwrap_or(false)
    }
}

impl DataSource for H4Socket {
    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        Transport::wait(self, timeout)
    }
}

impl AsRawFd for H4Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for H4Socket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
