//! Byte channels to a device.
//!
//! A [`Transport`] moves raw bytes and knows nothing about the REPL. Serial
//! and websocket links live outside this crate and plug in through the same
//! trait.

use std::io;
use std::time::Duration;

#[cfg(test)]
pub(crate) mod emulator;
mod process;
mod tcp;

pub use process::ProcessTransport;
pub use tcp::TcpTransport;

/// A blocking byte channel to a device.
pub trait Transport: Send + std::fmt::Debug {
    /// Opens (or reopens) the channel.
    fn open(&mut self) -> io::Result<()>;

    /// Closes the channel. Closing a closed channel is a no-op.
    fn close(&mut self);

    /// Reads up to `max` bytes, waiting at most `timeout` for the first one.
    ///
    /// Returns an empty buffer when nothing arrived in time. A closed peer is
    /// an error, not an empty read.
    fn read(&mut self, max: usize, timeout: Duration) -> io::Result<Vec<u8>>;

    /// Writes all of `data`.
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Whether the link stays up across a device soft reset.
    fn survives_soft_reset(&self) -> bool {
        true
    }

    /// Short human-readable description of the endpoint.
    fn describe(&self) -> String;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self) -> io::Result<()> {
        (**self).open()
    }

    fn close(&mut self) {
        (**self).close();
    }

    fn read(&mut self, max: usize, timeout: Duration) -> io::Result<Vec<u8>> {
        (**self).read(max, timeout)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        (**self).write(data)
    }

    fn survives_soft_reset(&self) -> bool {
        (**self).survives_soft_reset()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Error for operations on a transport that is not open.
pub(crate) fn not_open() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport is not open")
}
