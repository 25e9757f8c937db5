//! Pluggable byte pipe underneath a [`Channel`](crate::Channel).
//!
//! The bridge does not choose the transport medium; anything that moves
//! bytes reliably, in order, and byte-exact in both directions — and
//! surfaces disconnection as EOF or an error on the reading half — can
//! carry it.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
#[cfg(unix)]
use std::os::unix::net::UnixStream;

/// Hook that unblocks the channel's receive loop during teardown, e.g. by
/// shutting down the underlying socket.
pub type WireShutdown = Box<dyn Fn() -> io::Result<()> + Send + Sync>;

/// A reliable, order-preserving, byte-exact duplex pipe to the peer
/// process.
pub trait Wire: Send + 'static {
    /// Reading half, handed to the channel's receive loop.
    type Reader: Read + Send + 'static;
    /// Writing half, used by (serialized) senders.
    type Writer: Write + Send + 'static;

    /// Splits the pipe into its two halves plus a teardown hook.
    fn split(self) -> io::Result<(Self::Reader, Self::Writer, WireShutdown)>;
}

#[cfg(unix)]
impl Wire for UnixStream {
    type Reader = Self;
    type Writer = Self;

    fn split(self) -> io::Result<(Self::Reader, Self::Writer, WireShutdown)> {
        let reader = self.try_clone()?;
        let writer = self.try_clone()?;
        let shutdown: WireShutdown = Box::new(move || self.shutdown(Shutdown::Both));
        Ok((reader, writer, shutdown))
    }
}

impl Wire for TcpStream {
    type Reader = Self;
    type Writer = Self;

    fn split(self) -> io::Result<(Self::Reader, Self::Writer, WireShutdown)> {
        let reader = self.try_clone()?;
        let writer = self.try_clone()?;
        let shutdown: WireShutdown = Box::new(move || self.shutdown(Shutdown::Both));
        Ok((reader, writer, shutdown))
    }
}
