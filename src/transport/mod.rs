//! Duplex byte channels: plain TCP or TLS, with the HTTP version fixed at
//! handshake time

pub mod dialer;
pub mod listener;

pub use dialer::connect;
pub use listener::Listener;

use crate::message::Version;
use std::fmt;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional byte stream a connection can run over
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Type-erased stream so plain and TLS sockets share one code path
pub type BoxedIo = Box<dyn AsyncStream>;

/// An established connection and the protocol version agreed for it
pub struct Connection {
    io: BoxedIo,
    version: Version,
    peer: SocketAddr,
}

impl Connection {
    pub fn new(io: BoxedIo, version: Version, peer: SocketAddr) -> Self {
        Self { io, version, peer }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Gives up the connection metadata and returns the byte stream
    pub fn into_io(self) -> BoxedIo {
        self.io
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("version", &self.version)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}
