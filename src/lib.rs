use crate::body::BodyError;
use crate::protocol::ProtocolError;
use thiserror::Error;

/// Error types for the duplexsrv library
#[derive(Error, Debug)]
pub enum DuplexError {
    /// The endpoint URL could not be parsed; raised before any I/O
    #[error("Endpoint parse error: {0}")]
    EndpointParse(String),

    /// Dialing, accepting or handshaking a connection failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// A body was written after it was closed
    #[error("Write to a closed body")]
    ClosedBody,

    /// The transport went away while a body was streaming
    #[error("Connection closed mid-stream")]
    ConnectionClosed,

    /// The peer stopped before a body's end-of-stream marker
    #[error("Body ended before its end-of-stream marker")]
    IncompleteBody,

    /// Malformed HTTP on the wire
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// TLS configuration errors
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Other I/O errors (certificate storage, socket setup)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<BodyError> for DuplexError {
    fn from(err: BodyError) -> Self {
        match err {
            BodyError::Closed => DuplexError::ClosedBody,
            BodyError::ConnectionClosed => DuplexError::ConnectionClosed,
            BodyError::Incomplete => DuplexError::IncompleteBody,
        }
    }
}

/// Result type for the duplexsrv library
pub type Result<T> = std::result::Result<T, DuplexError>;

pub mod body;
pub mod client;
pub mod endpoint;
pub mod message;
pub mod orchestrator;
pub mod protocol;
pub mod server;
pub mod transport;

// Re-export main types for convenience
pub use body::StreamableBody;
pub use client::{Client, ClientConfig, ClientConfigBuilder, PendingResponse};
pub use endpoint::{CertificateAuthority, Endpoint, Scheme, TlsContext};
pub use message::{Headers, Request, Response, Version};
pub use orchestrator::{ExchangeReport, UploadConfig};
pub use server::{Handler, Server, ServerConfig};
pub use transport::Connection;
