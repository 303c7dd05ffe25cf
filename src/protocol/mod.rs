//! Wire engines
//!
//! Both engines move bytes between a [`Connection`] and [`StreamableBody`]
//! values and never buffer a whole message: HTTP/1.1 with hand-rolled
//! chunked coding on top of `httparse`, HTTP/2 on top of the `h2` crate.
//! The server and client pick an engine by the connection's negotiated
//! [`Version`].
//!
//! [`StreamableBody`]: crate::body::StreamableBody
//! [`Version`]: crate::message::Version

pub mod http1;
pub mod http2;

pub use http1::Http1;
pub use http2::Http2;

use crate::Result;
use crate::client::{ClientConfig, PendingResponse};
use crate::message::Request;
use crate::server::{Handler, ServerConfig};
use crate::transport::Connection;
use http::StatusCode;
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("HTTP parsing error: {0}")]
    HttpParse(#[from] httparse::Error),
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error("Header block larger than {0} bytes")]
    HeadersTooLarge(usize),
    #[error("HTTP/2 error: {0}")]
    H2(#[from] h2::Error),
}

impl ProtocolError {
    /// Status to answer a request that failed to parse with
    pub fn status(&self) -> StatusCode {
        match self {
            ProtocolError::HeadersTooLarge(_)
            | ProtocolError::HttpParse(httparse::Error::TooManyHeaders) => {
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
            }
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// One HTTP version's server and client halves
///
/// Implementations take ownership of the connection. `serve_connection`
/// returns once the connection is finished; `send_request` returns as soon
/// as the request head is on the wire, leaving background tasks to stream
/// the request body out and the response in.
pub trait HttpProtocol {
    /// Serves requests arriving on `conn` until the peer leaves or
    /// `shutdown` fires between exchanges
    fn serve_connection(
        conn: Connection,
        handler: Arc<dyn Handler>,
        config: ServerConfig,
        shutdown: CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Starts one exchange on `conn`
    fn send_request(
        conn: Connection,
        request: Request,
        authority: String,
        config: ClientConfig,
    ) -> impl Future<Output = Result<PendingResponse>> + Send;
}

/// Headers the engines generate themselves and never pass through
pub(crate) fn is_framing_header(name: &str) -> bool {
    ["transfer-encoding", "content-length", "connection", "keep-alive", "host", "upgrade"]
        .iter()
        .any(|framing| name.eq_ignore_ascii_case(framing))
}
