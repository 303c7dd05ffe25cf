use super::Connection;
use crate::endpoint::{Endpoint, TlsContext};
use crate::message::Version;
use crate::{DuplexError, Result};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, warn};

/// A bound listening socket, optionally terminating TLS
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
    tls: Option<TlsContext>,
}

impl Listener {
    /// Binds the first address `endpoint` resolves to that accepts a bind
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        let mut last_error = None;
        for addr in endpoint.resolve().await? {
            match TcpListener::bind(addr).await {
                Ok(inner) => {
                    let local_addr = inner.local_addr()?;
                    return Ok(Self {
                        inner,
                        local_addr,
                        tls: endpoint.tls().cloned(),
                    });
                }
                Err(e) => {
                    warn!(%addr, error = %e, "Bind failed, trying next address");
                    last_error = Some(e);
                }
            }
        }
        Err(DuplexError::Connection(format!(
            "Failed to bind {endpoint}: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn tls(&self) -> Option<&TlsContext> {
        self.tls.as_ref()
    }

    /// Accepts the next TCP connection without handshaking
    ///
    /// The handshake runs in [`handshake`] so a slow peer only stalls its
    /// own task, never the accept loop.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        self.inner
            .accept()
            .await
            .map_err(|e| DuplexError::Connection(format!("Accept failed: {e}")))
    }
}

/// Completes the server side of a new connection
///
/// Plain connections are HTTP/1.1. TLS connections read the ClientHello
/// first, pick a protocol from its ALPN list, and finish the handshake with
/// a config that advertises only that protocol.
pub async fn handshake(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<&TlsContext>,
) -> Result<Connection> {
    let Some(tls) = tls else {
        return Ok(Connection::new(Box::new(stream), Version::Http11, peer));
    };

    let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream)
        .await
        .map_err(|e| DuplexError::Connection(format!("TLS ClientHello from {peer}: {e}")))?;

    let offered: Vec<Vec<u8>> = start
        .client_hello()
        .alpn()
        .map(|protocols| protocols.map(<[u8]>::to_vec).collect())
        .unwrap_or_default();
    let offered: Vec<&[u8]> = offered.iter().map(Vec::as_slice).collect();
    let (config, selected) = tls.server_config_for(&offered);
    debug!(%peer, offered = ?offered.iter().map(|p| String::from_utf8_lossy(p)).collect::<Vec<_>>(), %selected, "ALPN selected");

    let stream = start
        .into_stream(config)
        .await
        .map_err(|e| DuplexError::Connection(format!("TLS handshake with {peer}: {e}")))?;
    let version = Version::from_alpn(stream.get_ref().1.alpn_protocol());

    Ok(Connection::new(Box::new(stream), version, peer))
}
