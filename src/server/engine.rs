use super::{Handler, ServerConfig};
use crate::endpoint::{Endpoint, TlsContext};
use crate::message::Version;
use crate::protocol::{Http1, Http2, HttpProtocol};
use crate::transport::{Listener, listener::handshake};
use crate::{DuplexError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::{signal, time::timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, Span, error, info, warn};

/// Streaming HTTP server for one endpoint
///
/// Binding happens in [`Server::bind`], so the address is reachable as soon
/// as that returns, before [`Server::run`] is polled.
///
/// # Examples
///
/// ```no_run
/// use duplexsrv::{Endpoint, Request, Response, Server, ServerConfig, StreamableBody};
/// use http::StatusCode;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let endpoint = Endpoint::parse("http://127.0.0.1:9000")?;
///     let server = Server::bind(
///         &endpoint,
///         |request: Request| async move {
///             // answer right away, keep reading the upload in the background
///             let reply = StreamableBody::new();
///             let writer = reply.clone();
///             tokio::spawn(async move {
///                 let upload = request.body.drain_all().await?;
///                 writer.write(format!("{} bytes", upload.len())).await?;
///                 writer.close();
///                 Ok::<_, duplexsrv::body::BodyError>(())
///             });
///             Ok::<_, duplexsrv::DuplexError>(Response::new(StatusCode::OK, Vec::new(), reply))
///         },
///         ServerConfig::default(),
///     )
///     .await?;
///     server.run().await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: Listener,
    handler: Arc<dyn Handler>,
    config: ServerConfig,
    shutdown_signal: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
    span: Span,
}

impl Server {
    /// Binds `endpoint` and prepares to serve it with `handler`
    pub async fn bind(
        endpoint: &Endpoint,
        handler: impl Handler,
        config: ServerConfig,
    ) -> Result<Self> {
        let listener = Listener::bind(endpoint).await?;
        let (shutdown_signal, shutdown_rx) = broadcast::channel(1);
        let span = tracing::info_span!("server", address = %listener.local_addr(), secure = endpoint.is_secure());
        Ok(Self {
            listener,
            handler: Arc::new(handler),
            config,
            shutdown_signal,
            shutdown_rx,
            span,
        })
    }

    /// Replaces the span every server event is recorded under
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Sender that stops the accept loop when a message is sent on it
    pub fn shutdown_signal(&self) -> broadcast::Sender<()> {
        self.shutdown_signal.clone()
    }

    /// Accepts connections until shutdown, then waits for in-flight
    /// connections to finish their current exchange
    pub async fn run(self) -> Result<()> {
        let span = self.span.clone();
        self.accept_loop().instrument(span).await
    }

    async fn accept_loop(self) -> Result<()> {
        let Server {
            listener,
            handler,
            config,
            shutdown_signal: _shutdown_signal,
            mut shutdown_rx,
            ..
        } = self;

        info!(address = %listener.local_addr(), "Server listening");

        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let active = tracker.len();
                            if active >= config.max_connections {
                                warn!(%peer, current = active, limit = config.max_connections, "Connection rejected: limit reached");
                                continue;
                            }
                            info!(%peer, current = active + 1, "Accepted connection");

                            let tls = listener.tls().cloned();
                            let handler = handler.clone();
                            let config = config.clone();
                            let cancel = cancel.child_token();
                            let span = tracing::info_span!("connection", %peer);
                            tracker.spawn(
                                async move {
                                    if let Err(e) = handle_connection(stream, peer, tls, handler, config, cancel).await {
                                        error!(%peer, error = %e, "Error handling connection");
                                    }
                                    info!(%peer, "Connection closed");
                                }
                                .instrument(span),
                            );
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = signal::ctrl_c() => {
                    info!("Received shutdown signal, stopping server");
                    break;
                }
                _ = shutdown_rx.recv() => {
                    info!("Received internal shutdown signal, stopping server");
                    break;
                }
            }
        }

        drop(listener);
        cancel.cancel();
        tracker.close();
        info!(in_flight = tracker.len(), "Waiting for in-flight connections");
        tracker.wait().await;

        info!("Server stopped");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsContext>,
    handler: Arc<dyn Handler>,
    config: ServerConfig,
    cancel: CancellationToken,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let conn = timeout(config.header_read_timeout, handshake(stream, peer, tls.as_ref()))
        .await
        .map_err(|_| DuplexError::Connection(format!("Handshake with {peer} timed out")))??;
    info!(%peer, version = %conn.version(), "Connection established");

    match conn.version() {
        Version::Http11 => Http1::serve_connection(conn, handler, config, cancel).await,
        Version::Http2 => Http2::serve_connection(conn, handler, config, cancel).await,
    }
}
