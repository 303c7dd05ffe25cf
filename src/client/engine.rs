use super::ClientConfig;
use crate::body::StreamableBody;
use crate::endpoint::Endpoint;
use crate::message::{Headers, Request, Response, Version};
use crate::protocol::{Http1, Http2, HttpProtocol};
use crate::transport::{self, Connection};
use crate::{DuplexError, Result};
use http::Method;
use tokio::sync::oneshot;
use tracing::{Instrument, Span, info};

/// A request that has been sent but whose response head may not have
/// arrived yet
///
/// The request body stays writable while this is pending and after the
/// head has been received.
#[derive(Debug)]
pub struct PendingResponse {
    head: oneshot::Receiver<Result<Response>>,
    version: Version,
}

impl PendingResponse {
    pub(crate) fn new(head: oneshot::Receiver<Result<Response>>, version: Version) -> Self {
        Self { head, version }
    }

    /// Protocol the exchange runs over
    pub fn version(&self) -> Version {
        self.version
    }

    /// Waits for the response status and headers
    ///
    /// The returned response body keeps filling in as data arrives.
    pub async fn headers(self) -> Result<Response> {
        self.head.await.map_err(|_| DuplexError::ConnectionClosed)?
    }
}

/// Streaming HTTP client bound to one endpoint
#[derive(Debug, Clone)]
pub struct Client {
    endpoint: Endpoint,
    config: ClientConfig,
    span: Span,
}

impl Client {
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_config(endpoint, ClientConfig::default())
    }

    pub fn with_config(endpoint: Endpoint, config: ClientConfig) -> Self {
        let span = tracing::info_span!("client", endpoint = %endpoint);
        Self {
            endpoint,
            config,
            span,
        }
    }

    /// Replaces the span every client event is recorded under
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Opens a connection and negotiates the protocol
    pub async fn connect(&self) -> Result<Connection> {
        let conn = transport::connect(&self.endpoint, self.config.connect_timeout)
            .instrument(self.span.clone())
            .await?;
        self.span.in_scope(|| {
            info!(peer = %conn.peer_addr(), version = %conn.version(), "Connected");
        });
        Ok(conn)
    }

    /// Sends `request` over `conn` and returns once the request head is on
    /// the wire
    ///
    /// The request body is streamed in the background from whatever the
    /// caller writes into it.
    pub async fn send_request(&self, conn: Connection, request: Request) -> Result<PendingResponse> {
        let authority = self.endpoint.authority();
        let config = self.config.clone();
        let exchange = async move {
            match conn.version() {
                Version::Http11 => Http1::send_request(conn, request, authority, config).await,
                Version::Http2 => Http2::send_request(conn, request, authority, config).await,
            }
        };
        exchange.instrument(self.span.clone()).await
    }

    /// Connects and sends a `POST` whose body is `body`
    pub async fn post(
        &self,
        path: &str,
        headers: Headers,
        body: StreamableBody,
    ) -> Result<PendingResponse> {
        let conn = self.connect().await?;
        let mut request = Request::new(Method::POST, path).body(body);
        request.headers = headers;
        self.send_request(conn, request).await
    }
}
