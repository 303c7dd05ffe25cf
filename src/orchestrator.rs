//! Runs the reference exchange: a server and a client on the same endpoint
//!
//! The client uploads a paced sequence of chunks while the server answers
//! with its response head right away and acknowledges the upload once the
//! request body has ended.

use crate::body::StreamableBody;
use crate::client::{Client, ClientConfigBuilder};
use crate::endpoint::Endpoint;
use crate::message::{Headers, Request, Response, Version};
use crate::server::{Handler, Server, ServerConfig};
use crate::{DuplexError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{Instrument, error, info, warn};

/// Body the reference server sends once the upload has ended
pub const ACKNOWLEDGEMENT: &[u8] = b"Upload data received.";

/// Shape of the client's upload
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Payload of every chunk
    pub chunk: Bytes,
    /// Number of chunks written before the body is closed
    pub chunk_count: usize,
    /// Pause between consecutive chunks
    pub interval: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk: Bytes::from_static(b"!"),
            chunk_count: 10,
            interval: Duration::from_millis(100),
        }
    }
}

/// What the client saw at the end of the exchange
#[derive(Debug, Clone)]
pub struct ExchangeReport {
    pub version: Version,
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Bytes,
}

/// Reference handler
///
/// Responds `200` with `hello: client` immediately, then writes
/// [`ACKNOWLEDGEMENT`] once the whole request body has been read.
#[derive(Debug, Clone, Copy, Default)]
pub struct Acknowledge;

#[async_trait]
impl Handler for Acknowledge {
    async fn call(&self, request: Request) -> Result<Response> {
        info!(method = %request.method, path = %request.path, headers = ?request.headers, "Handling upload");

        let reply = StreamableBody::new();
        let writer = reply.clone();
        let upload = request.body;
        tokio::spawn(
            async move {
                match upload.drain_all().await {
                    Ok(data) => {
                        info!(size = data.len(), body = %String::from_utf8_lossy(&data), "Upload complete");
                        if let Err(e) = writer.write(Bytes::from_static(ACKNOWLEDGEMENT)).await {
                            warn!(error = %e, "Could not acknowledge upload");
                        }
                        writer.close();
                    }
                    Err(e) => {
                        warn!(error = %e, "Upload did not complete");
                        writer.fail(e);
                    }
                }
            }
            .in_current_span(),
        );

        Ok(Response::new(
            StatusCode::OK,
            vec![("hello".to_string(), "client".to_string())],
            reply,
        ))
    }
}

/// Writes `upload.chunk_count` chunks into `body`, pausing between them,
/// and closes it
pub async fn upload_chunks(body: StreamableBody, upload: UploadConfig) -> Result<()> {
    let mut outcome = Ok(());
    for sent in 0..upload.chunk_count {
        if sent > 0 {
            sleep(upload.interval).await;
        }
        if let Err(e) = body.write(upload.chunk.clone()).await {
            warn!(sent, error = %e, "Upload interrupted");
            outcome = Err(e.into());
            break;
        }
    }
    body.close();
    outcome
}

/// Starts a server on `endpoint`, runs one upload against it and stops the
/// server again
///
/// The server is stopped and awaited whether or not the exchange succeeded.
/// Port 0 is allowed; the client dials whatever port was bound.
pub async fn run(endpoint: &Endpoint, upload: UploadConfig) -> Result<ExchangeReport> {
    let server_config = ServerConfig::default();
    let buffer_size = server_config.buffer_size;
    let server = Server::bind(endpoint, Acknowledge, server_config).await?;
    let address = server.local_addr();
    let server = server.with_span(tracing::info_span!("component", name = "server", %address));
    let client_endpoint = endpoint.with_port(address.port());
    let shutdown = server.shutdown_signal();
    let server_task = tokio::spawn(server.run());

    let client_config = ClientConfigBuilder::new().buffer_size(buffer_size).build();
    let client_span = tracing::info_span!("component", name = "client", endpoint = %client_endpoint);
    let client = Client::with_config(client_endpoint, client_config).with_span(client_span);
    let outcome = exchange(&client, upload).await;
    if let Err(e) = &outcome {
        error!(error = %e, "Exchange failed");
    }

    let _ = shutdown.send(());
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Server stopped with an error"),
        Err(e) => error!(error = %e, "Server task failed"),
    }

    outcome
}

async fn exchange(client: &Client, upload: UploadConfig) -> Result<ExchangeReport> {
    let conn = client.connect().await?;
    let version = conn.version();

    let body = StreamableBody::new();
    let request = Request::new(Method::POST, "/")
        .header("hello", "server")
        .body(body.clone());
    let pending = client.send_request(conn, request).await?;
    let producer = tokio::spawn(upload_chunks(body, upload).in_current_span());

    let received = async {
        let response = pending.headers().await?;
        info!(%version, status = %response.status, headers = ?response.headers, "Received response head");
        let data = response.body.drain_all().await?;
        info!(size = data.len(), body = %String::from_utf8_lossy(&data), "Received response body");
        Ok::<_, DuplexError>((response.status, response.headers, data))
    }
    .await;

    let (status, headers, body) = match received {
        Ok(received) => received,
        Err(e) => {
            producer.abort();
            return Err(e);
        }
    };
    match producer.await {
        Ok(result) => result?,
        Err(e) => return Err(DuplexError::Connection(format!("Upload task failed: {e}"))),
    }

    Ok(ExchangeReport {
        version,
        status,
        headers,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::BodyError;
    use crate::message::find_header;

    #[tokio::test(start_paused = true)]
    async fn test_upload_chunks_writes_and_closes() {
        let body = StreamableBody::new();
        let upload = UploadConfig {
            chunk_count: 3,
            ..Default::default()
        };
        upload_chunks(body.clone(), upload).await.unwrap();

        assert!(body.is_closed());
        assert_eq!(&body.drain_all().await.unwrap()[..], b"!!!");
    }

    #[tokio::test]
    async fn test_upload_chunks_stops_on_failure() {
        let body = StreamableBody::new();
        body.fail(BodyError::ConnectionClosed);

        let result = upload_chunks(body, UploadConfig::default()).await;
        assert!(matches!(result, Err(DuplexError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_acknowledge_answers_before_upload_ends() {
        let upload = StreamableBody::new();
        let request = Request::new(Method::POST, "/").body(upload.clone());

        let response = Acknowledge.call(request).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(find_header(&response.headers, "hello"), Some("client"));
        assert!(!response.body.is_closed());

        upload.write("!").await.unwrap();
        upload.close();
        assert_eq!(&response.body.drain_all().await.unwrap()[..], ACKNOWLEDGEMENT);
    }

    #[tokio::test]
    async fn test_acknowledge_propagates_incomplete_upload() {
        let upload = StreamableBody::new();
        let request = Request::new(Method::POST, "/").body(upload.clone());
        let response = Acknowledge.call(request).await.unwrap();

        upload.fail(BodyError::Incomplete);
        assert_eq!(
            response.body.drain_all().await.unwrap_err(),
            BodyError::Incomplete
        );
    }
}
