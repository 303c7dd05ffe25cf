//! HTTP/1.1 engine
//!
//! Each connection is split into a read half and a write half so the two
//! directions of an exchange are owned by different tasks. Outgoing bodies
//! are always sent with chunked transfer-encoding and each chunk is flushed
//! as soon as the producer writes it.

pub mod codec;

#[cfg(test)]
mod tests;

pub use codec::{Decoded, Http1Decoder, Http1Encoder, Outgoing, RequestHead, ResponseHead};

use super::{HttpProtocol, ProtocolError};
use crate::body::{BodyError, StreamableBody};
use crate::client::{ClientConfig, PendingResponse};
use crate::message::{Request, Response, Version};
use crate::server::{Handler, ServerConfig};
use crate::transport::{BoxedIo, Connection};
use crate::{DuplexError, Result};
use futures_util::{SinkExt, StreamExt};
use http::StatusCode;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

type Reader = FramedRead<ReadHalf<BoxedIo>, Http1Decoder>;
type Writer = FramedWrite<WriteHalf<BoxedIo>, Http1Encoder>;

/// HTTP/1.1 over any duplex byte stream
pub struct Http1;

impl HttpProtocol for Http1 {
    async fn serve_connection(
        conn: Connection,
        handler: Arc<dyn Handler>,
        config: ServerConfig,
        shutdown: CancellationToken,
    ) -> Result<()> {
        serve(conn, handler, config, shutdown).await
    }

    async fn send_request(
        conn: Connection,
        request: Request,
        authority: String,
        config: ClientConfig,
    ) -> Result<PendingResponse> {
        start_exchange(conn, request, authority, config).await
    }
}

/// Copies one incoming message body from `reader` into `body`
///
/// Returns once the message's end marker has been decoded. If the consumer
/// refuses the rest by closing or failing `body`, the remaining data is
/// still read and discarded so the connection stays in sync. Dropping the
/// consumer's handle is not a refusal; unread data stays queued. The caller
/// decides what to fail when the message is cut short.
async fn pump_incoming<R>(
    reader: &mut FramedRead<R, Http1Decoder>,
    body: &StreamableBody,
) -> std::result::Result<(), BodyError>
where
    R: AsyncRead + Unpin,
{
    let mut sink_open = true;
    loop {
        match reader.next().await {
            Some(Ok(Decoded::Data(data))) => {
                if sink_open && body.write(data).await.is_err() {
                    debug!("Body consumer refused the rest, discarding it");
                    sink_open = false;
                }
            }
            Some(Ok(Decoded::End)) => {
                body.close();
                return Ok(());
            }
            Some(Ok(other)) => {
                warn!(frame = ?other, "Unexpected frame inside a message body");
                return Err(BodyError::Incomplete);
            }
            Some(Err(e)) => {
                debug!(error = %e, "Message body cut short");
                return Err(BodyError::Incomplete);
            }
            None => return Err(BodyError::Incomplete),
        }
    }
}

/// Streams `body` to `writer` as chunks, finishing with the terminator
///
/// A transport failure fails `body` with `ConnectionClosed` so its producer
/// sees it on the next write. If the producer fails the body, the write
/// side is shut down without a terminator so the peer sees a truncated
/// message instead of a clean end.
async fn stream_outgoing<W>(
    writer: &mut FramedWrite<W, Http1Encoder>,
    body: &StreamableBody,
) -> std::result::Result<(), BodyError>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = match body.read_next().await {
            Ok(Some(chunk)) => Outgoing::Chunk(chunk),
            Ok(None) => Outgoing::End,
            Err(e) => {
                let _ = writer.get_mut().shutdown().await;
                return Err(e);
            }
        };
        let finished = matches!(frame, Outgoing::End);

        if let Err(e) = writer.send(frame).await {
            debug!(error = %e, "Transport write failed");
            body.fail(BodyError::ConnectionClosed);
            return Err(BodyError::ConnectionClosed);
        }
        if finished {
            return Ok(());
        }
    }
}

async fn serve(
    conn: Connection,
    handler: Arc<dyn Handler>,
    config: ServerConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let peer = conn.peer_addr();
    let (read_half, write_half) = tokio::io::split(conn.into_io());
    let mut reader = FramedRead::with_capacity(
        read_half,
        Http1Decoder::requests(config.max_headers, config.max_head_bytes),
        config.buffer_size,
    );
    let mut writer = FramedWrite::new(write_half, Http1Encoder);

    loop {
        let next = tokio::select! {
            next = timeout(config.header_read_timeout, reader.next()) => next,
            _ = shutdown.cancelled() => {
                debug!(%peer, "Shutdown requested, closing idle connection");
                break;
            }
        };

        let head = match next {
            Err(_) => {
                warn!(%peer, "Timed out waiting for request head");
                break;
            }
            Ok(None) => {
                debug!(%peer, "Client closed connection");
                break;
            }
            Ok(Some(Err(ProtocolError::Io(e)))) => return Err(e.into()),
            Ok(Some(Err(e))) => {
                warn!(%peer, error = %e, "Malformed request");
                reject(&mut writer, e.status()).await?;
                break;
            }
            Ok(Some(Ok(Decoded::Request(head)))) => head,
            Ok(Some(Ok(other))) => {
                return Err(ProtocolError::InvalidMessage(format!(
                    "Expected a request head, got {other:?}"
                ))
                .into());
            }
        };

        let close = head.close;
        let request_body = StreamableBody::new();
        let request = Request {
            method: head.method,
            path: head.path,
            headers: head.headers,
            body: request_body.clone(),
        };
        info!(%peer, method = %request.method, path = %request.path, headers = ?request.headers, "Incoming request");

        let feeder = tokio::spawn(
            async move {
                let outcome = pump_incoming(&mut reader, &request_body).await;
                if let Err(e) = &outcome {
                    request_body.fail(e.clone());
                }
                (reader, outcome)
            }
            .in_current_span(),
        );

        let response = match handler.call(request).await {
            Ok(response) => response,
            Err(e) => {
                error!(%peer, error = %e, "Handler failed");
                Response::with_static(StatusCode::INTERNAL_SERVER_ERROR, b"")
            }
        };

        let close = close || shutdown.is_cancelled();
        let head = Outgoing::Response {
            status: response.status,
            headers: response.headers,
            chunked: true,
            close,
        };
        info!(%peer, status = %response.status, "Sending response");
        if let Err(e) = writer.send(head).await {
            feeder.abort();
            response.body.fail(BodyError::ConnectionClosed);
            return Err(e.into());
        }
        if let Err(e) = stream_outgoing(&mut writer, &response.body).await {
            feeder.abort();
            return Err(e.into());
        }

        let (returned, outcome) = feeder
            .await
            .map_err(|e| DuplexError::Connection(format!("Request body task failed: {e}")))?;
        reader = returned;

        if let Err(e) = outcome {
            debug!(%peer, error = %e, "Request body did not complete, closing connection");
            break;
        }
        if close {
            break;
        }
    }

    Ok(())
}

async fn reject(writer: &mut Writer, status: StatusCode) -> Result<()> {
    writer
        .send(Outgoing::Response {
            status,
            headers: Vec::new(),
            chunked: false,
            close: true,
        })
        .await?;
    Ok(())
}

async fn start_exchange(
    conn: Connection,
    request: Request,
    authority: String,
    config: ClientConfig,
) -> Result<PendingResponse> {
    let peer = conn.peer_addr();
    let (read_half, write_half) = tokio::io::split(conn.into_io());
    let mut writer = FramedWrite::new(write_half, Http1Encoder);

    let Request {
        method,
        path,
        headers,
        body,
    } = request;
    info!(%peer, %method, %path, headers = ?headers, "Sending request");
    writer
        .send(Outgoing::Request {
            method,
            path,
            host: authority,
            headers,
        })
        .await
        .map_err(|e| DuplexError::Connection(format!("Failed to send request head to {peer}: {e}")))?;

    let reader = FramedRead::with_capacity(
        read_half,
        Http1Decoder::responses(config.max_headers, config.max_head_bytes),
        config.buffer_size,
    );
    let (head_tx, head_rx) = oneshot::channel();

    let upload = body.clone();
    tokio::spawn(
        async move {
            match stream_outgoing(&mut writer, &upload).await {
                Ok(()) => debug!("Request body sent"),
                Err(e) => debug!(error = %e, "Request body aborted"),
            }
        }
        .in_current_span(),
    );
    tokio::spawn(read_response(reader, head_tx, body).in_current_span());

    Ok(PendingResponse::new(head_rx, Version::Http11))
}

async fn read_response(
    mut reader: Reader,
    head_tx: oneshot::Sender<Result<Response>>,
    request_body: StreamableBody,
) {
    let head = loop {
        match reader.next().await {
            Some(Ok(Decoded::Response(head))) if head.status.is_informational() => {
                debug!(status = %head.status, "Skipping interim response");
            }
            Some(Ok(Decoded::Response(head))) => break head,
            // end of an interim response
            Some(Ok(Decoded::End)) => {}
            Some(Ok(other)) => {
                request_body.fail(BodyError::ConnectionClosed);
                let _ = head_tx.send(Err(ProtocolError::InvalidMessage(format!(
                    "Expected a response head, got {other:?}"
                ))
                .into()));
                return;
            }
            Some(Err(e)) => {
                request_body.fail(BodyError::ConnectionClosed);
                let _ = head_tx.send(Err(e.into()));
                return;
            }
            None => {
                request_body.fail(BodyError::ConnectionClosed);
                let _ = head_tx.send(Err(DuplexError::ConnectionClosed));
                return;
            }
        }
    };

    let body = StreamableBody::new();
    let response = Response::new(head.status, head.headers, body.clone());
    if head_tx.send(Ok(response)).is_err() {
        debug!("Response dropped before its head arrived");
    }

    if let Err(e) = pump_incoming(&mut reader, &body).await {
        // the connection is gone, so the upload is too
        request_body.fail(BodyError::ConnectionClosed);
        body.fail(e);
    }
}
