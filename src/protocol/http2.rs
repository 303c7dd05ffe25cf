//! HTTP/2 engine on top of the `h2` crate
//!
//! Every request is its own stream, so one connection can carry several
//! exchanges at once; each accepted stream gets its own task. Body chunks
//! become DATA frames, sent only after flow-control capacity for them has
//! been granted.

use super::{HttpProtocol, ProtocolError, is_framing_header};
use crate::body::{BodyError, StreamableBody};
use crate::client::{ClientConfig, PendingResponse};
use crate::message::{Headers, Request, Response, Version};
use crate::server::{Handler, ServerConfig};
use crate::transport::Connection;
use crate::{DuplexError, Result};
use bytes::Bytes;
use h2::{RecvStream, SendStream};
use http::{HeaderMap, StatusCode};
use std::future::poll_fn;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info};

/// HTTP/2 over a TLS stream that negotiated `h2`
pub struct Http2;

impl HttpProtocol for Http2 {
    async fn serve_connection(
        conn: Connection,
        handler: Arc<dyn Handler>,
        _config: ServerConfig,
        shutdown: CancellationToken,
    ) -> Result<()> {
        serve(conn, handler, shutdown).await
    }

    async fn send_request(
        conn: Connection,
        request: Request,
        authority: String,
        _config: ClientConfig,
    ) -> Result<PendingResponse> {
        start_exchange(conn, request, authority).await
    }
}

fn headers_from_map(map: &HeaderMap) -> Headers {
    map.iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn stream_lost(body: &StreamableBody, error: Option<h2::Error>) -> BodyError {
    match error {
        Some(e) => debug!(error = %e, "HTTP/2 stream lost"),
        None => debug!("HTTP/2 stream closed by peer"),
    }
    body.fail(BodyError::ConnectionClosed);
    BodyError::ConnectionClosed
}

/// Sends `body` as DATA frames, ending the stream when the body closes
///
/// If the producer fails the body, the stream is reset so the peer never
/// mistakes the truncated body for a complete one.
async fn send_body(
    send: &mut SendStream<Bytes>,
    body: &StreamableBody,
) -> std::result::Result<(), BodyError> {
    loop {
        let mut chunk = match body.read_next().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => {
                return send
                    .send_data(Bytes::new(), true)
                    .map_err(|e| stream_lost(body, Some(e)));
            }
            Err(e) => {
                send.send_reset(h2::Reason::CANCEL);
                return Err(e);
            }
        };

        while !chunk.is_empty() {
            send.reserve_capacity(chunk.len());
            let granted = match poll_fn(|cx| send.poll_capacity(cx)).await {
                Some(Ok(granted)) => granted,
                Some(Err(e)) => return Err(stream_lost(body, Some(e))),
                None => return Err(stream_lost(body, None)),
            };
            if granted == 0 {
                continue;
            }
            let part = chunk.split_to(granted.min(chunk.len()));
            send.send_data(part, false)
                .map_err(|e| stream_lost(body, Some(e)))?;
        }
    }
}

/// Copies DATA frames from `recv` into `body`, returning capacity to the
/// peer as each frame is taken
///
/// Closes `body` when the stream ends cleanly. A reset or a lost
/// connection is reported as `Incomplete`; the caller fails whatever
/// bodies that affects.
async fn receive_body(
    mut recv: RecvStream,
    body: &StreamableBody,
) -> std::result::Result<(), BodyError> {
    let mut sink_open = true;
    while let Some(frame) = recv.data().await {
        let data = frame.map_err(|e| {
            debug!(error = %e, "HTTP/2 body cut short");
            BodyError::Incomplete
        })?;
        let _ = recv.flow_control().release_capacity(data.len());
        if sink_open && body.write(data).await.is_err() {
            debug!("Body consumer refused the rest, discarding it");
            sink_open = false;
        }
    }
    body.close();
    Ok(())
}

async fn serve(
    conn: Connection,
    handler: Arc<dyn Handler>,
    shutdown: CancellationToken,
) -> Result<()> {
    let peer = conn.peer_addr();
    let mut connection = h2::server::handshake(conn.into_io())
        .await
        .map_err(ProtocolError::from)?;
    let mut draining = false;

    loop {
        let next = if draining {
            connection.accept().await
        } else {
            tokio::select! {
                next = connection.accept() => next,
                _ = shutdown.cancelled() => {
                    debug!(%peer, "Shutdown requested, sending GOAWAY");
                    connection.graceful_shutdown();
                    draining = true;
                    continue;
                }
            }
        };

        match next {
            Some(Ok((request, respond))) => {
                let handler = handler.clone();
                tokio::spawn(
                    async move {
                        if let Err(e) = serve_stream(request, respond, handler, peer).await {
                            error!(%peer, error = %e, "Error serving HTTP/2 stream");
                        }
                    }
                    .in_current_span(),
                );
            }
            Some(Err(e)) => return Err(ProtocolError::from(e).into()),
            None => break,
        }
    }

    Ok(())
}

async fn serve_stream(
    request: http::Request<RecvStream>,
    mut respond: h2::server::SendResponse<Bytes>,
    handler: Arc<dyn Handler>,
    peer: SocketAddr,
) -> Result<()> {
    let (parts, recv) = request.into_parts();
    let request_body = StreamableBody::new();
    let request = Request {
        method: parts.method,
        path: parts
            .uri
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        headers: headers_from_map(&parts.headers),
        body: request_body.clone(),
    };
    info!(%peer, method = %request.method, path = %request.path, headers = ?request.headers, "Incoming request");

    let feeder = tokio::spawn(
        async move {
            let outcome = receive_body(recv, &request_body).await;
            if let Err(e) = &outcome {
                request_body.fail(e.clone());
            }
            outcome
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

    let mut builder = http::Response::builder().status(response.status);
    for (name, value) in &response.headers {
        if !is_framing_header(name) {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }
    let head = match builder.body(()) {
        Ok(head) => head,
        Err(e) => {
            respond.send_reset(h2::Reason::INTERNAL_ERROR);
            response.body.fail(BodyError::ConnectionClosed);
            return Err(ProtocolError::InvalidMessage(format!("Invalid response head: {e}")).into());
        }
    };

    info!(%peer, status = %response.status, "Sending response");
    let mut send = match respond.send_response(head, false) {
        Ok(send) => send,
        Err(e) => {
            feeder.abort();
            response.body.fail(BodyError::ConnectionClosed);
            return Err(ProtocolError::from(e).into());
        }
    };
    send_body(&mut send, &response.body).await?;

    if let Ok(Err(e)) = feeder.await {
        debug!(%peer, error = %e, "Request body did not complete");
    }
    Ok(())
}

async fn start_exchange(conn: Connection, request: Request, authority: String) -> Result<PendingResponse> {
    let peer = conn.peer_addr();
    let (send_request, connection) = h2::client::handshake(conn.into_io())
        .await
        .map_err(ProtocolError::from)?;
    tokio::spawn(
        async move {
            if let Err(e) = connection.await {
                debug!(%peer, error = %e, "HTTP/2 connection ended with an error");
            }
        }
        .in_current_span(),
    );
    let mut send_request = send_request
        .ready()
        .await
        .map_err(|e| DuplexError::Connection(format!("HTTP/2 connection to {peer} not ready: {e}")))?;

    let Request {
        method,
        path,
        headers,
        body,
    } = request;
    info!(%peer, %method, %path, headers = ?headers, "Sending request");

    let mut builder = http::Request::builder()
        .method(method)
        .uri(format!("https://{authority}{path}"));
    for (name, value) in &headers {
        if !is_framing_header(name) {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }
    let head = builder
        .body(())
        .map_err(|e| ProtocolError::InvalidMessage(format!("Invalid request head: {e}")))?;

    let (response, mut send) = send_request
        .send_request(head, false)
        .map_err(ProtocolError::from)?;

    let upload = body.clone();
    tokio::spawn(
        async move {
            match send_body(&mut send, &upload).await {
                Ok(()) => debug!("Request body sent"),
                Err(e) => debug!(error = %e, "Request body aborted"),
            }
        }
        .in_current_span(),
    );

    let (head_tx, head_rx) = oneshot::channel();
    tokio::spawn(
        async move {
            let response = match response.await {
                Ok(response) => response,
                Err(e) => {
                    body.fail(BodyError::ConnectionClosed);
                    let _ = head_tx.send(Err(ProtocolError::from(e).into()));
                    return;
                }
            };

            let (parts, recv) = response.into_parts();
            let response_body = StreamableBody::new();
            let response = Response::new(
                parts.status,
                headers_from_map(&parts.headers),
                response_body.clone(),
            );
            if head_tx.send(Ok(response)).is_err() {
                debug!("Response dropped before its head arrived");
            }

            if let Err(e) = receive_body(recv, &response_body).await {
                body.fail(BodyError::ConnectionClosed);
                response_body.fail(e);
            }
        }
        .in_current_span(),
    );

    Ok(PendingResponse::new(head_rx, Version::Http2))
}
