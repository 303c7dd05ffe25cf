use super::*;
use crate::message::find_header;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const LIMIT: Duration = Duration::from_secs(5);

fn peer() -> SocketAddr {
    "127.0.0.1:40000".parse().unwrap()
}

/// Serves one in-memory connection and returns the client's end of it
fn serve_pipe(handler: impl Handler) -> (DuplexStream, JoinHandle<Result<()>>) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let conn = Connection::new(Box::new(server), Version::Http11, peer());
    let handler: Arc<dyn Handler> = Arc::new(handler);
    let task = tokio::spawn(Http1::serve_connection(
        conn,
        handler,
        ServerConfig::default(),
        CancellationToken::new(),
    ));
    (client, task)
}

async fn read_until<R: AsyncRead + Unpin>(stream: &mut R, seen: &mut Vec<u8>, needle: &str) {
    let mut chunk = [0u8; 1024];
    while !String::from_utf8_lossy(seen).contains(needle) {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "stream ended before {needle:?} arrived");
        seen.extend_from_slice(&chunk[..n]);
    }
}

#[tokio::test]
async fn test_malformed_request_gets_400() {
    let (mut client, task) = serve_pipe(|_request: Request| async move {
        Ok::<_, DuplexError>(Response::with_static(StatusCode::OK, b""))
    });

    client.write_all(b"NOT A REQUEST\r\n\r\n").await.unwrap();
    let mut raw = Vec::new();
    tokio::time::timeout(LIMIT, client.read_to_end(&mut raw))
        .await
        .unwrap()
        .unwrap();

    let text = String::from_utf8(raw).unwrap();
    assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{text}");
    assert!(text.contains("connection: close\r\n"));
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_response_streams_before_request_ends() {
    let (mut client, task) = serve_pipe(|request: Request| async move {
        let reply = StreamableBody::new();
        reply.write("ready").await?;
        let writer = reply.clone();
        tokio::spawn(async move {
            let upload = request.body.drain_all().await?;
            writer.write(format!("got {}", upload.len())).await?;
            writer.close();
            Ok::<_, BodyError>(())
        });
        Ok::<_, DuplexError>(Response::new(StatusCode::OK, Vec::new(), reply))
    });

    client
        .write_all(b"POST /upload HTTP/1.1\r\nhost: test\r\ntransfer-encoding: chunked\r\n\r\n1\r\n!\r\n")
        .await
        .unwrap();

    // head and first chunk arrive while the request body is still open
    let mut seen = Vec::new();
    tokio::time::timeout(LIMIT, read_until(&mut client, &mut seen, "5\r\nready\r\n"))
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&seen).starts_with("HTTP/1.1 200 OK\r\n"));

    client.write_all(b"2\r\n!!\r\n0\r\n\r\n").await.unwrap();
    tokio::time::timeout(LIMIT, read_until(&mut client, &mut seen, "5\r\ngot 3\r\n0\r\n\r\n"))
        .await
        .unwrap();

    drop(client);
    tokio::time::timeout(LIMIT, task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_keep_alive_serves_several_requests() {
    let (mut client, task) = serve_pipe(|request: Request| async move {
        let upload = request.body.drain_all().await?;
        let reply = StreamableBody::new();
        reply.write(upload).await?;
        reply.close();
        Ok::<_, DuplexError>(Response::new(
            StatusCode::OK,
            vec![("path".to_string(), request.path)],
            reply,
        ))
    });

    client
        .write_all(
            b"POST /one HTTP/1.1\r\nhost: test\r\ncontent-length: 3\r\n\r\nabc\
              POST /two HTTP/1.1\r\nhost: test\r\nconnection: close\r\ncontent-length: 2\r\n\r\nde",
        )
        .await
        .unwrap();

    let mut raw = Vec::new();
    tokio::time::timeout(LIMIT, client.read_to_end(&mut raw))
        .await
        .unwrap()
        .unwrap();
    let text = String::from_utf8(raw).unwrap();

    assert_eq!(text.matches("HTTP/1.1 200 OK\r\n").count(), 2);
    let second = text.find("path: /two").unwrap();
    assert!(text.find("path: /one").unwrap() < second);
    assert!(text.contains("3\r\nabc\r\n0\r\n\r\n"));
    assert!(text[second..].contains("connection: close\r\n"));
    assert!(text.ends_with("2\r\nde\r\n0\r\n\r\n"));
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_refused_upload_is_discarded_and_connection_reused() {
    let (mut client, task) = serve_pipe(|request: Request| async move {
        let reply = StreamableBody::new();
        if request.path == "/skip" {
            request.body.close();
            reply.write("skipped").await?;
        } else {
            let upload = request.body.drain_all().await?;
            reply.write(upload).await?;
        }
        reply.close();
        Ok::<_, DuplexError>(Response::new(StatusCode::OK, Vec::new(), reply))
    });

    client
        .write_all(
            b"POST /skip HTTP/1.1\r\nhost: test\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhello\r\n3\r\nabc\r\n0\r\n\r\n\
              POST /echo HTTP/1.1\r\nhost: test\r\nconnection: close\r\ncontent-length: 2\r\n\r\nok",
        )
        .await
        .unwrap();

    let mut raw = Vec::new();
    tokio::time::timeout(LIMIT, client.read_to_end(&mut raw))
        .await
        .unwrap()
        .unwrap();
    let text = String::from_utf8(raw).unwrap();

    assert_eq!(text.matches("HTTP/1.1 200 OK\r\n").count(), 2);
    assert!(text.contains("7\r\nskipped\r\n0\r\n\r\n"));
    assert!(text.ends_with("2\r\nok\r\n0\r\n\r\n"));
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_truncated_request_body_is_incomplete() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (mut client, task) = serve_pipe(move |request: Request| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(request.body.drain_all().await);
            Ok::<_, DuplexError>(Response::with_static(StatusCode::OK, b""))
        }
    });

    client
        .write_all(b"POST / HTTP/1.1\r\nhost: test\r\ntransfer-encoding: chunked\r\n\r\n1\r\n!\r\n")
        .await
        .unwrap();
    drop(client);

    let outcome = tokio::time::timeout(LIMIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(outcome, Err(BodyError::Incomplete));
    let _ = tokio::time::timeout(LIMIT, task).await.unwrap();
}

#[tokio::test]
async fn test_client_sees_response_head_mid_upload() {
    let (client_io, mut server) = tokio::io::duplex(64 * 1024);
    let conn = Connection::new(Box::new(client_io), Version::Http11, peer());

    let upload = StreamableBody::new();
    let request = Request::new(http::Method::POST, "/")
        .header("hello", "server")
        .body(upload.clone());
    let pending = Http1::send_request(conn, request, "test:80".to_string(), ClientConfig::default())
        .await
        .unwrap();
    assert_eq!(pending.version(), Version::Http11);

    upload.write("!").await.unwrap();
    let mut seen = Vec::new();
    tokio::time::timeout(LIMIT, read_until(&mut server, &mut seen, "1\r\n!\r\n"))
        .await
        .unwrap();
    let head = String::from_utf8_lossy(&seen).into_owned();
    assert!(head.starts_with("POST / HTTP/1.1\r\nhost: test:80\r\n"));
    assert!(head.contains("hello: server\r\n"));

    server
        .write_all(b"HTTP/1.1 200 OK\r\nhello: client\r\ntransfer-encoding: chunked\r\n\r\n")
        .await
        .unwrap();
    let response = tokio::time::timeout(LIMIT, pending.headers()).await.unwrap().unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(find_header(&response.headers, "hello"), Some("client"));

    // the upload is still open and still flowing
    assert!(!upload.is_closed());
    upload.write("!").await.unwrap();
    upload.close();
    tokio::time::timeout(LIMIT, read_until(&mut server, &mut seen, "0\r\n\r\n"))
        .await
        .unwrap();

    server.write_all(b"4\r\ndone\r\n0\r\n\r\n").await.unwrap();
    let body = tokio::time::timeout(LIMIT, response.body.drain_all()).await.unwrap().unwrap();
    assert_eq!(body, Bytes::from_static(b"done"));
}

#[tokio::test]
async fn test_client_connection_loss_fails_both_bodies() {
    let (client_io, mut server) = tokio::io::duplex(64 * 1024);
    let conn = Connection::new(Box::new(client_io), Version::Http11, peer());

    let upload = StreamableBody::new();
    let request = Request::new(http::Method::POST, "/").body(upload.clone());
    let pending = Http1::send_request(conn, request, "test".to_string(), ClientConfig::default())
        .await
        .unwrap();

    server
        .write_all(b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n1\r\na\r\n")
        .await
        .unwrap();
    let response = tokio::time::timeout(LIMIT, pending.headers()).await.unwrap().unwrap();
    drop(server);

    let outcome = tokio::time::timeout(LIMIT, response.body.drain_all()).await.unwrap();
    assert_eq!(outcome, Err(BodyError::Incomplete));
    assert_eq!(upload.write("!").await, Err(BodyError::ConnectionClosed));
}

#[tokio::test]
async fn test_handler_error_becomes_500() {
    let (mut client, task) = serve_pipe(|_request: Request| async move {
        Err::<Response, _>(DuplexError::Config("no route".to_string()))
    });

    client
        .write_all(b"GET / HTTP/1.1\r\nhost: test\r\nconnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut raw = Vec::new();
    tokio::time::timeout(LIMIT, client.read_to_end(&mut raw))
        .await
        .unwrap()
        .unwrap();

    assert!(String::from_utf8(raw).unwrap().starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    task.await.unwrap().unwrap();
}
