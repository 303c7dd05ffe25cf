use super::Connection;
use crate::endpoint::Endpoint;
use crate::message::Version;
use crate::{DuplexError, Result};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Dials `endpoint`, trying each resolved address in turn
///
/// Secure endpoints complete a TLS handshake advertising
/// `["http/1.1", "h2"]`; the version the server picked is recorded on the
/// returned connection. Plain endpoints are always HTTP/1.1.
pub async fn connect(endpoint: &Endpoint, connect_timeout: Duration) -> Result<Connection> {
    let mut last_error = String::from("no addresses tried");
    let mut established = None;
    for addr in endpoint.resolve().await? {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                established = Some((stream, addr));
                break;
            }
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "Connect failed");
                last_error = e.to_string();
            }
            Err(_) => {
                debug!(%addr, "Connect timed out");
                last_error = format!("timed out after {connect_timeout:?}");
            }
        }
    }

    let Some((stream, peer)) = established else {
        return Err(DuplexError::Connection(format!(
            "Failed to connect to {endpoint}: {last_error}"
        )));
    };
    stream.set_nodelay(true)?;

    let Some(tls) = endpoint.tls() else {
        return Ok(Connection::new(Box::new(stream), Version::Http11, peer));
    };

    let connector = TlsConnector::from(tls.client_config());
    let stream = timeout(connect_timeout, connector.connect(tls.server_name(), stream))
        .await
        .map_err(|_| DuplexError::Connection(format!("TLS handshake with {peer} timed out")))?
        .map_err(|e| DuplexError::Connection(format!("TLS handshake with {peer}: {e}")))?;
    let version = Version::from_alpn(stream.get_ref().1.alpn_protocol());
    debug!(%peer, %version, "TLS established");

    Ok(Connection::new(Box::new(stream), version, peer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::CertificateAuthority;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_silent_tls_peer_is_a_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let endpoint = Endpoint::parse_with(
            &format!("https://127.0.0.1:{port}"),
            &CertificateAuthority::new(dir.path()),
        )
        .unwrap();

        // accepts but never answers the ClientHello
        let holder = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let result = connect(&endpoint, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(DuplexError::Connection(msg)) if msg.contains("timed out")));
        holder.abort();
    }
}
