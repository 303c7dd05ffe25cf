use crate::Result;
use crate::message::Version;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::fmt;
use std::sync::Arc;

/// Protocols the server side is able to speak, as ALPN identifiers
pub const SUPPORTED_PROTOCOLS: [&[u8]; 2] = [b"http/1.1", b"h2"];

/// ALPN policy: choose the last protocol the peer offered
///
/// Clients list their preferred protocol last (`["http/1.1", "h2"]`), so
/// this picks HTTP/2 whenever it is offered after HTTP/1.1.
pub fn select_last_offered<'a>(offered: &[&'a [u8]]) -> Option<&'a [u8]> {
    offered.last().copied()
}

/// Client and server TLS configuration for one hostname
#[derive(Clone)]
pub struct TlsContext {
    server: Arc<rustls::ServerConfig>,
    client: Arc<rustls::ClientConfig>,
    server_name: ServerName<'static>,
}

pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

impl TlsContext {
    /// Builds both sides from a certificate chain and key for `host`
    ///
    /// The client trusts exactly the given chain and advertises
    /// `["http/1.1", "h2"]`. The server config carries no ALPN list of its
    /// own; one is chosen per connection from the peer's ClientHello.
    pub fn new(
        host: &str,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self> {
        let server = rustls::ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(chain.clone(), key)?;

        let mut roots = rustls::RootCertStore::empty();
        for cert in chain {
            roots.add(cert)?;
        }
        let mut client = rustls::ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        client.alpn_protocols = vec![
            Version::Http11.alpn_id().to_vec(),
            Version::Http2.alpn_id().to_vec(),
        ];

        let server_name = ServerName::try_from(host.to_string()).map_err(|e| {
            crate::DuplexError::Config(format!("Invalid TLS server name {host:?}: {e}"))
        })?;

        Ok(Self {
            server: Arc::new(server),
            client: Arc::new(client),
            server_name,
        })
    }

    /// Server config for a connection whose ClientHello offered `offered`
    ///
    /// Offers the peer makes that this crate cannot speak are ignored before
    /// the policy runs. Returns the config and the version it commits to.
    pub fn server_config_for(&self, offered: &[&[u8]]) -> (Arc<rustls::ServerConfig>, Version) {
        let speakable: Vec<&[u8]> = offered
            .iter()
            .copied()
            .filter(|protocol| SUPPORTED_PROTOCOLS.contains(protocol))
            .collect();

        match select_last_offered(&speakable) {
            Some(protocol) => {
                let mut config = (*self.server).clone();
                config.alpn_protocols = vec![protocol.to_vec()];
                (Arc::new(config), Version::from_alpn(Some(protocol)))
            }
            None => (self.server.clone(), Version::Http11),
        }
    }

    pub fn client_config(&self) -> Arc<rustls::ClientConfig> {
        self.client.clone()
    }

    pub fn server_name(&self) -> ServerName<'static> {
        self.server_name.clone()
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("server_name", &self.server_name)
            .field("client_alpn", &self.client.alpn_protocols)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> TlsContext {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let key = rustls::pki_types::PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
        TlsContext::new(
            "localhost",
            vec![certified.cert.der().clone()],
            key.into(),
        )
        .unwrap()
    }

    #[test]
    fn test_select_last_offered() {
        assert_eq!(
            select_last_offered(&[b"http/1.1", b"h2"]),
            Some(&b"h2"[..])
        );
        assert_eq!(
            select_last_offered(&[b"h2", b"http/1.1"]),
            Some(&b"http/1.1"[..])
        );
        assert_eq!(select_last_offered(&[]), None);
    }

    #[test]
    fn test_client_advertises_fixed_order() {
        let context = context();
        assert_eq!(
            context.client_config().alpn_protocols,
            vec![b"http/1.1".to_vec(), b"h2".to_vec()]
        );
    }

    #[test]
    fn test_server_config_follows_policy() {
        let context = context();

        let (config, version) = context.server_config_for(&[b"http/1.1", b"h2"]);
        assert_eq!(version, Version::Http2);
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);

        let (config, version) = context.server_config_for(&[b"http/1.1"]);
        assert_eq!(version, Version::Http11);
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);

        let (config, version) = context.server_config_for(&[b"http/1.1", b"h3"]);
        assert_eq!(version, Version::Http11);
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);

        let (config, version) = context.server_config_for(&[]);
        assert_eq!(version, Version::Http11);
        assert!(config.alpn_protocols.is_empty());
    }
}
