use super::authority::CertificateAuthority;
use super::tls::TlsContext;
use crate::{DuplexError, Result};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use url::Url;

/// URL used when none is given on the command line
pub const DEFAULT_URL: &str = "http://localhost:9000";

/// URL scheme of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn is_secure(&self) -> bool {
        matches!(self, Scheme::Https)
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl FromStr for Scheme {
    type Err = DuplexError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            other => Err(DuplexError::EndpointParse(format!(
                "Unsupported scheme: {other}"
            ))),
        }
    }
}

/// Resolved description of where a server listens and a client dials
///
/// Secure endpoints always carry a [`TlsContext`]; plain ones never do. The
/// fields are private so that invariant holds for every value.
#[derive(Debug, Clone)]
pub struct Endpoint {
    scheme: Scheme,
    host: String,
    port: u16,
    tls: Option<TlsContext>,
}

/// Scheme, host and port pulled out of a URL, before any TLS material is loaded
#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedUrl {
    scheme: Scheme,
    host: String,
    port: u16,
}

fn parse_url(input: &str) -> Result<ParsedUrl> {
    let url = Url::parse(input)
        .map_err(|e| DuplexError::EndpointParse(format!("Invalid URL {input:?}: {e}")))?;
    let scheme: Scheme = url.scheme().parse()?;
    let host = match url.host() {
        Some(url::Host::Domain(domain)) => domain.to_string(),
        Some(url::Host::Ipv4(ip)) => ip.to_string(),
        Some(url::Host::Ipv6(ip)) => ip.to_string(),
        None => {
            return Err(DuplexError::EndpointParse(format!(
                "URL {input:?} has no host"
            )));
        }
    };
    let port = url.port().unwrap_or_else(|| scheme.default_port());
    Ok(ParsedUrl { scheme, host, port })
}

impl Endpoint {
    /// Parses `url`, loading or generating TLS material from the default
    /// certificate directory when the scheme is `https`
    pub fn parse(url: &str) -> Result<Self> {
        let parsed = parse_url(url)?;
        let authority = if parsed.scheme.is_secure() {
            Some(CertificateAuthority::from_env())
        } else {
            None
        };
        Self::from_parsed(parsed, authority.as_ref())
    }

    /// Parses `url`, taking TLS material from `authority` when the scheme is
    /// `https`
    pub fn parse_with(url: &str, authority: &CertificateAuthority) -> Result<Self> {
        let parsed = parse_url(url)?;
        Self::from_parsed(parsed, Some(authority))
    }

    fn from_parsed(parsed: ParsedUrl, authority: Option<&CertificateAuthority>) -> Result<Self> {
        let tls = match (parsed.scheme, authority) {
            (Scheme::Https, Some(authority)) => Some(authority.tls_context(&parsed.host)?),
            (Scheme::Https, None) => {
                return Err(DuplexError::Config(
                    "Secure endpoint requires a certificate authority".to_string(),
                ));
            }
            (Scheme::Http, _) => None,
        };

        Ok(Self {
            scheme: parsed.scheme,
            host: parsed.host,
            port: parsed.port,
            tls,
        })
    }

    /// Plain-text endpoint for a socket address
    pub fn plain(addr: SocketAddr) -> Self {
        Self {
            scheme: Scheme::Http,
            host: addr.ip().to_string(),
            port: addr.port(),
            tls: None,
        }
    }

    /// Same endpoint on a different port (e.g. after binding port 0)
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn tls(&self) -> Option<&TlsContext> {
        self.tls.as_ref()
    }

    pub fn is_secure(&self) -> bool {
        self.scheme.is_secure()
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Resolves the host to the socket addresses to bind or dial, in
    /// resolver order
    pub async fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| DuplexError::Connection(format!("Failed to resolve {}: {e}", self.host)))?
            .collect();
        if addrs.is_empty() {
            return Err(DuplexError::Connection(format!(
                "No addresses found for {}",
                self.host
            )));
        }
        Ok(addrs)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.authority())
    }
}
