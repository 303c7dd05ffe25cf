use super::tls::TlsContext;
use crate::{DuplexError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable overriding where certificates are kept
pub const STATE_DIR_ENV: &str = "DUPLEXSRV_STATE_DIR";

/// Issues and remembers self-signed certificates per hostname
///
/// Certificates are stored as `<host>.crt` / `<host>.key` PEM files under
/// the root directory and reused on later runs.
#[derive(Debug, Clone)]
pub struct CertificateAuthority {
    root: PathBuf,
}

impl CertificateAuthority {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$DUPLEXSRV_STATE_DIR`, else `$HOME/.duplexsrv`, else a directory in
    /// the system temp dir
    pub fn from_env() -> Self {
        let root = std::env::var_os(STATE_DIR_ENV)
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".duplexsrv")))
            .unwrap_or_else(|| std::env::temp_dir().join("duplexsrv"));
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn paths(&self, host: &str) -> (PathBuf, PathBuf) {
        let stem: String = host
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        (
            self.root.join(format!("{stem}.crt")),
            self.root.join(format!("{stem}.key")),
        )
    }

    /// Loads the stored certificate for `host`, generating and storing one
    /// first if none exists
    pub fn certificate_for(
        &self,
        host: &str,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let (cert_path, key_path) = self.paths(host);
        if cert_path.exists() && key_path.exists() {
            debug!(host, path = %cert_path.display(), "Loading stored certificate");
            return load_pair(&cert_path, &key_path);
        }

        info!(host, root = %self.root.display(), "Generating self-signed certificate");
        let certified = rcgen::generate_simple_self_signed(vec![host.to_string()])
            .map_err(|e| DuplexError::Config(format!("Certificate generation failed: {e}")))?;

        fs::create_dir_all(&self.root)?;
        fs::write(&cert_path, certified.cert.pem())?;
        fs::write(&key_path, certified.key_pair.serialize_pem())?;

        let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
        Ok((vec![certified.cert.der().clone()], key.into()))
    }

    /// Server and client TLS contexts for `host`
    pub fn tls_context(&self, host: &str) -> Result<TlsContext> {
        let (chain, key) = self.certificate_for(host)?;
        TlsContext::new(host, chain, key)
    }
}

fn load_pair(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut reader = BufReader::new(fs::File::open(cert_path)?);
    let chain = rustls_pemfile::certs(&mut reader).collect::<std::io::Result<Vec<_>>>()?;
    if chain.is_empty() {
        return Err(DuplexError::Config(format!(
            "No certificates in {}",
            cert_path.display()
        )));
    }

    let mut reader = BufReader::new(fs::File::open(key_path)?);
    let key = rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
        DuplexError::Config(format!("No private key in {}", key_path.display()))
    })?;

    Ok((chain, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_certificate_is_generated_then_reused() {
        let dir = tempdir().unwrap();
        let authority = CertificateAuthority::new(dir.path());

        let (first, _) = authority.certificate_for("localhost").unwrap();
        assert!(dir.path().join("localhost.crt").exists());
        assert!(dir.path().join("localhost.key").exists());

        let (second, _) = authority.certificate_for("localhost").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_hosts_get_separate_files() {
        let dir = tempdir().unwrap();
        let authority = CertificateAuthority::new(dir.path());

        authority.certificate_for("localhost").unwrap();
        authority.certificate_for("::1").unwrap();
        assert!(dir.path().join("__1.crt").exists());
    }

    #[test]
    fn test_garbage_key_file_is_rejected() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("broken.crt"), "not pem").unwrap();
        fs::write(dir.path().join("broken.key"), "not pem").unwrap();

        let authority = CertificateAuthority::new(dir.path());
        assert!(matches!(
            authority.certificate_for("broken"),
            Err(DuplexError::Config(_))
        ));
    }

    #[test]
    fn test_secure_endpoint_carries_tls() {
        let dir = tempdir().unwrap();
        let authority = CertificateAuthority::new(dir.path());
        let endpoint = crate::Endpoint::parse_with("https://localhost:8443", &authority).unwrap();
        assert!(endpoint.is_secure());
        assert!(endpoint.tls().is_some());

        let plain = crate::Endpoint::parse_with("http://localhost:8080", &authority).unwrap();
        assert!(plain.tls().is_none());
    }
}
