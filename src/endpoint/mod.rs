//! Endpoint descriptors: where to listen or dial, and whether to wrap the
//! socket in TLS

pub mod address;
pub mod authority;
pub mod tls;

pub use address::{DEFAULT_URL, Endpoint, Scheme};
pub use authority::CertificateAuthority;
pub use tls::{TlsContext, select_last_offered};
