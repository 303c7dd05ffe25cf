use std::time::Duration;

/// Configuration for the server engine
///
/// # Examples
///
/// ```
/// use duplexsrv::server::ServerConfig;
/// use std::time::Duration;
///
/// let config = ServerConfig {
///     max_connections: 10,
///     header_read_timeout: Duration::from_secs(5),
///     ..Default::default()
/// };
/// assert_eq!(config.max_headers, 64);
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Initial read buffer size per connection
    pub buffer_size: usize,
    /// How long a connection may sit without sending a complete request
    /// head, including the TLS handshake
    pub header_read_timeout: Duration,
    /// Maximum number of headers in one request
    pub max_headers: usize,
    /// Maximum size of a request line plus headers
    pub max_head_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            buffer_size: 8192,
            header_read_timeout: Duration::from_secs(30),
            max_headers: 64,
            max_head_bytes: 16 * 1024,
        }
    }
}
