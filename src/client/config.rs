use std::time::Duration;

/// Configuration for the client engine
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long to wait for TCP connect plus the TLS handshake
    pub connect_timeout: Duration,
    /// Initial read buffer size for the response side
    pub buffer_size: usize,
    /// Maximum number of headers accepted in a response
    pub max_headers: usize,
    /// Maximum size of a status line plus headers
    pub max_head_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            buffer_size: 8192,
            max_headers: 64,
            max_head_bytes: 16 * 1024,
        }
    }
}

/// Builder for client configuration
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    pub fn max_headers(mut self, count: usize) -> Self {
        self.config.max_headers = count;
        self
    }

    pub fn max_head_bytes(mut self, size: usize) -> Self {
        self.config.max_head_bytes = size;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
