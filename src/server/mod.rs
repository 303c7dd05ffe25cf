//! Server engine
//!
//! Accepts connections, completes the TLS/ALPN handshake per connection,
//! and hands each decoded request to a [`Handler`] while the request body is
//! still arriving.

pub mod config;
pub mod engine;
pub mod handler;

pub use config::ServerConfig;
pub use engine::Server;
pub use handler::Handler;
