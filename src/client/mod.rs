//! Client engine
//!
//! Opens a connection to an [`Endpoint`](crate::Endpoint), negotiates the
//! protocol, and sends one streaming request per call. The caller keeps
//! writing the request body after the request has been sent and can read
//! the response while doing so.

pub mod config;
pub mod engine;

pub use config::{ClientConfig, ClientConfigBuilder};
pub use engine::{Client, PendingResponse};
