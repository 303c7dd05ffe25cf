//! Requests, responses and the protocol versions that carry them

use crate::body::StreamableBody;
use http::{Method, StatusCode};
use std::fmt;

/// Header list in wire order; duplicate names are allowed
pub type Headers = Vec<(String, String)>;

/// HTTP version spoken on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Version {
    Http11,
    Http2,
}

impl Version {
    /// ALPN protocol identifier for this version
    pub fn alpn_id(&self) -> &'static [u8] {
        match self {
            Version::Http11 => b"http/1.1",
            Version::Http2 => b"h2",
        }
    }

    /// Maps a negotiated ALPN protocol to a version; no protocol means HTTP/1.1
    pub fn from_alpn(protocol: Option<&[u8]>) -> Self {
        match protocol {
            Some(b"h2") => Version::Http2,
            _ => Version::Http11,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::Http11 => f.write_str("HTTP/1.1"),
            Version::Http2 => f.write_str("HTTP/2"),
        }
    }
}

/// Case-insensitive lookup of the first header named `name`
pub fn find_header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// A request whose body may still be streaming
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub headers: Headers,
    pub body: StreamableBody,
}

impl Request {
    /// Creates a request with no headers and an empty, closed body
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            body: StreamableBody::empty(),
        }
    }

    /// Appends a header, keeping any existing ones with the same name
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replaces the body
    pub fn body(mut self, body: StreamableBody) -> Self {
        self.body = body;
        self
    }

    /// First value of the header named `name`
    pub fn header_value(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// A response whose body may still be streaming
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: StreamableBody,
}

impl Response {
    pub fn new(status: StatusCode, headers: Headers, body: StreamableBody) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// A response with a fixed body and no extra headers
    pub fn with_static(status: StatusCode, body: &'static [u8]) -> Self {
        Self::new(status, Vec::new(), StreamableBody::from_static(body))
    }

    /// First value of the header named `name`
    pub fn header_value(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}
