use crate::message::{Headers, find_header};
use crate::protocol::ProtocolError;
use bytes::{Buf, Bytes, BytesMut};
use http::{Method, StatusCode};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Parsed request line and headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Method,
    pub path: String,
    pub headers: Headers,
    /// The peer asked for the connection to end after this exchange
    pub close: bool,
}

/// Parsed status line and headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: Headers,
}

/// Frames produced while reading an HTTP/1.1 message stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Request(RequestHead),
    Response(ResponseHead),
    Data(Bytes),
    /// End of the current message body; the next frame is a new head
    End,
}

/// Frames written to an HTTP/1.1 message stream
#[derive(Debug, Clone)]
pub enum Outgoing {
    /// Request head; the body that follows is always chunked
    Request {
        method: Method,
        path: String,
        host: String,
        headers: Headers,
    },
    /// Response head; `chunked: false` means an empty body with
    /// `content-length: 0`
    Response {
        status: StatusCode,
        headers: Headers,
        chunked: bool,
        close: bool,
    },
    Chunk(Bytes),
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// Reads requests
    Server,
    /// Reads responses
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Fixed(u64),
    ChunkSize,
    ChunkData(u64),
    ChunkEnd,
    Trailers,
    UntilClose,
}

/// Incremental HTTP/1.1 decoder: heads through `httparse`, bodies as
/// content-length, chunked, or read-until-close
#[derive(Debug)]
pub struct Http1Decoder {
    role: Role,
    state: State,
    max_headers: usize,
    /// Limit on buffered bytes for heads, chunk-size lines and trailers
    max_head_bytes: usize,
    /// Bytes of the trailer block already searched for its terminator
    scanned: usize,
}

impl Http1Decoder {
    /// Decoder for the server side of a connection
    pub fn requests(max_headers: usize, max_head_bytes: usize) -> Self {
        Self::new(Role::Server, max_headers, max_head_bytes)
    }

    /// Decoder for the client side of a connection
    pub fn responses(max_headers: usize, max_head_bytes: usize) -> Self {
        Self::new(Role::Client, max_headers, max_head_bytes)
    }

    fn new(role: Role, max_headers: usize, max_head_bytes: usize) -> Self {
        Self {
            role,
            state: State::Head,
            max_headers,
            max_head_bytes,
            scanned: 0,
        }
    }

    /// True between messages
    pub fn is_idle(&self) -> bool {
        self.state == State::Head
    }

    fn decode_head(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>, ProtocolError> {
        let parsed = match self.role {
            Role::Server => {
                let mut raw = vec![httparse::EMPTY_HEADER; self.max_headers];
                let mut req = httparse::Request::new(&mut raw);
                match req.parse(src)? {
                    httparse::Status::Complete(len) => {
                        let method = req.method.unwrap_or_default();
                        let method = Method::from_bytes(method.as_bytes()).map_err(|_| {
                            ProtocolError::InvalidMessage(format!("Invalid method {method:?}"))
                        })?;
                        let path = req.path.unwrap_or("/").to_string();
                        let headers = collect_headers(req.headers)?;
                        let http10 = req.version == Some(0);
                        Some((len, Decoded::Request(RequestHead {
                            close: wants_close(&headers, http10),
                            method,
                            path,
                            headers,
                        })))
                    }
                    httparse::Status::Partial => None,
                }
            }
            Role::Client => {
                let mut raw = vec![httparse::EMPTY_HEADER; self.max_headers];
                let mut res = httparse::Response::new(&mut raw);
                match res.parse(src)? {
                    httparse::Status::Complete(len) => {
                        let code = res.code.unwrap_or_default();
                        let status = StatusCode::from_u16(code).map_err(|_| {
                            ProtocolError::InvalidMessage(format!("Invalid status {code}"))
                        })?;
                        let headers = collect_headers(res.headers)?;
                        Some((len, Decoded::Response(ResponseHead { status, headers })))
                    }
                    httparse::Status::Partial => None,
                }
            }
        };

        let Some((len, head)) = parsed else {
            if src.len() > self.max_head_bytes {
                return Err(ProtocolError::HeadersTooLarge(self.max_head_bytes));
            }
            return Ok(None);
        };
        src.advance(len);

        self.state = match &head {
            Decoded::Request(head) => body_state(&head.headers, None)?,
            Decoded::Response(head) => body_state(&head.headers, Some(head.status))?,
            _ => State::Head,
        };
        Ok(Some(head))
    }
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Result<Headers, ProtocolError> {
    raw.iter()
        .map(|header| {
            let value = std::str::from_utf8(header.value).map_err(|_| {
                ProtocolError::InvalidMessage(format!("Header {} is not UTF-8", header.name))
            })?;
            Ok((header.name.to_string(), value.trim().to_string()))
        })
        .collect()
}

fn has_token(headers: &Headers, name: &str, token: &str) -> bool {
    headers
        .iter()
        .filter(|(key, _)| key.eq_ignore_ascii_case(name))
        .flat_map(|(_, value)| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

fn wants_close(headers: &Headers, http10: bool) -> bool {
    if has_token(headers, "connection", "close") {
        return true;
    }
    http10 && !has_token(headers, "connection", "keep-alive")
}

/// Body framing for a message with `headers`; `status` is `None` for requests
fn body_state(headers: &Headers, status: Option<StatusCode>) -> Result<State, ProtocolError> {
    if let Some(status) = status {
        if status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            return Ok(State::Fixed(0));
        }
    }
    if has_token(headers, "transfer-encoding", "chunked") {
        return Ok(State::ChunkSize);
    }
    if let Some(length) = find_header(headers, "content-length") {
        let length = length.parse::<u64>().map_err(|_| {
            ProtocolError::InvalidMessage(format!("Invalid content-length {length:?}"))
        })?;
        return Ok(State::Fixed(length));
    }
    Ok(match status {
        None => State::Fixed(0),
        Some(_) => State::UntilClose,
    })
}

fn take(src: &mut BytesMut, remaining: u64) -> Bytes {
    let n = usize::try_from(remaining).unwrap_or(usize::MAX).min(src.len());
    src.split_to(n).freeze()
}

impl Decoder for Http1Decoder {
    type Item = Decoded;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>, ProtocolError> {
        loop {
            match self.state {
                State::Head => return self.decode_head(src),
                State::Fixed(0) => {
                    self.state = State::Head;
                    return Ok(Some(Decoded::End));
                }
                State::Fixed(remaining) => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let data = take(src, remaining);
                    self.state = State::Fixed(remaining - data.len() as u64);
                    return Ok(Some(Decoded::Data(data)));
                }
                State::ChunkSize => match httparse::parse_chunk_size(src) {
                    Ok(httparse::Status::Complete((used, 0))) => {
                        src.advance(used);
                        self.state = State::Trailers;
                    }
                    Ok(httparse::Status::Complete((used, size))) => {
                        src.advance(used);
                        self.state = State::ChunkData(size);
                    }
                    Ok(httparse::Status::Partial) => {
                        if src.len() > self.max_head_bytes {
                            return Err(ProtocolError::HeadersTooLarge(self.max_head_bytes));
                        }
                        return Ok(None);
                    }
                    Err(_) => {
                        return Err(ProtocolError::InvalidMessage("Invalid chunk size".to_string()));
                    }
                },
                State::ChunkData(remaining) => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let data = take(src, remaining);
                    let left = remaining - data.len() as u64;
                    self.state = if left == 0 { State::ChunkEnd } else { State::ChunkData(left) };
                    return Ok(Some(Decoded::Data(data)));
                }
                State::ChunkEnd => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    if &src[..2] != b"\r\n" {
                        return Err(ProtocolError::InvalidMessage(
                            "Missing CRLF after chunk".to_string(),
                        ));
                    }
                    src.advance(2);
                    self.state = State::ChunkSize;
                }
                State::Trailers => {
                    if src.starts_with(b"\r\n") {
                        src.advance(2);
                    } else {
                        // the terminator may straddle the previous read
                        let from = self.scanned.saturating_sub(3);
                        match src[from..].windows(4).position(|w| w == b"\r\n\r\n") {
                            Some(pos) => src.advance(from + pos + 4),
                            None => {
                                if src.len() > self.max_head_bytes {
                                    return Err(ProtocolError::HeadersTooLarge(self.max_head_bytes));
                                }
                                self.scanned = src.len();
                                return Ok(None);
                            }
                        }
                    }
                    self.scanned = 0;
                    self.state = State::Head;
                    return Ok(Some(Decoded::End));
                }
                State::UntilClose => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(Decoded::Data(src.split().freeze())));
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>, ProtocolError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        match self.state {
            State::UntilClose => {
                self.state = State::Head;
                Ok(Some(Decoded::End))
            }
            State::Head if src.is_empty() => Ok(None),
            _ => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed in the middle of a message",
            )
            .into()),
        }
    }
}

/// Writes heads and chunked bodies
#[derive(Debug, Default)]
pub struct Http1Encoder;

fn put_headers(dst: &mut BytesMut, headers: &Headers) {
    for (name, value) in headers {
        if crate::protocol::is_framing_header(name) {
            continue;
        }
        dst.extend_from_slice(name.as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }
}

impl Encoder<Outgoing> for Http1Encoder {
    type Error = ProtocolError;

    fn encode(&mut self, item: Outgoing, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match item {
            Outgoing::Request {
                method,
                path,
                host,
                headers,
            } => {
                dst.extend_from_slice(format!("{method} {path} HTTP/1.1\r\nhost: {host}\r\n").as_bytes());
                put_headers(dst, &headers);
                dst.extend_from_slice(b"transfer-encoding: chunked\r\n\r\n");
            }
            Outgoing::Response {
                status,
                headers,
                chunked,
                close,
            } => {
                dst.extend_from_slice(
                    format!(
                        "HTTP/1.1 {} {}\r\n",
                        status.as_u16(),
                        status.canonical_reason().unwrap_or("")
                    )
                    .as_bytes(),
                );
                put_headers(dst, &headers);
                if close {
                    dst.extend_from_slice(b"connection: close\r\n");
                }
                if chunked {
                    dst.extend_from_slice(b"transfer-encoding: chunked\r\n\r\n");
                } else {
                    dst.extend_from_slice(b"content-length: 0\r\n\r\n");
                }
            }
            Outgoing::Chunk(data) => {
                // A zero-length chunk would read as the terminator
                if data.is_empty() {
                    return Ok(());
                }
                dst.extend_from_slice(format!("{:X}\r\n", data.len()).as_bytes());
                dst.extend_from_slice(&data);
                dst.extend_from_slice(b"\r\n");
            }
            Outgoing::End => dst.extend_from_slice(b"0\r\n\r\n"),
        }
        Ok(())
    }
}
