//! HTTP/1.1 message heads and body framing.
//!
//! Covers what the stream, SSE and WebSocket adapters need from HTTP/1.1:
//! request heads, status line and header parsing, and bodies delimited by
//! `Content-Length`, `Transfer-Encoding: chunked`, or connection close.

use crate::config::TransportConfig;
use crate::error::{Result, TetherError};
use crate::stream::ByteStream;
use bytes::{Bytes, BytesMut};

/// Request line plus headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Serialize head and body. `Content-Length` is added for any body.
    pub fn encode(&self, body: &[u8]) -> Vec<u8> {
        let mut out = format!("{} {} HTTP/1.1\r\n", self.method, self.target);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        if !body.is_empty() || self.method == "POST" {
            out.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        out.push_str("\r\n");
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(body);
        bytes
    }
}

/// Status line plus headers of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

/// Parse `HTTP/1.1 200 OK` into (status, reason).
pub fn parse_status_line(line: &str) -> Result<(u16, String)> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(TetherError::protocol(format!("invalid status line: {:?}", line)));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .filter(|s| (100..=999).contains(s))
        .ok_or_else(|| TetherError::protocol(format!("invalid status code in {:?}", line)))?;
    let reason = parts.next().unwrap_or_default().to_string();
    Ok((status, reason))
}

/// Parse `Name: value` into a (name, trimmed value) pair.
pub fn parse_header_line(line: &str) -> Result<(String, String)> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| TetherError::protocol(format!("malformed header line: {:?}", line)))?;
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(TetherError::protocol(format!("malformed header name: {:?}", name)));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

impl ResponseHead {
    /// Read one response head from the stream.
    pub async fn read(stream: &mut ByteStream) -> Result<Self> {
        let max = TransportConfig::MAX_LINE_LENGTH;
        let status_line = stream
            .read_line(max)
            .await?
            .ok_or(TetherError::ConnectionClosed)?;
        let (status, reason) = parse_status_line(&status_line)?;

        let mut headers = Vec::new();
        loop {
            let line = stream
                .read_line(max)
                .await?
                .ok_or(TetherError::ConnectionClosed)?;
            if line.is_empty() {
                break;
            }
            if headers.len() >= TransportConfig::MAX_HEADER_COUNT {
                return Err(TetherError::protocol("too many response headers"));
            }
            headers.push(parse_header_line(&line)?);
        }
        Ok(Self {
            status,
            reason,
            headers,
        })
    }

    /// Read heads until a final one, skipping `1xx` interim responses
    /// other than `101 Switching Protocols`.
    pub async fn read_final(stream: &mut ByteStream) -> Result<Self> {
        loop {
            let head = Self::read(stream).await?;
            if head.status >= 200 || head.status == 101 {
                return Ok(head);
            }
        }
    }

    /// First header value with this name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content_length(&self) -> Result<Option<usize>> {
        match self.header("content-length") {
            Some(v) => v
                .parse::<usize>()
                .map(Some)
                .map_err(|_| TetherError::protocol(format!("invalid Content-Length {:?}", v))),
            None => Ok(None),
        }
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    /// Whether the server will close the connection after this response.
    pub fn connection_close(&self) -> bool {
        self.header("connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false)
    }

    /// How the body following this head is delimited.
    pub fn body_kind(&self) -> Result<BodyKind> {
        if self.status == 204 || self.status == 304 || (100..200).contains(&self.status) {
            return Ok(BodyKind::Empty);
        }
        if self.is_chunked() {
            return Ok(BodyKind::Chunked);
        }
        Ok(match self.content_length()? {
            Some(0) => BodyKind::Empty,
            Some(n) => BodyKind::Length(n),
            None => BodyKind::UntilClose,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Empty,
    Length(usize),
    Chunked,
    UntilClose,
}

/// Incremental body reader yielding decoded body bytes.
#[derive(Debug)]
pub struct BodyDecoder {
    kind: BodyKind,
    remaining: usize,
    need_crlf: bool,
    finished: bool,
}

impl BodyDecoder {
    pub fn new(kind: BodyKind) -> Self {
        let remaining = match kind {
            BodyKind::Length(n) => n,
            _ => 0,
        };
        Self {
            kind,
            remaining,
            need_crlf: false,
            finished: kind == BodyKind::Empty,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next piece of decoded body, or `None` once the body is complete.
    pub async fn next_chunk(&mut self, stream: &mut ByteStream) -> Result<Option<Bytes>> {
        if self.finished {
            return Ok(None);
        }
        match self.kind {
            BodyKind::Empty => {
                self.finished = true;
                Ok(None)
            }
            BodyKind::Length(_) => {
                if self.remaining == 0 {
                    self.finished = true;
                    return Ok(None);
                }
                let data = stream.recv(self.remaining).await?;
                if data.is_empty() {
                    return Err(TetherError::ConnectionClosed);
                }
                self.remaining -= data.len();
                Ok(Some(data))
            }
            BodyKind::UntilClose => {
                let data = stream.recv(TransportConfig::READ_CHUNK_SIZE).await?;
                if data.is_empty() {
                    self.finished = true;
                    return Ok(None);
                }
                Ok(Some(data))
            }
            BodyKind::Chunked => {
                if self.remaining == 0 {
                    if self.need_crlf {
                        let line = stream
                            .read_line(TransportConfig::MAX_LINE_LENGTH)
                            .await?
                            .ok_or(TetherError::ConnectionClosed)?;
                        if !line.is_empty() {
                            return Err(TetherError::protocol("missing CRLF after chunk data"));
                        }
                        self.need_crlf = false;
                    }
                    let size = self.read_chunk_size(stream).await?;
                    if size == 0 {
                        // Trailer section ends with an empty line
                        loop {
                            let line = stream
                                .read_line(TransportConfig::MAX_LINE_LENGTH)
                                .await?
                                .ok_or(TetherError::ConnectionClosed)?;
                            if line.is_empty() {
                                break;
                            }
                        }
                        self.finished = true;
                        return Ok(None);
                    }
                    self.remaining = size;
                }
                let data = stream.recv(self.remaining).await?;
                if data.is_empty() {
                    return Err(TetherError::ConnectionClosed);
                }
                self.remaining -= data.len();
                if self.remaining == 0 {
                    self.need_crlf = true;
                }
                Ok(Some(data))
            }
        }
    }

    async fn read_chunk_size(&self, stream: &mut ByteStream) -> Result<usize> {
        let line = stream
            .read_line(TransportConfig::MAX_LINE_LENGTH)
            .await?
            .ok_or(TetherError::ConnectionClosed)?;
        let size = line.split(';').next().unwrap_or_default().trim();
        usize::from_str_radix(size, 16)
            .map_err(|_| TetherError::protocol(format!("invalid chunk size {:?}", size)))
    }

    /// Read the whole body, failing if it exceeds `max`.
    pub async fn read_to_end(&mut self, stream: &mut ByteStream, max: usize) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        while let Some(chunk) = self.next_chunk(stream).await? {
            if body.len() + chunk.len() > max {
                return Err(TetherError::protocol(format!(
                    "response body exceeds maximum {}",
                    max
                )));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

/// Line reader over a delimited body.
#[derive(Debug)]
pub struct BodyLines {
    decoder: BodyDecoder,
    pending: BytesMut,
}

impl BodyLines {
    pub fn new(kind: BodyKind) -> Self {
        Self {
            decoder: BodyDecoder::new(kind),
            pending: BytesMut::new(),
        }
    }

    /// True once the whole body has been consumed.
    pub fn is_finished(&self) -> bool {
        self.decoder.is_finished() && self.pending.is_empty()
    }

    /// Next line without its terminator, or `None` at the end of the body.
    pub async fn next_line(&mut self, stream: &mut ByteStream) -> Result<Option<String>> {
        loop {
            if let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
                let mut line = self.pending.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(pos - 1);
                }
                return String::from_utf8(line.to_vec())
                    .map(Some)
                    .map_err(|_| TetherError::protocol("body line is not valid UTF-8"));
            }
            if self.pending.len() > TransportConfig::MAX_LINE_LENGTH {
                return Err(TetherError::protocol("body line exceeds maximum length"));
            }
            match self.decoder.next_chunk(stream).await? {
                Some(chunk) => self.pending.extend_from_slice(&chunk),
                None => {
                    if self.pending.is_empty() {
                        return Ok(None);
                    }
                    let rest = self.pending.split().to_vec();
                    return String::from_utf8(rest)
                        .map(Some)
                        .map_err(|_| TetherError::protocol("body line is not valid UTF-8"));
                }
            }
        }
    }
}
