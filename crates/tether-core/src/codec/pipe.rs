//! Local pipe protocol types and framing.
//!
//! Every unit on the pipe is a length-prefixed frame:
//!
//! ```text
//! [u32 BE: len][len bytes]
//! ```
//!
//! A call is a JSON [`PipeRequest`] header frame followed by one raw body
//! frame. The reply is a JSON [`PipeResponse`] header frame followed by
//! either one raw body frame (unary) or a sequence of JSON `Frame`s ending
//! with a terminal event (stream).

use crate::error::{Result, TetherError};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Header frame of a pipe call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeRequest {
    pub id: u64,
    pub route: String,
    /// True for `server_stream` calls.
    #[serde(default)]
    pub stream: bool,
}

impl PipeRequest {
    pub fn new(id: u64, route: impl Into<String>, stream: bool) -> Self {
        Self {
            id,
            route: route.into(),
            stream,
        }
    }
}

/// Header frame of a pipe reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeResponse {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PipeError>,
}

impl PipeResponse {
    /// Create a success header.
    pub fn ok(id: u64) -> Self {
        Self { id, error: None }
    }

    /// Create an error header. No body follows an error header.
    pub fn error(id: u64, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id,
            error: Some(PipeError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}

/// Error object of a failed pipe call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeError {
    pub code: String,
    pub message: String,
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed the pipe).
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(TetherError::protocol(format!(
            "pipe frame size {} exceeds maximum {}",
            len, max_size
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| TetherError::protocol("pipe frame larger than 4 GiB"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Incremental parser for use with `ByteStream::read_frame_with`.
pub fn parse_frame(buf: &[u8], max_size: usize) -> Result<Option<(Vec<u8>, usize)>> {
    let Some(len_bytes) = buf.get(..4) else {
        return Ok(None);
    };
    let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
    if len > max_size {
        return Err(TetherError::protocol(format!(
            "pipe frame size {} exceeds maximum {}",
            len, max_size
        )));
    }
    match buf.get(4..4 + len) {
        Some(payload) => Ok(Some((payload.to_vec(), 4 + len))),
        None => Ok(None),
    }
}

/// Encode a frame into a standalone buffer.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| TetherError::protocol("pipe frame larger than 4 GiB"))?;
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}
