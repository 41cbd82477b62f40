//! gRPC length-prefixed message framing.
//!
//! ```text
//! [u8 compressed flag][u32 BE length][message bytes]
//! ```
//!
//! Messages may span several DATA frames and one DATA frame may carry
//! several messages, so decoding goes through an accumulating
//! [`MessageDecoder`].

use crate::error::{Result, TetherError};
use bytes::{Buf, BytesMut};

pub const MESSAGE_PREFIX_LEN: usize = 5;

/// Prefix `message` with the 5-byte gRPC header (uncompressed).
pub fn encode_message(message: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(message.len())
        .map_err(|_| TetherError::protocol("gRPC message larger than 4 GiB"))?;
    let mut out = Vec::with_capacity(MESSAGE_PREFIX_LEN + message.len());
    out.push(0);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(message);
    Ok(out)
}

/// Reassembles gRPC messages from DATA frame payloads.
#[derive(Debug)]
pub struct MessageDecoder {
    buf: BytesMut,
    max_message_size: usize,
}

impl MessageDecoder {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_message_size,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete message, if one is buffered.
    pub fn next_message(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(prefix) = self.buf.get(..MESSAGE_PREFIX_LEN) else {
            return Ok(None);
        };
        match prefix[0] {
            0 => {}
            1 => {
                return Err(TetherError::protocol(
                    "compressed gRPC message received but no encoding was negotiated",
                ))
            }
            other => {
                return Err(TetherError::protocol(format!(
                    "invalid gRPC compression flag {}",
                    other
                )))
            }
        }
        let len = u32::from_be_bytes([prefix[1], prefix[2], prefix[3], prefix[4]]) as usize;
        if len > self.max_message_size {
            return Err(TetherError::protocol(format!(
                "gRPC message size {} exceeds maximum {}",
                len, self.max_message_size
            )));
        }
        if self.buf.len() < MESSAGE_PREFIX_LEN + len {
            return Ok(None);
        }
        self.buf.advance(MESSAGE_PREFIX_LEN);
        Ok(Some(self.buf.split_to(len).to_vec()))
    }

    /// Bytes of an incomplete trailing message.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_layout() {
        assert_eq!(encode_message(b"hi").unwrap(), vec![0, 0, 0, 0, 2, b'h', b'i']);
    }

    #[test]
    fn test_messages_split_across_pushes() {
        let mut wire = encode_message(b"first").unwrap();
        wire.extend(encode_message(b"").unwrap());
        wire.extend(encode_message(b"second").unwrap());

        let mut decoder = MessageDecoder::new(1024);
        let mut out = Vec::new();
        for chunk in wire.chunks(3) {
            decoder.push(chunk);
            while let Some(msg) = decoder.next_message().unwrap() {
                out.push(msg);
            }
        }
        assert_eq!(out, vec![b"first".to_vec(), Vec::new(), b"second".to_vec()]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_rejects_compressed_and_oversized() {
        let mut decoder = MessageDecoder::new(1024);
        decoder.push(&[1, 0, 0, 0, 1, 0]);
        assert!(decoder.next_message().is_err());

        let mut decoder = MessageDecoder::new(4);
        decoder.push(&[0, 0, 0, 0, 5]);
        assert!(decoder.next_message().is_err());
    }
}
