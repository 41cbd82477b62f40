//! WebSocket (RFC 6455) frame codec.
//!
//! ```text
//! byte 0: FIN(0x80) | RSV1-3 | opcode (low 4 bits)
//! byte 1: MASK(0x80) | payload len (7 bits)
//!         126 -> next 2 bytes BE u16, 127 -> next 8 bytes BE u64
//! [4-byte mask key if MASK]
//! payload
//! ```

use crate::error::{Result, TetherError};

const FIN_BIT: u8 = 0x80;
const RSV_BITS: u8 = 0x70;
const MASK_BIT: u8 = 0x80;
const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(TetherError::protocol(format!(
                "reserved WebSocket opcode {:#x}",
                other
            ))),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// XOR `buf` with the 4-byte mask key. Applying it twice restores the input.
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// One WebSocket frame. `payload` is always the unmasked application data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsFrame {
    pub fin: bool,
    pub opcode: Opcode,
    /// Mask key used on the wire, if the frame is masked.
    pub mask: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl WsFrame {
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Opcode::Text, text.into().into_bytes())
    }

    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Binary, data)
    }

    /// Close frame with a status code and optional reason.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = code.to_be_bytes().to_vec();
        // Control payloads are capped at 125 bytes
        let reason = &reason.as_bytes()[..reason.len().min(MAX_CONTROL_PAYLOAD - 2)];
        payload.extend_from_slice(reason);
        Self::new(Opcode::Close, payload)
    }

    pub fn pong(payload: Vec<u8>) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    pub fn with_mask(mut self, key: [u8; 4]) -> Self {
        self.mask = Some(key);
        self
    }

    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// (status code, reason) of a Close frame payload.
    pub fn close_reason(&self) -> Option<(u16, String)> {
        if self.opcode != Opcode::Close || self.payload.len() < 2 {
            return None;
        }
        let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        let reason = String::from_utf8_lossy(&self.payload[2..]).into_owned();
        Some((code, reason))
    }

    pub fn encode(&self) -> Vec<u8> {
        let len = self.payload.len();
        let mut out = Vec::with_capacity(len + 14);
        let fin = if self.fin { FIN_BIT } else { 0 };
        out.push(fin | self.opcode.as_u8());

        let mask_bit = if self.mask.is_some() { MASK_BIT } else { 0 };
        if len < 126 {
            out.push(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }

        match self.mask {
            Some(key) => {
                out.extend_from_slice(&key);
                let start = out.len();
                out.extend_from_slice(&self.payload);
                apply_mask(&mut out[start..], key);
            }
            None => out.extend_from_slice(&self.payload),
        }
        out
    }

    /// Parse one frame from the front of `buf`, unmasking the payload.
    ///
    /// Returns `Ok(None)` until a full frame is buffered. Lengths above
    /// `max_payload`, reserved bits, and malformed control frames are fatal.
    pub fn decode(buf: &[u8], max_payload: usize) -> Result<Option<(Self, usize)>> {
        let (b0, b1) = match buf {
            [b0, b1, ..] => (*b0, *b1),
            _ => return Ok(None),
        };
        if b0 & RSV_BITS != 0 {
            return Err(TetherError::protocol("WebSocket RSV bits set without extension"));
        }
        let fin = b0 & FIN_BIT != 0;
        let opcode = Opcode::from_u8(b0 & 0x0f)?;
        let masked = b1 & MASK_BIT != 0;

        let mut pos = 2;
        let len = match b1 & 0x7f {
            126 => {
                let Some(ext) = buf.get(pos..pos + 2) else {
                    return Ok(None);
                };
                pos += 2;
                u16::from_be_bytes([ext[0], ext[1]]) as u64
            }
            127 => {
                let Some(ext) = buf.get(pos..pos + 8) else {
                    return Ok(None);
                };
                pos += 8;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(ext);
                let len = u64::from_be_bytes(raw);
                if len & (1 << 63) != 0 {
                    return Err(TetherError::protocol("WebSocket 64-bit length has high bit set"));
                }
                len
            }
            short => short as u64,
        };
        if len > max_payload as u64 {
            return Err(TetherError::protocol(format!(
                "WebSocket payload length {} exceeds maximum {}",
                len, max_payload
            )));
        }
        let len = len as usize;

        if opcode.is_control() && (len > MAX_CONTROL_PAYLOAD || !fin) {
            return Err(TetherError::protocol("fragmented or oversized control frame"));
        }

        let mask = if masked {
            let Some(key) = buf.get(pos..pos + 4) else {
                return Ok(None);
            };
            pos += 4;
            Some([key[0], key[1], key[2], key[3]])
        } else {
            None
        };

        let Some(body) = buf.get(pos..pos + len) else {
            return Ok(None);
        };
        let mut payload = body.to_vec();
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }
        Ok(Some((
            WsFrame {
                fin,
                opcode,
                mask,
                payload,
            },
            pos + len,
        )))
    }
}
