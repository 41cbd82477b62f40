//! HTTP/2 frame layer.
//!
//! ```text
//! +-----------------------------------------------+
//! |                 Length (24)                   |
//! +---------------+---------------+---------------+
//! |   Type (8)    |   Flags (8)   |
//! +-+-------------+---------------+-------------------------------+
//! |R|                 Stream Identifier (31)                      |
//! +=+=============================================================+
//! |                   Frame Payload (0...)                      ...
//! +---------------------------------------------------------------+
//! ```
//!
//! Only framing lives here. Connection state (stream ids, settings, flow
//! control credit) is owned by the gRPC adapter.

use crate::error::{Result, TetherError};
use bytes::Bytes;

pub const FRAME_HEADER_LEN: usize = 9;
const MAX_LENGTH: usize = (1 << 24) - 1;
const STREAM_ID_MASK: u32 = 0x7fff_ffff;

/// Frame flag bits.
pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// Error codes carried by RST_STREAM and GOAWAY.
pub mod error_code {
    pub const NO_ERROR: u32 = 0x0;
    pub const PROTOCOL_ERROR: u32 = 0x1;
    pub const INTERNAL_ERROR: u32 = 0x2;
    pub const CANCEL: u32 = 0x8;
}

/// SETTINGS parameter identifiers.
pub mod settings {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    Goaway,
    WindowUpdate,
    Continuation,
    /// Extension frame types are ignored by receivers.
    Unknown(u8),
}

impl FrameType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x0 => FrameType::Data,
            0x1 => FrameType::Headers,
            0x2 => FrameType::Priority,
            0x3 => FrameType::RstStream,
            0x4 => FrameType::Settings,
            0x5 => FrameType::PushPromise,
            0x6 => FrameType::Ping,
            0x7 => FrameType::Goaway,
            0x8 => FrameType::WindowUpdate,
            0x9 => FrameType::Continuation,
            other => FrameType::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            FrameType::Data => 0x0,
            FrameType::Headers => 0x1,
            FrameType::Priority => 0x2,
            FrameType::RstStream => 0x3,
            FrameType::Settings => 0x4,
            FrameType::PushPromise => 0x5,
            FrameType::Ping => 0x6,
            FrameType::Goaway => 0x7,
            FrameType::WindowUpdate => 0x8,
            FrameType::Continuation => 0x9,
            FrameType::Unknown(other) => *other,
        }
    }
}

/// One HTTP/2 frame. The wire length is always `payload.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Http2Frame {
    pub frame_type: FrameType,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Http2Frame {
    pub fn new(
        frame_type: FrameType,
        flags: u8,
        stream_id: u32,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            frame_type,
            flags,
            stream_id: stream_id & STREAM_ID_MASK,
            payload: payload.into(),
        }
    }

    pub fn length(&self) -> usize {
        self.payload.len()
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag == flag
    }

    pub fn is_end_stream(&self) -> bool {
        matches!(self.frame_type, FrameType::Data | FrameType::Headers)
            && self.has_flag(flags::END_STREAM)
    }

    // Constructors for the frames a client sends

    pub fn settings(params: &[(u16, u32)]) -> Self {
        let mut payload = Vec::with_capacity(params.len() * 6);
        for (id, value) in params {
            payload.extend_from_slice(&id.to_be_bytes());
            payload.extend_from_slice(&value.to_be_bytes());
        }
        Self::new(FrameType::Settings, 0, 0, payload)
    }

    pub fn settings_ack() -> Self {
        Self::new(FrameType::Settings, flags::ACK, 0, Bytes::new())
    }

    pub fn ping_ack(opaque: Bytes) -> Self {
        Self::new(FrameType::Ping, flags::ACK, 0, opaque)
    }

    pub fn headers(stream_id: u32, block: Vec<u8>, end_stream: bool) -> Self {
        let mut f = flags::END_HEADERS;
        if end_stream {
            f |= flags::END_STREAM;
        }
        Self::new(FrameType::Headers, f, stream_id, block)
    }

    pub fn data(stream_id: u32, payload: impl Into<Bytes>, end_stream: bool) -> Self {
        let f = if end_stream { flags::END_STREAM } else { 0 };
        Self::new(FrameType::Data, f, stream_id, payload)
    }

    pub fn rst_stream(stream_id: u32, code: u32) -> Self {
        Self::new(FrameType::RstStream, 0, stream_id, code.to_be_bytes().to_vec())
    }

    pub fn goaway(last_stream_id: u32, code: u32) -> Self {
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&(last_stream_id & STREAM_ID_MASK).to_be_bytes());
        payload.extend_from_slice(&code.to_be_bytes());
        Self::new(FrameType::Goaway, 0, 0, payload)
    }

    pub fn window_update(stream_id: u32, increment: u32) -> Self {
        Self::new(
            FrameType::WindowUpdate,
            0,
            stream_id,
            (increment & STREAM_ID_MASK).to_be_bytes().to_vec(),
        )
    }

    /// Serialize header and payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let len = self.payload.len();
        if len > MAX_LENGTH {
            return Err(TetherError::protocol(format!(
                "frame payload of {} bytes exceeds the 24-bit length field",
                len
            )));
        }
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + len);
        out.extend_from_slice(&(len as u32).to_be_bytes()[1..]);
        out.push(self.frame_type.as_u8());
        out.push(self.flags);
        out.extend_from_slice(&(self.stream_id & STREAM_ID_MASK).to_be_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Parse one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` if `buf` does not yet hold a full frame. A length
    /// above `max_frame_size` is fatal: the frame boundary cannot be trusted.
    pub fn decode(buf: &[u8], max_frame_size: usize) -> Result<Option<(Self, usize)>> {
        let Some(header) = buf.get(..FRAME_HEADER_LEN) else {
            return Ok(None);
        };
        let len = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
        if len > max_frame_size {
            return Err(TetherError::protocol(format!(
                "frame length {} exceeds max frame size {}",
                len, max_frame_size
            )));
        }
        let frame_type = FrameType::from_u8(header[3]);
        let flags = header[4];
        let stream_id =
            u32::from_be_bytes([header[5], header[6], header[7], header[8]]) & STREAM_ID_MASK;

        let Some(payload) = buf.get(FRAME_HEADER_LEN..FRAME_HEADER_LEN + len) else {
            return Ok(None);
        };
        let frame = Http2Frame {
            frame_type,
            flags,
            stream_id,
            payload: Bytes::copy_from_slice(payload),
        };
        Ok(Some((frame, FRAME_HEADER_LEN + len)))
    }

    /// Payload of a DATA or HEADERS frame with padding and priority removed.
    pub fn body(&self) -> Result<Bytes> {
        let mut start = 0;
        let mut end = self.payload.len();
        if self.has_flag(flags::PADDED) {
            let pad = *self
                .payload
                .first()
                .ok_or_else(|| TetherError::protocol("PADDED frame without pad length"))?
                as usize;
            start = 1;
            end = end
                .checked_sub(pad)
                .filter(|e| *e >= start)
                .ok_or_else(|| TetherError::protocol("padding exceeds frame payload"))?;
        }
        if self.frame_type == FrameType::Headers && self.has_flag(flags::PRIORITY) {
            start += 5;
            if start > end {
                return Err(TetherError::protocol("HEADERS priority block truncated"));
            }
        }
        Ok(self.payload.slice(start..end))
    }
}

/// Parse a SETTINGS payload into (identifier, value) pairs.
pub fn parse_settings(payload: &[u8]) -> Result<Vec<(u16, u32)>> {
    if payload.len() % 6 != 0 {
        return Err(TetherError::protocol(format!(
            "SETTINGS payload length {} is not a multiple of 6",
            payload.len()
        )));
    }
    Ok(payload
        .chunks_exact(6)
        .map(|c| {
            (
                u16::from_be_bytes([c[0], c[1]]),
                u32::from_be_bytes([c[2], c[3], c[4], c[5]]),
            )
        })
        .collect())
}

/// Error code of an RST_STREAM payload.
pub fn parse_rst_stream(payload: &[u8]) -> Result<u32> {
    match payload {
        [a, b, c, d] => Ok(u32::from_be_bytes([*a, *b, *c, *d])),
        _ => Err(TetherError::protocol("RST_STREAM payload must be 4 bytes")),
    }
}

/// (last stream id, error code) of a GOAWAY payload.
pub fn parse_goaway(payload: &[u8]) -> Result<(u32, u32)> {
    if payload.len() < 8 {
        return Err(TetherError::protocol("GOAWAY payload shorter than 8 bytes"));
    }
    let last =
        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & STREAM_ID_MASK;
    let code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    Ok((last, code))
}

/// Window size increment of a WINDOW_UPDATE payload.
pub fn parse_window_update(payload: &[u8]) -> Result<u32> {
    match payload {
        [a, b, c, d] => Ok(u32::from_be_bytes([*a, *b, *c, *d]) & STREAM_ID_MASK),
        _ => Err(TetherError::protocol("WINDOW_UPDATE payload must be 4 bytes")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;

    const MAX: usize = TransportConfig::HTTP2_DEFAULT_MAX_FRAME_SIZE;

    #[test]
    fn test_header_layout_is_bit_exact() {
        let frame = Http2Frame::data(3, b"abc".to_vec(), true);
        let bytes = frame.encode().unwrap();
        assert_eq!(
            &bytes[..FRAME_HEADER_LEN],
            &[0, 0, 3, 0x0, flags::END_STREAM, 0, 0, 0, 3]
        );
        assert_eq!(&bytes[FRAME_HEADER_LEN..], b"abc");
    }

    #[test]
    fn test_roundtrip_all_frame_types() {
        let frames = [
            Http2Frame::data(1, b"payload".to_vec(), false),
            Http2Frame::headers(5, vec![0x82, 0x86], true),
            Http2Frame::new(FrameType::Priority, 0, 7, vec![0, 0, 0, 0, 16]),
            Http2Frame::rst_stream(9, error_code::CANCEL),
            Http2Frame::settings(&[(settings::ENABLE_PUSH, 0)]),
            Http2Frame::new(FrameType::PushPromise, flags::END_HEADERS, 1, vec![0, 0, 0, 2]),
            Http2Frame::ping_ack(Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8])),
            Http2Frame::goaway(11, error_code::NO_ERROR),
            Http2Frame::window_update(0, 65_535),
            Http2Frame::new(FrameType::Continuation, flags::END_HEADERS, 3, vec![0x88]),
        ];
        for frame in frames {
            let bytes = frame.encode().unwrap();
            let (decoded, used) = Http2Frame::decode(&bytes, MAX).unwrap().unwrap();
            assert_eq!(decoded, frame);
            assert_eq!(used, bytes.len());
            assert_eq!(decoded.length(), frame.payload.len());
        }
    }

    #[test]
    fn test_reserved_bit_is_masked() {
        let mut bytes = Http2Frame::data(1, Bytes::new(), false).encode().unwrap();
        bytes[5] |= 0x80;
        let (frame, _) = Http2Frame::decode(&bytes, MAX).unwrap().unwrap();
        assert_eq!(frame.stream_id, 1);
    }

    #[test]
    fn test_incomplete_frames_need_more_bytes() {
        let bytes = Http2Frame::data(1, vec![7u8; 20], false).encode().unwrap();
        assert!(Http2Frame::decode(&bytes[..5], MAX).unwrap().is_none());
        assert!(Http2Frame::decode(&bytes[..15], MAX).unwrap().is_none());
    }

    #[test]
    fn test_oversized_length_is_fatal() {
        let bytes = Http2Frame::data(1, vec![0u8; 32], false).encode().unwrap();
        assert!(matches!(
            Http2Frame::decode(&bytes, 16),
            Err(TetherError::Protocol { .. })
        ));
    }

    #[test]
    fn test_unknown_type_survives_decode() {
        let bytes = Http2Frame::new(FrameType::Unknown(0xfa), 0, 0, vec![1]).encode().unwrap();
        let (frame, _) = Http2Frame::decode(&bytes, MAX).unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::Unknown(0xfa));
    }

    #[test]
    fn test_padding_and_priority_are_stripped() {
        // pad length 2, priority block (5 bytes), block 0x82, padding
        let payload = vec![2, 0, 0, 0, 0, 16, 0x82, 0, 0];
        let frame = Http2Frame::new(
            FrameType::Headers,
            flags::PADDED | flags::PRIORITY | flags::END_HEADERS,
            1,
            payload,
        );
        assert_eq!(&frame.body().unwrap()[..], &[0x82]);

        let bad = Http2Frame::new(FrameType::Data, flags::PADDED, 1, vec![9, 1, 2]);
        assert!(bad.body().is_err());
    }

    #[test]
    fn test_payload_parsers() {
        let settings = parse_settings(&Http2Frame::settings(&[(4, 1 << 20), (5, 32_768)]).payload)
            .unwrap();
        assert_eq!(settings, vec![(4, 1 << 20), (5, 32_768)]);
        assert!(parse_settings(&[0, 1, 2]).is_err());

        assert_eq!(parse_rst_stream(&Http2Frame::rst_stream(1, 8).payload).unwrap(), 8);
        assert_eq!(parse_goaway(&Http2Frame::goaway(7, 2).payload).unwrap(), (7, 2));
        assert_eq!(
            parse_window_update(&Http2Frame::window_update(1, 99).payload).unwrap(),
            99
        );
    }
}
