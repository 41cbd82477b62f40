//! Normalized event vocabulary shared by every transport.
//!
//! Text transports carry a [`Frame`] as JSON:
//!
//! ```text
//! {"sid": "<session id>", "type": "token", "text": "hel"}
//! {"sid": "<session id>", "type": "done"}
//! ```
//!
//! Binary transports whose stream is already scoped to one session carry a
//! bare [`Event`] through an [`EventCodec`].

use crate::error::{Result, TetherError};
use serde::{Deserialize, Serialize};

/// Lifecycle state reported by `Event::Status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Connecting,
    Streaming,
    Paused,
    Completed,
    Failed,
}

/// Zero-based line/column span of a text edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TextRange {
    pub start_line: u32,
    pub start_col: u32,
    pub end_line: u32,
    pub end_col: u32,
}

impl TextRange {
    pub fn new(start_line: u32, start_col: u32, end_line: u32, end_col: u32) -> Self {
        Self {
            start_line,
            start_col,
            end_line,
            end_col,
        }
    }
}

/// A single edit carried by `Event::Patch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatchOp {
    Replace { range: TextRange, text: String },
    Insert { range: TextRange, text: String },
    Delete { range: TextRange },
}

impl PatchOp {
    pub fn range(&self) -> TextRange {
        match self {
            PatchOp::Replace { range, .. }
            | PatchOp::Insert { range, .. }
            | PatchOp::Delete { range } => *range,
        }
    }
}

/// One normalized stream event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Status {
        state: StreamState,
    },
    Token {
        text: String,
    },
    Patch {
        op: PatchOp,
        rev: u64,
    },
    Usage {
        tokens_in: u64,
        tokens_out: u64,
        cost: f64,
    },
    Error {
        code: String,
        message: String,
    },
    Done,
}

impl Event {
    pub fn token(text: impl Into<String>) -> Self {
        Event::Token { text: text.into() }
    }

    pub fn status(state: StreamState) -> Self {
        Event::Status { state }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Event::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// `Done` and `Error` end a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Done | Event::Error { .. })
    }

    /// Wire name of the variant (the JSON `type` field).
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Status { .. } => "status",
            Event::Token { .. } => "token",
            Event::Patch { .. } => "patch",
            Event::Usage { .. } => "usage",
            Event::Error { .. } => "error",
            Event::Done => "done",
        }
    }

    /// Encode as a bare JSON event (no session id).
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a bare JSON event.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let event: Event = serde_json::from_slice(bytes)
            .map_err(|e| TetherError::invalid_event(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    fn validate(&self) -> Result<()> {
        if let Event::Usage { cost, .. } = self {
            if !cost.is_finite() || *cost < 0.0 {
                return Err(TetherError::invalid_event(format!(
                    "usage cost must be a non-negative number, got {}",
                    cost
                )));
            }
        }
        Ok(())
    }
}

/// Session envelope carried on JSON transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "sid")]
    pub session_id: String,
    #[serde(flatten)]
    pub event: Event,
}

impl Frame {
    pub fn new(session_id: impl Into<String>, event: Event) -> Self {
        Self {
            session_id: session_id.into(),
            event,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let frame: Frame = serde_json::from_slice(bytes)
            .map_err(|e| TetherError::invalid_event(e.to_string()))?;
        frame.event.validate()?;
        Ok(frame)
    }
}

/// Decode a text payload that is either a full [`Frame`] or a bare [`Event`].
///
/// Streaming adapters accept both shapes since some peers omit the session
/// id on connections that only ever carry one session.
pub fn decode_event_payload(bytes: &[u8]) -> Result<Event> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| TetherError::invalid_event(e.to_string()))?;
    if !value.is_object() {
        return Err(TetherError::invalid_event("event payload is not an object"));
    }
    let event: Event = serde_json::from_value(value)
        .map_err(|e| TetherError::invalid_event(e.to_string()))?;
    event.validate()?;
    Ok(event)
}

/// Binary mapping between events and message bodies on framed transports.
pub trait EventCodec: Send + Sync {
    fn encode(&self, event: &Event) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Event>;
}

/// Default codec: JSON, accepting either envelope shape on decode.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEventCodec;

impl EventCodec for JsonEventCodec {
    fn encode(&self, event: &Event) -> Result<Vec<u8>> {
        event.to_json()
    }

    fn decode(&self, bytes: &[u8]) -> Result<Event> {
        decode_event_payload(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_json_shape() {
        let frame = Frame::new("abc", Event::token("hi"));
        let value: serde_json::Value = serde_json::from_slice(&frame.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"sid": "abc", "type": "token", "text": "hi"}));

        let done = Frame::new("abc", Event::Done);
        let value: serde_json::Value = serde_json::from_slice(&done.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"sid": "abc", "type": "done"}));
    }

    #[test]
    fn test_patch_decodes() {
        let raw = json!({
            "sid": "s1",
            "type": "patch",
            "rev": 7,
            "op": {
                "kind": "replace",
                "range": {"start_line": 1, "start_col": 0, "end_line": 1, "end_col": 4},
                "text": "let"
            }
        });
        let frame = Frame::decode(raw.to_string().as_bytes()).unwrap();
        assert_eq!(frame.session_id, "s1");
        match frame.event {
            Event::Patch { op, rev } => {
                assert_eq!(rev, 7);
                assert_eq!(op.range(), TextRange::new(1, 0, 1, 4));
            }
            other => panic!("Expected patch, got {:?}", other),
        }
    }

    #[test]
    fn test_usage_accepts_integer_cost() {
        let event = Event::from_json(br#"{"type":"usage","tokens_in":3,"tokens_out":5,"cost":0}"#)
            .unwrap();
        assert_eq!(
            event,
            Event::Usage {
                tokens_in: 3,
                tokens_out: 5,
                cost: 0.0
            }
        );
    }

    #[test]
    fn test_malformed_payloads_are_invalid_events() {
        for raw in [
            &b"not json"[..],
            br#"{"type":"telepathy"}"#,
            br#"{"type":"token"}"#,
            br#"{"type":"usage","tokens_in":-1,"tokens_out":0,"cost":0.1}"#,
            br#"{"type":"usage","tokens_in":1,"tokens_out":0,"cost":-0.5}"#,
            br#"[1,2,3]"#,
        ] {
            match decode_event_payload(raw) {
                Err(TetherError::InvalidEvent { .. }) => {}
                other => panic!("Expected InvalidEvent for {:?}, got {:?}", raw, other),
            }
        }
    }

    #[test]
    fn test_frame_requires_session_id() {
        assert!(Frame::decode(br#"{"type":"done"}"#).is_err());
        // A bare event is still a valid stream payload
        assert_eq!(decode_event_payload(br#"{"type":"done"}"#).unwrap(), Event::Done);
    }

    #[test]
    fn test_terminal_events() {
        assert!(Event::Done.is_terminal());
        assert!(Event::error("x", "y").is_terminal());
        assert!(!Event::token("a").is_terminal());
        assert!(!Event::status(StreamState::Streaming).is_terminal());
    }

    #[test]
    fn test_json_codec_decodes_frames() {
        let codec = JsonEventCodec;
        let bytes = Frame::new("s", Event::token("x")).encode().unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), Event::token("x"));
    }
}
