//! Payload translation boundary.
//!
//! Mapping a generic request onto a particular remote API's JSON shape is
//! the job of a [`PayloadTranslator`] supplied by the caller. The core calls
//! it before `unary`/`server_stream` and on the bytes and events that come
//! back. [`JsonPassthrough`] sends the generic shapes unchanged.

use crate::error::{Result, TetherError};
use crate::event::Event;
use serde::{Deserialize, Serialize};

/// Provider-neutral request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
}

impl ProviderRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            session_id: None,
            max_tokens: None,
            params: serde_json::Value::Null,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Provider-neutral unary response.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub text: String,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub cost: f64,
}

/// Converts between generic shapes and one endpoint's wire payloads.
pub trait PayloadTranslator: Send + Sync {
    fn encode_request(&self, endpoint: &str, request: &ProviderRequest) -> Result<Vec<u8>>;

    fn decode_response(&self, endpoint: &str, body: &[u8]) -> Result<ProviderResponse>;

    /// Rewrite a streamed event. Identity by default.
    fn translate_event(&self, _endpoint: &str, event: Event) -> Event {
        event
    }
}

/// Sends `ProviderRequest` as JSON and reads `ProviderResponse` back.
///
/// A body that is not a JSON response object is returned as plain text.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPassthrough;

impl PayloadTranslator for JsonPassthrough {
    fn encode_request(&self, _endpoint: &str, request: &ProviderRequest) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(request)?)
    }

    fn decode_response(&self, _endpoint: &str, body: &[u8]) -> Result<ProviderResponse> {
        if let Ok(response) = serde_json::from_slice::<ProviderResponse>(body) {
            return Ok(response);
        }
        let text = std::str::from_utf8(body)
            .map_err(|_| TetherError::protocol("response body is neither JSON nor UTF-8 text"))?;
        Ok(ProviderResponse {
            text: text.to_string(),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_shape() {
        let request = ProviderRequest::new("m", "hi").with_max_tokens(16);
        let body = JsonPassthrough.encode_request("ep", &request).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value, json!({"model": "m", "prompt": "hi", "max_tokens": 16}));
    }

    #[test]
    fn test_response_decoding() {
        let json = JsonPassthrough
            .decode_response("ep", br#"{"text":"ok","tokens_out":2}"#)
            .unwrap();
        assert_eq!(json.text, "ok");
        assert_eq!(json.tokens_out, 2);

        let plain = JsonPassthrough.decode_response("ep", b"plain words").unwrap();
        assert_eq!(plain.text, "plain words");

        assert!(JsonPassthrough.decode_response("ep", &[0xff, 0xfe]).is_err());
    }
}
