use serde_json::Value;

use crate::error::{Error, Result};

/// Payload codec. One codec is configured per client; a subscription may
/// override it with its own `decoder`.
pub trait Codec: Send + Sync {
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;

    /// Decode failures must carry the offending raw bytes so the error
    /// handler can inspect or dead-letter them.
    fn decode(&self, raw: &[u8]) -> Result<Value>;

    /// Content type stamped on published messages.
    fn content_type(&self) -> &str {
        "application/octet-stream"
    }
}

/// The default codec: JSON via serde_json.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::Encode(e.to_string()))
    }

    fn decode(&self, raw: &[u8]) -> Result<Value> {
        serde_json::from_slice(raw).map_err(|e| Error::Decode {
            reason: e.to_string(),
            raw: raw.to_vec(),
        })
    }

    fn content_type(&self) -> &str {
        "application/json"
    }
}

/// What `publish` accepts: either a structured value run through the codec,
/// or raw bytes/strings passed through untouched so pre-encoded payloads are
/// never encoded twice.
#[derive(Debug, Clone)]
pub enum Payload {
    Value(Value),
    Raw(Vec<u8>),
}

impl Payload {
    pub fn into_bytes(self, codec: &dyn Codec) -> Result<Vec<u8>> {
        match self {
            Payload::Value(value) => codec.encode(&value),
            Payload::Raw(bytes) => Ok(bytes),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Value(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Raw(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Raw(bytes.to_vec())
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Raw(s.as_bytes().to_vec())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Raw(s.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn round_trips_representative_values() {
        let codec = JsonCodec;
        for value in [
            json!({"email": "a@a.com", "nested": {"count": 3}}),
            json!(["a", "b", 1, 2]),
            json!("plain string"),
            json!(42),
        ] {
            let encoded = codec.encode(&value).unwrap();
            assert_eq!(codec.decode(&encoded).unwrap(), value);
        }
    }

    #[test]
    fn decode_error_preserves_raw_bytes() {
        let raw = b"definitely not json";
        let err = JsonCodec.decode(raw).unwrap_err();
        assert_eq!(err.raw_bytes(), Some(&raw[..]));
    }

    #[test]
    fn raw_payload_skips_the_codec() {
        let payload: Payload = "{\"already\":\"encoded\"}".into();
        let bytes = payload.into_bytes(&JsonCodec).unwrap();
        assert_eq!(bytes, b"{\"already\":\"encoded\"}");
    }
}
