//! Validating decode of a single frame payload
//!
//! `decode_envelope` is the only place raw bytes become a [`Frame`]. It keeps
//! "not a frame at all" apart from "a frame type this side does not know",
//! so receivers can log and answer each case without dropping the connection.

use crate::frame::Frame;
use serde_json::Value;

/// Why a payload could not be turned into a [`Frame`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("payload is not valid JSON: {0}")]
    NotJson(String),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("envelope has no string `type` field")]
    MissingType,

    #[error("unknown frame type `{0}`")]
    UnknownType(String),

    #[error("invalid `{frame_type}` frame: {reason}")]
    Invalid { frame_type: String, reason: String },
}

impl EnvelopeError {
    /// True when the payload was well formed but named an unsupported type
    pub fn is_unknown_type(&self) -> bool {
        matches!(self, EnvelopeError::UnknownType(_))
    }
}

/// Decode one frame payload (the bytes after the length prefix)
pub fn decode_envelope(payload: &[u8]) -> Result<Frame, EnvelopeError> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| EnvelopeError::NotJson(e.to_string()))?;

    let frame_type = match &value {
        Value::Object(map) => match map.get("type") {
            Some(Value::String(t)) => t.clone(),
            _ => return Err(EnvelopeError::MissingType),
        },
        _ => return Err(EnvelopeError::NotAnObject),
    };

    if !Frame::KNOWN_TYPES.contains(&frame_type.as_str()) {
        return Err(EnvelopeError::UnknownType(frame_type));
    }

    serde_json::from_value(value).map_err(|e| EnvelopeError::Invalid {
        frame_type,
        reason: e.to_string(),
    })
}
