//! Decoding of producer payloads.
//!
//! Payloads are single JSON objects, one per WebSocket message. The `type`
//! field is inspected before the body is decoded so that unknown event kinds
//! can be told apart from malformed ones.

use serde_json::Value;
use thiserror::Error;

use crate::event::{InboundEvent, CC_CHANGE, CHAT_MESSAGE};

/// Default maximum payload size (64 KiB).
pub const DEFAULT_MAX_EVENT_SIZE: usize = 64 * 1024;

/// Errors raised while decoding a producer payload.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload exceeds the configured maximum.
    #[error("Payload size {size} exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },

    /// Payload is not valid JSON or does not match the event shape.
    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Payload has no string `type` field.
    #[error("Payload has no event type")]
    MissingType,

    /// Payload carries a `type` the relay does not handle.
    #[error("Unknown event type: {0}")]
    UnknownType(String),
}

/// Decode a text payload without a size limit.
///
/// # Errors
///
/// Returns an error if the payload is malformed or of an unknown type.
pub fn decode_str(text: &str) -> Result<InboundEvent, ProtocolError> {
    decode_slice(text.as_bytes())
}

/// Decode a binary payload without a size limit.
///
/// # Errors
///
/// Returns an error if the payload is malformed or of an unknown type.
pub fn decode_slice(data: &[u8]) -> Result<InboundEvent, ProtocolError> {
    let value: Value = serde_json::from_slice(data)?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?;

    if kind != CHAT_MESSAGE && kind != CC_CHANGE {
        return Err(ProtocolError::UnknownType(kind.to_string()));
    }

    Ok(serde_json::from_value(value)?)
}

/// Size-limited decoder used by the socket handlers.
#[derive(Debug, Clone, Copy)]
pub struct EventDecoder {
    max_size: usize,
}

impl EventDecoder {
    /// Create a decoder rejecting payloads larger than `max_size` bytes.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self { max_size }
    }

    /// Decode a payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is too large, malformed or of an
    /// unknown type.
    pub fn decode(&self, data: &[u8]) -> Result<InboundEvent, ProtocolError> {
        if data.len() > self.max_size {
            return Err(ProtocolError::TooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }
        decode_slice(data)
    }
}

impl Default for EventDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENT_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TopicDeclaration;

    #[test]
    fn test_decode_cc_change() {
        let event = decode_str(r#"{"type":"CC_CHANGE","cc":"The Irons","guest":true}"#).unwrap();
        assert_eq!(
            event,
            InboundEvent::TopicDeclaration(TopicDeclaration {
                cc: Some("The Irons".into()),
                guest: true,
            })
        );
    }

    #[test]
    fn test_decode_unknown_type() {
        match decode_str(r#"{"type":"LOGIN","user":"x"}"#) {
            Err(ProtocolError::UnknownType(kind)) => assert_eq!(kind, "LOGIN"),
            other => panic!("Expected UnknownType error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_missing_type() {
        assert!(matches!(
            decode_str(r#"{"content":"hi"}"#),
            Err(ProtocolError::MissingType)
        ));
        assert!(matches!(
            decode_str(r#"{"type":7}"#),
            Err(ProtocolError::MissingType)
        ));
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            decode_str("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        // Known type, missing required content.
        assert!(matches!(
            decode_str(r#"{"type":"CHAT_MESSAGE","name":"a"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_decoder_size_limit() {
        let decoder = EventDecoder::new(16);
        let payload = br#"{"type":"CC_CHANGE","cc":"a long clan chat name"}"#;

        match decoder.decode(payload) {
            Err(ProtocolError::TooLarge { size, max }) => {
                assert_eq!(size, payload.len());
                assert_eq!(max, 16);
            }
            other => panic!("Expected TooLarge error, got {:?}", other),
        }

        assert!(EventDecoder::default().decode(payload).is_ok());
    }
}
