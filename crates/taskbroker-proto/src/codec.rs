//! JSON text codec for protocol frames.
//!
//! Each frame carries exactly one message object. Encoding is shared by all
//! message families; decoding is generic over the family expected on a
//! given connection, so a frame from the wrong family fails to decode.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Errors that can occur while encoding or decoding a frame.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame is not a text frame.
    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),
}

/// Encode a message as a JSON text frame.
pub fn encode<T: Serialize>(message: &T) -> Result<String, ProtoError> {
    Ok(serde_json::to_string(message)?)
}

/// Decode a JSON text frame into a message of family `T`.
pub fn decode<T: DeserializeOwned>(frame: &str) -> Result<T, ProtoError> {
    Ok(serde_json::from_str(frame)?)
}

/// Decode a binary frame holding UTF-8 JSON.
pub fn decode_bytes<T: DeserializeOwned>(frame: &[u8]) -> Result<T, ProtoError> {
    Ok(serde_json::from_slice(frame)?)
}
