//! Format-level record serialization.
//!
//! Records cross the backend boundary as JSON byte strings. This module is
//! the only place that names the wire format; stores and indexes go through
//! [`encode`] / [`decode`] so the format can change in one place.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error as ThisError;

///
/// CodecError
///

#[derive(Debug, ThisError)]
pub enum CodecError {
    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),
}

/// Serialize a record to its backend value form.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Deserialize a backend value produced by [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}
