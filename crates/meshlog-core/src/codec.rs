//! CBOR encoding for every wire layer.
//!
//! Each nested envelope layer is encoded on its own and embedded as a byte
//! string in its parent, so signatures always cover the exact bytes that
//! were produced by the signer. Decoding never panics: malformed input
//! becomes [`CoreError::DecodingError`].

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CoreError, Result};

/// Encode a value to CBOR bytes.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CoreError::EncodingError(e.to_string()))?;
    Ok(buf)
}

/// Decode a value from CBOR bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| CoreError::DecodingError(e.to_string()))
}
