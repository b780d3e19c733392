//! Canonical JSON encoding of signed payloads.
//!
//! RFC 8785 (JCS): object members sorted by key, no insignificant
//! whitespace, minimal string escapes. The server canonicalizes
//! independently; signatures only verify if both sides produce the same
//! bytes. TUF metadata carries integers only, so floats are refused.

use crate::error::TufError;
use serde::Serialize;
use serde_json::Value;

/// Canonical bytes of any serializable value.
pub fn to_canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, TufError> {
    let value = serde_json::to_value(value)?;
    canonical_value_bytes(&value)
}

/// Canonical bytes of an already parsed JSON value.
pub fn canonical_value_bytes(value: &Value) -> Result<Vec<u8>, TufError> {
    reject_floats(value)?;
    serde_jcs::to_vec(value)
        .map_err(|e| TufError::ParseError(format!("Failed to canonicalize JSON: {}", e)))
}

fn reject_floats(value: &Value) -> Result<(), TufError> {
    match value {
        Value::Number(n) if n.is_f64() => Err(TufError::ParseError(format!(
            "Floating point number {} cannot be canonicalized",
            n
        ))),
        Value::Array(arr) => arr.iter().try_for_each(reject_floats),
        Value::Object(map) => map.values().try_for_each(reject_floats),
        _ => Ok(()),
    }
}
