//! Hashing utilities.

use alloy_primitives::{hex, keccak256 as alloy_keccak256, B256};
use serde::Serialize;

use crate::error::{CoreError, Result};

/// Compute keccak256 hash of input data.
pub fn keccak256(data: &[u8]) -> B256 {
    alloy_keccak256(data)
}

/// Stable marker for a serializable value.
///
/// The value is canonicalized with RFC 8785 (JCS) before hashing, so two
/// structurally equal values always produce the same marker. Used as the
/// cursor of processors whose input is a configuration snapshot.
///
/// # Example
///
/// ```
/// use spinsync_core::hashing::content_marker;
/// use serde_json::json;
///
/// let a = content_marker(&json!({"x": 1, "y": 2})).unwrap();
/// let b = content_marker(&json!({"y": 2, "x": 1})).unwrap();
/// assert_eq!(a, b);
/// ```
pub fn content_marker<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let canonical =
        serde_jcs::to_vec(value).map_err(|e| CoreError::Canonicalization(e.to_string()))?;
    Ok(format!("0x{}", hex::encode(keccak256(&canonical))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keccak256_empty() {
        let hash = keccak256(b"");
        assert_eq!(
            hex::encode(hash),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_content_marker_changes_with_content() {
        let a = content_marker(&json!([{"id": "sound"}])).unwrap();
        let b = content_marker(&json!([{"id": "zora"}])).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 66);
    }
}
