//! Content fingerprints for cache keys.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// SHA-256 of `value`'s JSON form, salted with `salt`, as lowercase hex.
///
/// The cache salts with its version so a snapshot written by another build
/// is never addressed by the same key.
pub fn fingerprint<T: Serialize>(salt: &str, value: &T) -> Result<String, serde_json::Error> {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update([0u8]);
    serde_json::to_writer(&mut hasher, value)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// SHA-256 of a stored payload, as lowercase hex.
pub fn checksum(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let value = json!({"concepts": ["local.order_id"]});
        let first = fingerprint("1", &value).unwrap();
        assert_eq!(first, fingerprint("1", &value).unwrap());
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_salt_and_content_both_change_the_key() {
        let value = json!({"a": 1});
        let base = fingerprint("1", &value).unwrap();
        assert_ne!(base, fingerprint("2", &value).unwrap());
        assert_ne!(base, fingerprint("1", &json!({"a": 2})).unwrap());
    }

    #[test]
    fn test_checksum_detects_edits() {
        assert_eq!(checksum("{}"), checksum("{}"));
        assert_ne!(checksum("{\"a\":1}"), checksum("{\"a\":2}"));
    }
}
