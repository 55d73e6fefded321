//! Shared SHA-256 hex digest utility.
//!
//! Used by [`crate::naming`] to derive the short package identifier suffix
//! from a brand id.

use sha2::{Digest, Sha256};

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_produces_known_hash() {
        let hash = sha256_hex(b"");
        assert_eq!(
            hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn brand_ids_hash_differently() {
        assert_ne!(sha256_hex(b"brand-a"), sha256_hex(b"brand-b"));
        assert_eq!(sha256_hex(b"brand-a").len(), 64);
    }
}
