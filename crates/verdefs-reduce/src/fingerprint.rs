//! Content fingerprinting: BLAKE3 digests over block payloads

use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 hash identifying a block's content. Used as the dedup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Return the hash as a lowercase hex string
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
    /// Return the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Compute the BLAKE3 hash of data
pub fn content_hash(data: &[u8]) -> ContentHash {
    let hash = blake3::hash(data);
    ContentHash(*hash.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn hash_is_deterministic() {
        let h1 = content_hash(b"hello world");
        let h2 = content_hash(b"hello world");
        assert_eq!(h1, h2);
    }

    #[test]
    fn different_data_produces_different_hashes() {
        assert_ne!(content_hash(b"hello"), content_hash(b"world"));
    }

    #[test]
    fn hex_is_64_chars() {
        let h = content_hash(b"x");
        assert_eq!(h.to_hex().len(), 64);
        assert_eq!(format!("{}", h), h.to_hex());
    }

    proptest! {
        #[test]
        fn prop_hash_deterministic(data in prop::collection::vec(0u8..=255, 0..10_000)) {
            prop_assert_eq!(content_hash(&data), content_hash(&data));
        }
    }
}
