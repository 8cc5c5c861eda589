//! Block payload checksums.
//!
//! CRC32C and xxHash3 for inline block integrity checks. The algorithm is a
//! per-inode selector; a mismatch on read is surfaced as an error and never
//! silently discarded.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Supported checksum algorithms for block integrity verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ChecksumAlgorithm {
    /// CRC32C (Castagnoli) — hardware-accelerated on modern CPUs
    #[default]
    Crc32c,
    /// xxHash3 64-bit — very fast non-cryptographic hash
    XxHash3,
    /// No checksum (integrity handled elsewhere)
    None,
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChecksumAlgorithm::Crc32c => write!(f, "CRC32C"),
            ChecksumAlgorithm::XxHash3 => write!(f, "xxHash3"),
            ChecksumAlgorithm::None => write!(f, "None"),
        }
    }
}

/// A computed checksum value with its algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    /// The algorithm used to compute this checksum.
    pub algorithm: ChecksumAlgorithm,
    /// The checksum value.
    pub value: u64,
}

impl Checksum {
    /// Creates a new checksum with the given algorithm and value.
    pub fn new(algorithm: ChecksumAlgorithm, value: u64) -> Self {
        Self { algorithm, value }
    }
}

/// Computes the checksum of `data` using the given algorithm.
pub fn compute(algorithm: ChecksumAlgorithm, data: &[u8]) -> Checksum {
    let value = match algorithm {
        ChecksumAlgorithm::Crc32c => crc32fast::hash(data) as u64,
        ChecksumAlgorithm::XxHash3 => xxhash_rust::xxh3::xxh3_64(data),
        ChecksumAlgorithm::None => 0,
    };
    Checksum { algorithm, value }
}

/// Verifies that `data` matches the expected checksum.
pub fn verify(checksum: &Checksum, data: &[u8]) -> bool {
    let computed = compute(checksum.algorithm, data);
    let matches = computed.value == checksum.value;
    if !matches {
        debug!(
            algorithm = %checksum.algorithm,
            expected = checksum.value,
            actual = computed.value,
            "checksum mismatch"
        );
    }
    matches
}
