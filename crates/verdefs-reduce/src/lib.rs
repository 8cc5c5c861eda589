#![warn(missing_docs)]

//! VerdeFS reduction subsystem: content fingerprinting (BLAKE3), dedup index, compression (LZ4/Zstd)
//!
//! Write path: Payload → Fingerprint (BLAKE3) → Dedup lookup → Compress → Store
//! Read path:  Store → Decompress → Payload
//!
//! The dedup index is a pure content-hash → block mapping; reference counts
//! live with the engine's block-reference ledger so the two can never drift.

pub mod compression;
pub mod dedupe;
pub mod encryption;
pub mod error;
pub mod fingerprint;

pub use compression::{compress, decompress, is_compressible, CompressionAlgorithm};
pub use dedupe::{DedupConfig, DedupEntry, DedupIndex, DedupState, DedupStats};
pub use encryption::EncryptionAlgorithm;
pub use error::ReduceError;
pub use fingerprint::{content_hash, ContentHash};
