//! Encryption algorithm selector.
//!
//! Ciphering itself is an external collaborator applied to block payloads
//! outside this engine; only the per-inode selector is carried here so the
//! metadata round-trips.

use serde::{Deserialize, Serialize};

/// Encryption selector stored per inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EncryptionAlgorithm {
    /// Payloads are stored as-is.
    #[default]
    None,
    /// Payloads pass through the external encryption collaborator.
    External,
}
