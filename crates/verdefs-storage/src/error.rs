//! Error types for the storage layer.

use thiserror::Error;

use crate::block::BlockId;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error variants for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No free blocks available in the allocator.
    #[error("Out of space: no free blocks available")]
    OutOfSpace,

    /// No free inode slots available in the allocator.
    #[error("Out of inodes: no free inode slots available")]
    OutOfInodes,

    /// Refcount/bitmap bookkeeping mismatch. Fatal to the operation;
    /// surfaced for scrub/repair tooling, never auto-repaired.
    #[error("Invariant violation: {reason}")]
    InvariantViolation {
        /// Description of the violated invariant.
        reason: String,
    },

    /// Data corruption detected: checksum mismatch on read.
    #[error("Checksum mismatch on block {block_id}: expected {expected:#x}, actual {actual:#x}")]
    ChecksumMismatch {
        /// The block with the mismatch.
        block_id: BlockId,
        /// The expected checksum value.
        expected: u64,
        /// The actual checksum value.
        actual: u64,
    },

    /// The requested block lies outside the device geometry.
    #[error("Block not found: {block_id}")]
    BlockNotFound {
        /// The block ID that was not found.
        block_id: BlockId,
    },

    /// A write payload did not match the device block size.
    #[error("Block size mismatch: expected {expected} bytes, got {actual}")]
    BlockSizeMismatch {
        /// The device block size in bytes.
        expected: u32,
        /// The payload length supplied.
        actual: usize,
    },

    /// Device-level fault reported by the block collaborator.
    #[error("Device fault: {reason}")]
    DeviceFault {
        /// Description of the fault.
        reason: String,
    },
}

impl StorageError {
    /// Builds an `InvariantViolation` from anything displayable.
    pub fn invariant(reason: impl Into<String>) -> Self {
        StorageError::InvariantViolation {
            reason: reason.into(),
        }
    }

    /// Returns true for faults worth a single retry (transient device I/O).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Io(_) | StorageError::DeviceFault { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_space_display() {
        let err = StorageError::OutOfSpace;
        assert_eq!(format!("{}", err), "Out of space: no free blocks available");
    }

    #[test]
    fn test_invariant_violation_display() {
        let err = StorageError::invariant("double free of block 7");
        assert!(format!("{}", err).contains("double free of block 7"));
    }

    #[test]
    fn test_checksum_mismatch_display() {
        let err = StorageError::ChecksumMismatch {
            block_id: BlockId::new(42),
            expected: 0xDEAD,
            actual: 0xBEEF,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("0xdead"));
        assert!(msg.contains("0xbeef"));
    }

    #[test]
    fn test_io_error_from_std() {
        let std_err = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err: StorageError = std_err.into();
        assert!(err.is_transient());
    }

    #[test]
    fn test_transient_classification() {
        assert!(StorageError::DeviceFault {
            reason: "bus reset".into()
        }
        .is_transient());
        assert!(!StorageError::OutOfSpace.is_transient());
        assert!(!StorageError::invariant("x").is_transient());
    }
}
