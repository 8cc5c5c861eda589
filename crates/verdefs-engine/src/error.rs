//! Error types for the COW engine.

use thiserror::Error;

use verdefs_storage::{InodeId, StorageError};

use crate::snapshot::SnapshotId;
use crate::subvolume::SubvolumeId;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Error variants for engine operations.
///
/// Operations either fully apply or fully roll back; no variant here is ever
/// converted into silent data loss.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Propagated storage-layer error (allocator, device, checksum).
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Propagated reduction-layer error (compression codec).
    #[error(transparent)]
    Reduce(#[from] verdefs_reduce::ReduceError),

    /// A subvolume quota would be exceeded; nothing was applied.
    #[error("Quota exceeded on subvolume {subvolume}: {resource}")]
    QuotaExceeded {
        /// The subvolume whose quota blocked the operation.
        subvolume: SubvolumeId,
        /// Which resource ran out ("bytes" or "inodes").
        resource: &'static str,
    },

    /// The requested subvolume does not exist.
    #[error("Subvolume not found: {0}")]
    SubvolumeNotFound(SubvolumeId),

    /// The requested snapshot does not exist.
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(SnapshotId),

    /// The requested inode does not exist in the addressed view.
    #[error("Inode not found: {0}")]
    InodeNotFound(InodeId),

    /// The inode exists but is not a regular file.
    #[error("Inode {0} is not a regular file")]
    NotAFile(InodeId),

    /// A checkpoint image failed validation.
    #[error("Checkpoint corrupted: {reason}")]
    CheckpointCorrupted {
        /// Description of the corruption.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_display() {
        let err = EngineError::QuotaExceeded {
            subvolume: SubvolumeId::new(3),
            resource: "bytes",
        };
        let msg = format!("{}", err);
        assert!(msg.contains("3"));
        assert!(msg.contains("bytes"));
    }

    #[test]
    fn test_storage_error_passthrough() {
        let err: EngineError = StorageError::OutOfSpace.into();
        assert_eq!(format!("{}", err), "Out of space: no free blocks available");
    }
}
