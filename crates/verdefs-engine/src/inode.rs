//! Inode attributes and lifecycle.
//!
//! An inode owns its extent tree and carries the transform selectors
//! (compression, encryption, checksum) applied to its payloads. The
//! `generation` field advances to the subvolume's current COW generation on
//! every fork touching the inode, which is what makes two instances of the
//! same inode id distinguishable for refcount accounting.

use serde::{Deserialize, Serialize};

use verdefs_reduce::{CompressionAlgorithm, EncryptionAlgorithm};
use verdefs_storage::{ChecksumAlgorithm, InodeId};

use crate::extent::ExtentTree;

/// Kind of object an inode describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    /// Regular file with data extents.
    RegularFile,
    /// Directory; entries are managed by the VFS collaborator.
    Directory,
}

/// An inode: identity, attributes, transform selectors, and the extent tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inode {
    /// Inode identity.
    pub ino: InodeId,
    /// What this inode describes.
    pub kind: FileKind,
    /// Logical file size in bytes.
    pub size: u64,
    /// Permission bits.
    pub mode: u32,
    /// Owning user.
    pub uid: u32,
    /// Owning group.
    pub gid: u32,
    /// Hard link count; the inode is destroyed when this reaches zero and no
    /// snapshot still references it.
    pub nlink: u32,
    /// Last access time (seconds since epoch).
    pub atime_secs: u64,
    /// Last modification time (seconds since epoch).
    pub mtime_secs: u64,
    /// Last attribute change time (seconds since epoch).
    pub ctime_secs: u64,
    /// Compression selector for new payloads.
    pub compression: CompressionAlgorithm,
    /// Encryption selector (applied by the external collaborator).
    pub encryption: EncryptionAlgorithm,
    /// Checksum algorithm for payload verification.
    pub checksum: ChecksumAlgorithm,
    /// COW generation of the last fork that touched this inode.
    pub generation: u64,
    /// Logical offset to block reference mapping.
    pub extents: ExtentTree,
}

impl Inode {
    /// Creates a regular file inode with empty extents and `nlink == 1`.
    #[allow(clippy::too_many_arguments)]
    pub fn new_file(
        ino: InodeId,
        mode: u32,
        uid: u32,
        gid: u32,
        compression: CompressionAlgorithm,
        checksum: ChecksumAlgorithm,
        generation: u64,
        now_secs: u64,
    ) -> Self {
        Self {
            ino,
            kind: FileKind::RegularFile,
            size: 0,
            mode,
            uid,
            gid,
            nlink: 1,
            atime_secs: now_secs,
            mtime_secs: now_secs,
            ctime_secs: now_secs,
            compression,
            encryption: EncryptionAlgorithm::None,
            checksum,
            generation,
            extents: ExtentTree::new(),
        }
    }

    /// Records a data modification at `now_secs`.
    pub fn touch_modified(&mut self, now_secs: u64) {
        self.mtime_secs = now_secs;
        self.ctime_secs = now_secs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_inode() -> Inode {
        Inode::new_file(
            InodeId::new(2),
            0o644,
            1000,
            1000,
            CompressionAlgorithm::None,
            ChecksumAlgorithm::Crc32c,
            1,
            1_700_000_000,
        )
    }

    #[test]
    fn test_new_file_defaults() {
        let inode = make_inode();
        assert_eq!(inode.kind, FileKind::RegularFile);
        assert_eq!(inode.size, 0);
        assert_eq!(inode.nlink, 1);
        assert_eq!(inode.generation, 1);
        assert!(inode.extents.is_empty());
    }

    #[test]
    fn test_touch_modified() {
        let mut inode = make_inode();
        inode.touch_modified(1_700_000_123);
        assert_eq!(inode.mtime_secs, 1_700_000_123);
        assert_eq!(inode.ctime_secs, 1_700_000_123);
        assert_eq!(inode.atime_secs, 1_700_000_000);
    }
}
