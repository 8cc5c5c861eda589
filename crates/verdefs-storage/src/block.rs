//! Core identifiers and device geometry for the storage layer.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a physical block on the device.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct BlockId(u64);

impl BlockId {
    /// Creates a new BlockId from a raw u64 value.
    pub fn new(id: u64) -> Self {
        BlockId(id)
    }

    /// Returns the raw u64 value of this block ID.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.0)
    }
}

/// Unique identifier for an inode.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct InodeId(u64);

impl InodeId {
    /// The root inode ID (always 1). Slot 0 is reserved and never allocated.
    pub const ROOT: InodeId = InodeId(1);

    /// Creates a new InodeId from a raw u64 value.
    pub fn new(id: u64) -> Self {
        InodeId(id)
    }

    /// Returns the raw u64 value of this inode ID.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Format-time constants for a filesystem instance.
///
/// The block size is filesystem-wide and fixed; every structure above this
/// layer addresses the device in whole blocks of this size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Logical block size in bytes.
    pub block_size: u32,
    /// Total number of blocks on the device.
    pub total_blocks: u64,
    /// Total number of inode slots.
    pub total_inodes: u64,
}

impl Geometry {
    /// Creates a new geometry description.
    pub fn new(block_size: u32, total_blocks: u64, total_inodes: u64) -> Self {
        Self {
            block_size,
            total_blocks,
            total_inodes,
        }
    }

    /// Total addressable capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.total_blocks * self.block_size as u64
    }

    /// Index of the logical block containing the given byte offset.
    pub fn block_of(&self, byte_offset: u64) -> u64 {
        byte_offset / self.block_size as u64
    }

    /// Offset of the given byte within its logical block.
    pub fn offset_in_block(&self, byte_offset: u64) -> u32 {
        (byte_offset % self.block_size as u64) as u32
    }

    /// Byte offset where the given logical block starts.
    pub fn block_start(&self, block_index: u64) -> u64 {
        block_index * self.block_size as u64
    }

    /// Number of logical blocks spanned by `[offset, offset + len)`.
    /// Zero-length ranges span no blocks.
    pub fn blocks_spanned(&self, offset: u64, len: u64) -> u64 {
        if len == 0 {
            return 0;
        }
        let first = self.block_of(offset);
        let last = self.block_of(offset + len - 1);
        last - first + 1
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            block_size: 4096,
            total_blocks: 16384,
            total_inodes: 4096,
        }
    }
}
