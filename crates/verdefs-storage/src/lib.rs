#![warn(missing_docs)]

//! VerdeFS storage subsystem: block device abstraction, bitmap allocators, checksums
//!
//! This crate provides the foundational block layer for the VerdeFS engine.
//! All physical addressing is in fixed-size logical blocks chosen at format
//! time; the engine above never assumes a device sector size beyond what the
//! [`BlockDevice`] collaborator reports.

pub mod allocator;
pub mod bitmap;
pub mod block;
pub mod checksum;
pub mod device;
pub mod error;

pub use allocator::{AllocatorConfig, AllocatorState, AllocatorStats, BlockAllocator};
pub use bitmap::Bitmap;
pub use block::{BlockId, Geometry, InodeId};
pub use checksum::{compute, verify, Checksum, ChecksumAlgorithm};
pub use device::{BlockDevice, DeviceStats, MemoryBlockDevice};
pub use error::{StorageError, StorageResult};
