//! Block device collaborator abstraction.
//!
//! The [`BlockDevice`] trait is the engine's only blocking seam: reads and
//! writes may be slow, but they are bounded by the collaborator's own timeout
//! policy, never by this engine. [`MemoryBlockDevice`] is the in-memory
//! implementation used by tests, with fault injection for failure-path
//! coverage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::block::{BlockId, Geometry};
use crate::error::{StorageError, StorageResult};

/// Device-level I/O statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceStats {
    /// Total read operations completed.
    pub reads: u64,
    /// Total write operations completed.
    pub writes: u64,
    /// Total flush operations completed.
    pub flushes: u64,
    /// Total bytes read.
    pub bytes_read: u64,
    /// Total bytes written.
    pub bytes_written: u64,
    /// Total errors returned (including injected faults).
    pub errors: u64,
}

/// Trait for the physical block collaborator.
///
/// All addressing is in fixed-size logical blocks per the device geometry.
/// Implementations must be safe to share across threads.
pub trait BlockDevice: Send + Sync {
    /// Returns the device geometry (block size, block count, inode slots).
    fn geometry(&self) -> Geometry;

    /// Reads one block. Blocks never written read back as all zeroes.
    fn read_block(&self, id: BlockId) -> StorageResult<Vec<u8>>;

    /// Writes one block. The payload length must equal the block size.
    fn write_block(&self, id: BlockId, data: &[u8]) -> StorageResult<()>;

    /// Flushes all pending writes to persistent storage.
    fn flush(&self) -> StorageResult<()>;

    /// Returns current I/O statistics.
    fn stats(&self) -> DeviceStats;
}

impl<T: BlockDevice + ?Sized> BlockDevice for std::sync::Arc<T> {
    fn geometry(&self) -> Geometry {
        (**self).geometry()
    }

    fn read_block(&self, id: BlockId) -> StorageResult<Vec<u8>> {
        (**self).read_block(id)
    }

    fn write_block(&self, id: BlockId, data: &[u8]) -> StorageResult<()> {
        (**self).write_block(id, data)
    }

    fn flush(&self) -> StorageResult<()> {
        (**self).flush()
    }

    fn stats(&self) -> DeviceStats {
        (**self).stats()
    }
}

/// In-memory block device for testing. Stores written blocks in a map and
/// supports injecting read/write faults.
pub struct MemoryBlockDevice {
    geometry: Geometry,
    blocks: Mutex<HashMap<u64, Vec<u8>>>,
    stats: Mutex<DeviceStats>,
    read_faults: AtomicU32,
    write_faults: AtomicU32,
}

impl MemoryBlockDevice {
    /// Creates a new in-memory device with the given geometry.
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            blocks: Mutex::new(HashMap::new()),
            stats: Mutex::new(DeviceStats::default()),
            read_faults: AtomicU32::new(0),
            write_faults: AtomicU32::new(0),
        }
    }

    /// Makes the next `n` reads fail with a transient device fault.
    pub fn fail_next_reads(&self, n: u32) {
        self.read_faults.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` writes fail with a transient device fault.
    pub fn fail_next_writes(&self, n: u32) {
        self.write_faults.store(n, Ordering::SeqCst);
    }

    /// Directly corrupts a stored block's bytes (for scrub/checksum tests).
    pub fn corrupt_block(&self, id: BlockId, byte_index: usize) {
        let mut blocks = self.blocks.lock();
        if let Some(data) = blocks.get_mut(&id.as_u64()) {
            data[byte_index] ^= 0xFF;
        }
    }

    fn check_range(&self, id: BlockId) -> StorageResult<()> {
        if id.as_u64() >= self.geometry.total_blocks {
            return Err(StorageError::BlockNotFound { block_id: id });
        }
        Ok(())
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n > 0 {
                    Some(n - 1)
                } else {
                    None
                }
            })
            .is_ok()
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn read_block(&self, id: BlockId) -> StorageResult<Vec<u8>> {
        self.check_range(id)?;
        if Self::take_fault(&self.read_faults) {
            self.stats.lock().errors += 1;
            debug!(block = id.as_u64(), "injected read fault");
            return Err(StorageError::DeviceFault {
                reason: format!("injected read fault on {}", id),
            });
        }
        let data = self
            .blocks
            .lock()
            .get(&id.as_u64())
            .cloned()
            .unwrap_or_else(|| vec![0u8; self.geometry.block_size as usize]);
        let mut stats = self.stats.lock();
        stats.reads += 1;
        stats.bytes_read += data.len() as u64;
        Ok(data)
    }

    fn write_block(&self, id: BlockId, data: &[u8]) -> StorageResult<()> {
        self.check_range(id)?;
        if data.len() != self.geometry.block_size as usize {
            return Err(StorageError::BlockSizeMismatch {
                expected: self.geometry.block_size,
                actual: data.len(),
            });
        }
        if Self::take_fault(&self.write_faults) {
            self.stats.lock().errors += 1;
            debug!(block = id.as_u64(), "injected write fault");
            return Err(StorageError::DeviceFault {
                reason: format!("injected write fault on {}", id),
            });
        }
        self.blocks.lock().insert(id.as_u64(), data.to_vec());
        let mut stats = self.stats.lock();
        stats.writes += 1;
        stats.bytes_written += data.len() as u64;
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        self.stats.lock().flushes += 1;
        Ok(())
    }

    fn stats(&self) -> DeviceStats {
        self.stats.lock().clone()
    }
}
