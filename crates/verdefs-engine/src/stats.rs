//! Engine-wide usage counters and derived ratios.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Lock-free counters updated on the write and read paths.
#[derive(Debug, Default)]
pub struct EngineCounters {
    /// Writes that mutated an exclusively owned block in place.
    pub in_place_writes: AtomicU64,
    /// Writes that forked a new block.
    pub cow_forks: AtomicU64,
    /// Writes resolved against an existing block by content.
    pub dedup_hits: AtomicU64,
    /// Blocks written with a non-None compression algorithm.
    pub compressed_blocks: AtomicU64,
    /// Logical bytes accepted by the write path.
    pub logical_bytes_written: AtomicU64,
    /// Bytes physically stored after compression (dedup hits store none).
    pub physical_bytes_written: AtomicU64,
    /// Read operations served.
    pub reads: AtomicU64,
    /// Single-shot retries of transient block read errors.
    pub read_retries: AtomicU64,
}

impl EngineCounters {
    /// Bumps a counter by one.
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds to a counter.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Decrements a counter, saturating at zero.
    pub fn drop_one(counter: &AtomicU64) {
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }
}

/// Point-in-time statistics exposed to the VFS collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    /// Total blocks managed by the allocator.
    pub total_blocks: u64,
    /// Blocks currently free.
    pub free_blocks: u64,
    /// Blocks written compressed.
    pub compressed_blocks: u64,
    /// Blocks shared by more than one reference.
    pub deduplicated_blocks: u64,
    /// Total COW forks performed.
    pub cow_blocks: u64,
    /// Total in-place writes performed.
    pub in_place_writes: u64,
    /// Total dedup hits on the write path.
    pub dedup_hits: u64,
    /// Logical bytes written over physical bytes stored (1.0 = no savings).
    pub compression_ratio: f64,
    /// Fraction of non-in-place writes satisfied without a new block.
    pub dedup_ratio: f64,
}

impl EngineCounters {
    /// Derives the ratio fields from the raw counters.
    pub fn ratios(&self) -> (f64, f64) {
        let logical = self.logical_bytes_written.load(Ordering::Relaxed);
        let physical = self.physical_bytes_written.load(Ordering::Relaxed);
        let compression_ratio = if physical > 0 {
            logical as f64 / physical as f64
        } else {
            1.0
        };
        let hits = self.dedup_hits.load(Ordering::Relaxed);
        let forks = self.cow_forks.load(Ordering::Relaxed);
        let dedup_ratio = if hits + forks > 0 {
            hits as f64 / (hits + forks) as f64
        } else {
            0.0
        };
        (compression_ratio, dedup_ratio)
    }
}
