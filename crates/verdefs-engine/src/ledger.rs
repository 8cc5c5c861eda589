//! Centralized block-reference counting.
//!
//! Every refcount mutation in the engine goes through this one API, so the
//! conservation invariant (refcount equals the number of tree entries across
//! all owning inode instances resolving to the block) is enforced and
//! testable in a single place. The count for a deduplicated block and its
//! dedup-index entry are one logical counter: when a release reaches zero,
//! the dedup entry is dropped and the bitmap bit cleared in the same
//! transition, so the bit is never clear while a reference exists.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use verdefs_reduce::{ContentHash, DedupEntry, DedupIndex};
use verdefs_storage::{BlockAllocator, BlockId, StorageError, StorageResult};

/// Serializable ledger state for checkpointing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerState {
    /// All (block, refcount) pairs with nonzero counts.
    pub counts: Vec<(BlockId, u64)>,
}

/// The single acquire/release API for block references.
pub struct RefLedger {
    counts: Mutex<HashMap<BlockId, u64>>,
    allocator: Arc<BlockAllocator>,
    dedup: Arc<DedupIndex>,
}

impl RefLedger {
    /// Creates an empty ledger over the given allocator and dedup index.
    pub fn new(allocator: Arc<BlockAllocator>, dedup: Arc<DedupIndex>) -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
            allocator,
            dedup,
        }
    }

    /// Restores a ledger from checkpointed state.
    pub fn from_state(
        state: LedgerState,
        allocator: Arc<BlockAllocator>,
        dedup: Arc<DedupIndex>,
    ) -> Self {
        Self {
            counts: Mutex::new(state.counts.into_iter().collect()),
            allocator,
            dedup,
        }
    }

    /// Enters a freshly allocated block with refcount one.
    pub fn register(&self, block: BlockId) -> StorageResult<()> {
        let mut counts = self.counts.lock();
        if counts.contains_key(&block) {
            return Err(StorageError::invariant(format!(
                "register of already-tracked {}",
                block
            )));
        }
        counts.insert(block, 1);
        debug!(block = block.as_u64(), "registered block reference");
        Ok(())
    }

    /// Increments the refcount of a tracked block. Returns the new count.
    pub fn acquire(&self, block: BlockId) -> StorageResult<u64> {
        let mut counts = self.counts.lock();
        match counts.get_mut(&block) {
            Some(count) => {
                *count += 1;
                debug!(block = block.as_u64(), refcount = *count, "acquired");
                Ok(*count)
            }
            None => Err(StorageError::invariant(format!(
                "acquire of untracked {}",
                block
            ))),
        }
    }

    /// Acquires a dedup candidate, re-validating under the ledger lock that
    /// the index still maps `hash` to the same block. Returns `None` when the
    /// entry vanished (e.g. an in-place overwrite invalidated it) — the
    /// caller falls back to forking.
    pub fn acquire_dedup(&self, hash: &ContentHash, entry: &DedupEntry) -> StorageResult<Option<u64>> {
        let mut counts = self.counts.lock();
        match self.dedup.peek(hash) {
            Some(current) if current.block_id == entry.block_id => {}
            _ => return Ok(None),
        }
        match counts.get_mut(&entry.block_id) {
            Some(count) => {
                *count += 1;
                Ok(Some(*count))
            }
            None => Err(StorageError::invariant(format!(
                "dedup entry references untracked {}",
                entry.block_id
            ))),
        }
    }

    /// Drops the dedup entry backed by `block`, if any, under the ledger
    /// lock. In-place overwrites call this before changing the block's
    /// content so no concurrent lookup can resolve to stale bytes.
    pub fn invalidate_dedup(&self, block: BlockId) {
        let _counts = self.counts.lock();
        self.dedup.remove_block(&block);
    }

    /// Decrements the refcount. At zero the block leaves the ledger, loses
    /// its dedup entry, and its bitmap bit is cleared. Returns the new count.
    pub fn release(&self, block: BlockId) -> StorageResult<u64> {
        let mut counts = self.counts.lock();
        let count = counts.get_mut(&block).ok_or_else(|| {
            StorageError::invariant(format!("release of untracked {}", block))
        })?;
        *count -= 1;
        let remaining = *count;
        debug!(block = block.as_u64(), refcount = remaining, "released");
        if remaining == 0 {
            counts.remove(&block);
            self.dedup.remove_block(&block);
            self.allocator.free_block(block)?;
        }
        Ok(remaining)
    }

    /// Current refcount of a block (0 when untracked).
    pub fn refcount(&self, block: BlockId) -> u64 {
        self.counts.lock().get(&block).copied().unwrap_or(0)
    }

    /// Number of blocks with a nonzero refcount.
    pub fn tracked_blocks(&self) -> usize {
        self.counts.lock().len()
    }

    /// Number of blocks shared by more than one reference.
    pub fn shared_blocks(&self) -> u64 {
        self.counts.lock().values().filter(|&&c| c > 1).count() as u64
    }

    /// Snapshot of the full state for checkpointing and scrub.
    pub fn state(&self) -> LedgerState {
        LedgerState {
            counts: self.counts.lock().iter().map(|(&b, &c)| (b, c)).collect(),
        }
    }
}
