//! Content-addressed dedup index.
//!
//! Maps content digests to physical blocks. A digest match alone never causes
//! data sharing: the engine performs a full payload comparison before
//! treating two blocks as identical, and records the rare mismatch here as a
//! detected collision.
//!
//! Reference counts are deliberately NOT stored in this index. The dedup
//! entry's refcount and the block reference's refcount are one logical
//! counter, owned by the engine's ledger; this index is the hash → block
//! mapping only, so the two counters cannot drift.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use verdefs_storage::BlockId;

use crate::fingerprint::ContentHash;

/// Configuration for the dedup index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Whether dedup lookups are performed on the write path. Disabling
    /// stops new lookups and inserts only; existing shared blocks stay valid.
    pub enabled: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// A dedup table entry: where the content lives and how many bytes of it
/// are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupEntry {
    /// Physical block holding this content.
    pub block_id: BlockId,
    /// Stored payload length in bytes.
    pub size: u32,
}

/// Statistics for the dedup index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DedupStats {
    /// Number of unique content hashes tracked.
    pub entries: u64,
    /// Lookups that found a candidate entry.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Digest matches rejected by full payload comparison.
    pub collisions_detected: u64,
}

/// Serializable index state for checkpointing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DedupState {
    /// All (hash, entry) pairs.
    pub entries: Vec<(ContentHash, DedupEntry)>,
    /// Whether the index was enabled.
    pub enabled: bool,
}

/// Content-addressed index from digest to physical block.
/// Lookups are concurrent; mutation is per-shard via the underlying map.
pub struct DedupIndex {
    by_hash: DashMap<ContentHash, DedupEntry>,
    by_block: DashMap<BlockId, ContentHash>,
    enabled: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    collisions: AtomicU64,
}

impl DedupIndex {
    /// Creates an empty index.
    pub fn new(config: DedupConfig) -> Self {
        Self {
            by_hash: DashMap::new(),
            by_block: DashMap::new(),
            enabled: AtomicBool::new(config.enabled),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            collisions: AtomicU64::new(0),
        }
    }

    /// Restores an index from checkpointed state.
    pub fn from_state(state: DedupState) -> Self {
        let index = Self::new(DedupConfig {
            enabled: state.enabled,
        });
        for (hash, entry) in state.entries {
            index.by_block.insert(entry.block_id, hash);
            index.by_hash.insert(hash, entry);
        }
        index
    }

    /// True if dedup lookups are currently performed.
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Enables or disables new dedup lookups. Existing entries are kept so
    /// already-shared blocks remain resolvable and releasable.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Looks up the entry for a content digest. Returns `None` when the
    /// index is disabled or the digest is unknown.
    pub fn lookup(&self, hash: &ContentHash) -> Option<DedupEntry> {
        if !self.enabled() {
            return None;
        }
        match self.by_hash.get(hash) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(*entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Returns the entry for a digest without touching hit/miss counters or
    /// honoring the enabled flag. Used by the ledger to re-validate a
    /// candidate under its own lock.
    pub fn peek(&self, hash: &ContentHash) -> Option<DedupEntry> {
        self.by_hash.get(hash).map(|entry| *entry)
    }

    /// Registers content for a block. Replaces any stale mapping the block
    /// had under a previous digest, and detaches a different block that
    /// previously claimed this digest so reverse lookups never cross-free.
    pub fn insert(&self, hash: ContentHash, block_id: BlockId, size: u32) {
        if let Some((_, old_hash)) = self.by_block.remove(&block_id) {
            self.by_hash.remove_if(&old_hash, |_, e| e.block_id == block_id);
        }
        if let Some(prev) = self.by_hash.insert(hash, DedupEntry { block_id, size }) {
            if prev.block_id != block_id {
                self.by_block.remove_if(&prev.block_id, |_, h| *h == hash);
            }
        }
        debug!(block = block_id.as_u64(), hash = %hash, "dedup insert");
        self.by_block.insert(block_id, hash);
    }

    /// Removes the entry for a digest, if present.
    pub fn remove(&self, hash: &ContentHash) -> Option<DedupEntry> {
        let (_, entry) = self.by_hash.remove(hash)?;
        self.by_block.remove(&entry.block_id);
        Some(entry)
    }

    /// Removes whatever entry maps to the given block. Called by the ledger
    /// when a block's refcount reaches zero, and by in-place overwrites
    /// before the block's content changes.
    pub fn remove_block(&self, block_id: &BlockId) -> Option<ContentHash> {
        let (_, hash) = self.by_block.remove(block_id)?;
        self.by_hash.remove_if(&hash, |_, e| e.block_id == *block_id);
        debug!(block = block_id.as_u64(), "dedup entry dropped");
        Some(hash)
    }

    /// True if the block currently backs a dedup entry.
    pub fn contains_block(&self, block_id: &BlockId) -> bool {
        self.by_block.contains_key(block_id)
    }

    /// Records a digest match that failed full payload comparison.
    pub fn record_collision(&self) {
        self.collisions.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of unique content hashes tracked.
    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    /// Is the index empty?
    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    /// Returns index statistics.
    pub fn stats(&self) -> DedupStats {
        DedupStats {
            entries: self.by_hash.len() as u64,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            collisions_detected: self.collisions.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of the full state for checkpointing.
    pub fn state(&self) -> DedupState {
        DedupState {
            entries: self
                .by_hash
                .iter()
                .map(|kv| (*kv.key(), *kv.value()))
                .collect(),
            enabled: self.enabled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::content_hash;

    fn make_index() -> DedupIndex {
        DedupIndex::new(DedupConfig::default())
    }

    #[test]
    fn test_lookup_miss_then_hit() {
        let index = make_index();
        let hash = content_hash(b"payload");
        assert!(index.lookup(&hash).is_none());

        index.insert(hash, BlockId::new(9), 7);
        let entry = index.lookup(&hash).unwrap();
        assert_eq!(entry.block_id, BlockId::new(9));
        assert_eq!(entry.size, 7);

        let stats = index.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_remove_block_drops_hash_mapping() {
        let index = make_index();
        let hash = content_hash(b"abc");
        index.insert(hash, BlockId::new(1), 3);
        assert!(index.contains_block(&BlockId::new(1)));

        assert_eq!(index.remove_block(&BlockId::new(1)), Some(hash));
        assert!(index.lookup(&hash).is_none());
        assert!(index.is_empty());
    }

    #[test]
    fn test_reinsert_same_block_replaces_stale_hash() {
        let index = make_index();
        let old = content_hash(b"old content");
        let new = content_hash(b"new content");
        index.insert(old, BlockId::new(5), 11);
        index.insert(new, BlockId::new(5), 11);

        assert!(index.lookup(&old).is_none());
        assert_eq!(index.lookup(&new).unwrap().block_id, BlockId::new(5));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_disabled_index_stops_lookups_only() {
        let index = make_index();
        let hash = content_hash(b"shared");
        index.insert(hash, BlockId::new(2), 6);

        index.set_enabled(false);
        assert!(index.lookup(&hash).is_none());
        // The entry survives: existing deduplicated data is not corrupted.
        assert_eq!(index.len(), 1);
        assert!(index.contains_block(&BlockId::new(2)));

        index.set_enabled(true);
        assert!(index.lookup(&hash).is_some());
    }

    #[test]
    fn test_hash_takeover_detaches_previous_block() {
        let index = make_index();
        let hash = content_hash(b"same bytes");
        index.insert(hash, BlockId::new(1), 10);
        index.insert(hash, BlockId::new(2), 10);

        // Block 1 no longer owns the digest; dropping it must not disturb
        // block 2's entry.
        assert_eq!(index.remove_block(&BlockId::new(1)), None);
        assert_eq!(index.lookup(&hash).unwrap().block_id, BlockId::new(2));
        assert!(index.contains_block(&BlockId::new(2)));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_collision_counter() {
        let index = make_index();
        index.record_collision();
        index.record_collision();
        assert_eq!(index.stats().collisions_detected, 2);
    }

    #[test]
    fn test_state_roundtrip() {
        let index = make_index();
        let h1 = content_hash(b"one");
        let h2 = content_hash(b"two");
        index.insert(h1, BlockId::new(1), 3);
        index.insert(h2, BlockId::new(2), 3);
        index.set_enabled(false);

        let restored = DedupIndex::from_state(index.state());
        assert_eq!(restored.len(), 2);
        assert!(!restored.enabled());
        assert!(restored.contains_block(&BlockId::new(1)));
        restored.set_enabled(true);
        assert_eq!(restored.lookup(&h2).unwrap().block_id, BlockId::new(2));
    }
}
