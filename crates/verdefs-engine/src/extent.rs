//! Per-inode extent tree: logical byte ranges to block references.
//!
//! Extents are keyed by logical offset in an ordered balanced map, so range
//! lookups, splits, and merges stay logarithmic. The tree never touches
//! reference counts itself: every mutation reports which references it
//! displaced and which it duplicated, and the caller settles them with the
//! ledger. That split keeps tree surgery pure and makes staged aborts
//! trivial — nothing here performs I/O.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use verdefs_reduce::CompressionAlgorithm;
use verdefs_storage::{BlockId, Checksum};

/// A reference from an extent to a physical block, with the descriptors
/// needed to decode and verify the payload and the COW generation stamped at
/// write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentRef {
    /// The physical block.
    pub block_id: BlockId,
    /// Compression applied to the stored payload.
    pub compression: CompressionAlgorithm,
    /// Checksum over the stored (post-compression) payload bytes.
    pub checksum: Checksum,
    /// Stored payload length in bytes (before zero padding to block size).
    pub stored_len: u32,
    /// COW generation at which this reference was written. A block may be
    /// mutated in place only when this matches the subvolume's current
    /// generation and the refcount is one.
    pub cow_generation: u64,
}

/// One extent: a contiguous logical range backed by a sub-range of a block's
/// decoded payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    /// Length of the logical range in bytes.
    pub length: u64,
    /// Offset into the block's decoded payload where this extent's data
    /// starts. Nonzero only for remnants left behind by splits.
    pub payload_offset: u32,
    /// The backing block reference.
    pub block_ref: ExtentRef,
}

/// A sub-range produced by [`ExtentTree::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedSlice {
    /// Logical offset of this piece.
    pub logical_offset: u64,
    /// Length of this piece in bytes.
    pub length: u64,
    /// Offset into the block's decoded payload for this piece.
    pub payload_offset: u32,
    /// Logical offset where the owning extent starts.
    pub extent_start: u64,
    /// The backing block reference.
    pub block_ref: ExtentRef,
}

/// Reference bookkeeping owed after a tree mutation: `released` entries lost
/// their tree slot, `acquired` entries gained an additional one (remnants of
/// a split both pointing at the original block).
#[derive(Debug, Default)]
pub struct SpliceOutcome {
    /// References the caller must release.
    pub released: Vec<ExtentRef>,
    /// References the caller must acquire.
    pub acquired: Vec<ExtentRef>,
}

/// Balanced map from logical offset to extent for one inode.
///
/// Invariant: no two extents overlap in logical range.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtentTree {
    extents: BTreeMap<u64, Extent>,
}

impl ExtentTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of extents in the tree.
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    /// True if the tree maps nothing.
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Iterates `(logical_offset, extent)` pairs in offset order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &Extent)> {
        self.extents.iter().map(|(&k, v)| (k, v))
    }

    /// Iterates every block reference held by the tree. Each tree entry is
    /// one counted reference.
    pub fn refs(&self) -> impl Iterator<Item = &ExtentRef> {
        self.extents.values().map(|e| &e.block_ref)
    }

    /// One past the last mapped byte, or 0 for an empty tree.
    pub fn covered_end(&self) -> u64 {
        self.extents
            .iter()
            .next_back()
            .map(|(&s, e)| s + e.length)
            .unwrap_or(0)
    }

    /// Starts of every extent overlapping `[offset, offset + len)`.
    fn overlapping(&self, offset: u64, len: u64) -> Vec<u64> {
        let end = offset + len;
        let mut starts = Vec::new();
        if let Some((&s, e)) = self.extents.range(..offset).next_back() {
            if s + e.length > offset {
                starts.push(s);
            }
        }
        starts.extend(self.extents.range(offset..end).map(|(&s, _)| s));
        starts
    }

    /// Resolves `[offset, offset + len)` to backing sub-ranges in offset
    /// order. Holes are skipped; the caller reads them as zeroes.
    pub fn resolve(&self, offset: u64, len: u64) -> Vec<ResolvedSlice> {
        if len == 0 {
            return Vec::new();
        }
        let end = offset + len;
        self.overlapping(offset, len)
            .into_iter()
            .map(|s| {
                let e = &self.extents[&s];
                let piece_start = s.max(offset);
                let piece_end = (s + e.length).min(end);
                ResolvedSlice {
                    logical_offset: piece_start,
                    length: piece_end - piece_start,
                    payload_offset: e.payload_offset + (piece_start - s) as u32,
                    extent_start: s,
                    block_ref: e.block_ref,
                }
            })
            .collect()
    }

    /// Maps `[offset, offset + len)` to `new_ref`, displacing whatever the
    /// range previously covered. A partially overlapped extent leaves an
    /// unchanged-left and/or unchanged-right remnant pointing at its original
    /// block; the outcome reports the displaced reference as released and
    /// each remnant as a freshly acquired one.
    pub fn insert_or_replace(&mut self, offset: u64, len: u64, new_ref: ExtentRef) -> SpliceOutcome {
        let mut outcome = SpliceOutcome::default();
        if len == 0 {
            return outcome;
        }
        let end = offset + len;
        for s in self.overlapping(offset, len) {
            let old = self.extents.remove(&s).expect("overlap start present");
            let old_end = s + old.length;
            if s < offset {
                self.extents.insert(
                    s,
                    Extent {
                        length: offset - s,
                        payload_offset: old.payload_offset,
                        block_ref: old.block_ref,
                    },
                );
                outcome.acquired.push(old.block_ref);
            }
            if old_end > end {
                self.extents.insert(
                    end,
                    Extent {
                        length: old_end - end,
                        payload_offset: old.payload_offset + (end - s) as u32,
                        block_ref: old.block_ref,
                    },
                );
                outcome.acquired.push(old.block_ref);
            }
            outcome.released.push(old.block_ref);
        }
        self.extents.insert(
            offset,
            Extent {
                length: len,
                payload_offset: 0,
                block_ref: new_ref,
            },
        );
        outcome
    }

    /// Rewrites the extent starting exactly at `start` without changing the
    /// reference count: same tree slot, same block, updated descriptors.
    /// Used by in-place overwrites.
    pub fn update_in_place(&mut self, start: u64, new_length: u64, new_ref: ExtentRef) -> bool {
        match self.extents.get_mut(&start) {
            Some(e) => {
                e.length = new_length;
                e.payload_offset = 0;
                e.block_ref = new_ref;
                true
            }
            None => false,
        }
    }

    /// Splits the extent spanning `offset` into two entries at that point.
    /// Both halves reference the original block, so the caller must acquire
    /// the returned reference once. No-op at extent boundaries or in holes.
    pub fn split_at(&mut self, offset: u64) -> Option<ExtentRef> {
        let (&s, e) = self.extents.range(..offset).next_back()?;
        let e = *e;
        if s + e.length <= offset {
            return None;
        }
        let left_len = offset - s;
        self.extents.insert(
            s,
            Extent {
                length: left_len,
                payload_offset: e.payload_offset,
                block_ref: e.block_ref,
            },
        );
        self.extents.insert(
            offset,
            Extent {
                length: e.length - left_len,
                payload_offset: e.payload_offset + left_len as u32,
                block_ref: e.block_ref,
            },
        );
        Some(e.block_ref)
    }

    /// Drops every extent wholly at or beyond `new_size`, returning their
    /// references for release, and trims the boundary extent when the new
    /// size falls mid-extent (the trimmed entry keeps its single reference).
    pub fn truncate_to(&mut self, new_size: u64) -> Vec<ExtentRef> {
        let released: Vec<ExtentRef> = {
            let beyond: Vec<u64> = self.extents.range(new_size..).map(|(&s, _)| s).collect();
            beyond
                .into_iter()
                .map(|s| self.extents.remove(&s).expect("start present").block_ref)
                .collect()
        };
        if let Some((&s, e)) = self.extents.range_mut(..new_size).next_back() {
            if s + e.length > new_size {
                e.length = new_size - s;
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verdefs_storage::{Checksum, ChecksumAlgorithm};

    fn make_ref(block: u64, generation: u64) -> ExtentRef {
        ExtentRef {
            block_id: BlockId::new(block),
            compression: CompressionAlgorithm::None,
            checksum: Checksum::new(ChecksumAlgorithm::None, 0),
            stored_len: 4096,
            cow_generation: generation,
        }
    }

    #[test]
    fn test_insert_into_empty() {
        let mut tree = ExtentTree::new();
        let outcome = tree.insert_or_replace(0, 4096, make_ref(1, 1));
        assert!(outcome.released.is_empty());
        assert!(outcome.acquired.is_empty());
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.covered_end(), 4096);
    }

    #[test]
    fn test_resolve_exact() {
        let mut tree = ExtentTree::new();
        tree.insert_or_replace(0, 100, make_ref(1, 1));
        let slices = tree.resolve(0, 100);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].logical_offset, 0);
        assert_eq!(slices[0].length, 100);
        assert_eq!(slices[0].payload_offset, 0);
    }

    #[test]
    fn test_resolve_sub_range() {
        let mut tree = ExtentTree::new();
        tree.insert_or_replace(100, 200, make_ref(1, 1));
        let slices = tree.resolve(150, 50);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].logical_offset, 150);
        assert_eq!(slices[0].length, 50);
        assert_eq!(slices[0].payload_offset, 50);
        assert_eq!(slices[0].extent_start, 100);
    }

    #[test]
    fn test_resolve_skips_holes() {
        let mut tree = ExtentTree::new();
        tree.insert_or_replace(0, 100, make_ref(1, 1));
        tree.insert_or_replace(300, 100, make_ref(2, 1));
        let slices = tree.resolve(0, 400);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].block_ref.block_id, BlockId::new(1));
        assert_eq!(slices[1].logical_offset, 300);
    }

    #[test]
    fn test_replace_middle_three_way() {
        let mut tree = ExtentTree::new();
        tree.insert_or_replace(0, 300, make_ref(1, 1));
        let outcome = tree.insert_or_replace(100, 100, make_ref(2, 2));

        // Original reference displaced once, re-acquired by both remnants.
        assert_eq!(outcome.released.len(), 1);
        assert_eq!(outcome.released[0].block_id, BlockId::new(1));
        assert_eq!(outcome.acquired.len(), 2);
        assert!(outcome
            .acquired
            .iter()
            .all(|r| r.block_id == BlockId::new(1)));

        assert_eq!(tree.len(), 3);
        let slices = tree.resolve(0, 300);
        assert_eq!(slices[0].length, 100);
        assert_eq!(slices[0].payload_offset, 0);
        assert_eq!(slices[1].block_ref.block_id, BlockId::new(2));
        assert_eq!(slices[2].payload_offset, 200);
        assert_eq!(slices[2].block_ref.block_id, BlockId::new(1));
    }

    #[test]
    fn test_replace_covering_multiple() {
        let mut tree = ExtentTree::new();
        tree.insert_or_replace(0, 100, make_ref(1, 1));
        tree.insert_or_replace(100, 100, make_ref(2, 1));
        tree.insert_or_replace(200, 100, make_ref(3, 1));

        let outcome = tree.insert_or_replace(0, 300, make_ref(4, 2));
        assert_eq!(outcome.released.len(), 3);
        assert!(outcome.acquired.is_empty());
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_replace_left_overlap_only() {
        let mut tree = ExtentTree::new();
        tree.insert_or_replace(0, 200, make_ref(1, 1));
        let outcome = tree.insert_or_replace(100, 200, make_ref(2, 2));
        assert_eq!(outcome.released.len(), 1);
        assert_eq!(outcome.acquired.len(), 1);
        assert_eq!(tree.len(), 2);
        let slices = tree.resolve(0, 300);
        assert_eq!(slices[0].length, 100);
        assert_eq!(slices[1].length, 200);
    }

    #[test]
    fn test_no_overlap_after_mutations() {
        let mut tree = ExtentTree::new();
        tree.insert_or_replace(0, 300, make_ref(1, 1));
        tree.insert_or_replace(100, 100, make_ref(2, 2));
        tree.insert_or_replace(50, 200, make_ref(3, 3));

        let mut last_end = 0;
        for (s, e) in tree.iter() {
            assert!(s >= last_end, "extent at {} overlaps previous", s);
            last_end = s + e.length;
        }
    }

    #[test]
    fn test_split_at_mid_extent() {
        let mut tree = ExtentTree::new();
        tree.insert_or_replace(0, 200, make_ref(1, 1));
        let dup = tree.split_at(50);
        assert_eq!(dup.unwrap().block_id, BlockId::new(1));
        assert_eq!(tree.len(), 2);
        let slices = tree.resolve(0, 200);
        assert_eq!(slices[0].length, 50);
        assert_eq!(slices[1].payload_offset, 50);
    }

    #[test]
    fn test_split_at_boundary_is_noop() {
        let mut tree = ExtentTree::new();
        tree.insert_or_replace(0, 100, make_ref(1, 1));
        tree.insert_or_replace(100, 100, make_ref(2, 1));
        assert!(tree.split_at(100).is_none());
        assert!(tree.split_at(0).is_none());
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_truncate_releases_beyond() {
        let mut tree = ExtentTree::new();
        tree.insert_or_replace(0, 100, make_ref(1, 1));
        tree.insert_or_replace(100, 100, make_ref(2, 1));
        tree.insert_or_replace(200, 100, make_ref(3, 1));

        let released = tree.truncate_to(100);
        let ids: Vec<u64> = released.iter().map(|r| r.block_id.as_u64()).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.covered_end(), 100);
    }

    #[test]
    fn test_truncate_splits_boundary_extent() {
        let mut tree = ExtentTree::new();
        tree.insert_or_replace(0, 300, make_ref(1, 1));
        let released = tree.truncate_to(150);
        // Mid-extent truncate trims; the single reference survives.
        assert!(released.is_empty());
        assert_eq!(tree.covered_end(), 150);
        let slices = tree.resolve(0, 300);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].length, 150);
    }

    #[test]
    fn test_truncate_to_zero() {
        let mut tree = ExtentTree::new();
        tree.insert_or_replace(0, 100, make_ref(1, 1));
        tree.insert_or_replace(100, 100, make_ref(2, 1));
        let released = tree.truncate_to(0);
        assert_eq!(released.len(), 2);
        assert!(tree.is_empty());
        assert_eq!(tree.covered_end(), 0);
    }

    #[test]
    fn test_update_in_place() {
        let mut tree = ExtentTree::new();
        tree.insert_or_replace(0, 100, make_ref(1, 1));
        let mut new_ref = make_ref(1, 1);
        new_ref.stored_len = 150;
        assert!(tree.update_in_place(0, 150, new_ref));
        assert_eq!(tree.covered_end(), 150);
        assert!(!tree.update_in_place(7, 10, new_ref));
    }

    #[test]
    fn test_resolve_zero_len() {
        let mut tree = ExtentTree::new();
        tree.insert_or_replace(0, 100, make_ref(1, 1));
        assert!(tree.resolve(0, 0).is_empty());
    }
}
