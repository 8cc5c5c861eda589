//! Property-based tests for the storage layer.
//!
//! These verify allocator and bitmap invariants across arbitrary
//! alloc/free sequences, the kind of edge cases unit tests tend to miss.

use std::collections::HashSet;

use proptest::prelude::*;

use verdefs_storage::{AllocatorConfig, BlockAllocator, Bitmap};

fn make_allocator(total_blocks: u64) -> BlockAllocator {
    BlockAllocator::new(AllocatorConfig {
        total_blocks,
        total_inodes: 64,
    })
    .unwrap()
}

proptest! {
    /// free + allocated always equals total, whatever the interleaving.
    #[test]
    fn prop_allocator_conserves_blocks(
        alloc_count in 1u32..200,
        free_count in 0u32..100,
    ) {
        let total = 256u64;
        let alloc = make_allocator(total);

        let mut held = Vec::new();
        for _ in 0..alloc_count {
            match alloc.allocate_block() {
                Ok(block) => held.push(block),
                Err(_) => break,
            }
        }
        let to_free = (free_count as usize).min(held.len());
        for block in held.drain(..to_free) {
            alloc.free_block(block).unwrap();
        }

        let stats = alloc.stats();
        prop_assert_eq!(stats.free_blocks + held.len() as u64, total);
    }

    /// Every allocated block id is unique while held.
    #[test]
    fn prop_allocator_unique_ids(alloc_count in 1u32..300) {
        let alloc = make_allocator(256);
        let mut seen = HashSet::new();
        for _ in 0..alloc_count {
            match alloc.allocate_block() {
                Ok(block) => prop_assert!(seen.insert(block), "duplicate {}", block),
                Err(_) => break,
            }
        }
    }

    /// A bitmap round-trips through serialization with hint and counts
    /// intact, and allocation picks up where it left off.
    #[test]
    fn prop_bitmap_serde_roundtrip(
        bits in 1u64..500,
        ops in prop::collection::vec(any::<bool>(), 0..100),
    ) {
        let mut bitmap = Bitmap::new(bits);
        let mut held = Vec::new();
        for alloc in ops {
            if alloc {
                if let Some(idx) = bitmap.allocate() {
                    held.push(idx);
                }
            } else if let Some(idx) = held.pop() {
                bitmap.clear(idx).unwrap();
            }
        }

        let encoded = bincode::serialize(&bitmap).unwrap();
        let mut decoded: Bitmap = bincode::deserialize(&encoded).unwrap();
        prop_assert_eq!(&bitmap, &decoded);

        // Both continue identically.
        prop_assert_eq!(bitmap.allocate(), decoded.allocate());
        prop_assert_eq!(bitmap.set_count(), decoded.set_count());
    }

    /// Exhaustion returns an error without flipping any bit.
    #[test]
    fn prop_exhaustion_is_loud_and_stable(total in 1u64..64) {
        let alloc = make_allocator(total);
        for _ in 0..total {
            alloc.allocate_block().unwrap();
        }
        let stats_full = alloc.stats();
        prop_assert!(alloc.allocate_block().is_err());
        prop_assert_eq!(alloc.stats().free_blocks, stats_full.free_blocks);
    }
}
