//! Property-based tests for the COW engine.
//!
//! A shadow model (a plain byte vector) tracks what every write sequence
//! should read back; after each scenario the scrub's refcount conservation
//! check must come back clean.

use std::sync::Arc;

use proptest::prelude::*;

use verdefs_engine::{EngineConfig, Filesystem};
use verdefs_storage::{Geometry, MemoryBlockDevice};

type TestFs = Filesystem<Arc<MemoryBlockDevice>>;

fn make_fs() -> TestFs {
    let device = Arc::new(MemoryBlockDevice::new(Geometry::new(4096, 1024, 64)));
    Filesystem::format(device, EngineConfig::default()).unwrap()
}

fn apply_to_model(model: &mut Vec<u8>, offset: u64, data: &[u8]) {
    let end = offset as usize + data.len();
    if model.len() < end {
        model.resize(end, 0);
    }
    model[offset as usize..end].copy_from_slice(data);
}

fn arb_writes() -> impl Strategy<Value = Vec<(u64, Vec<u8>)>> {
    prop::collection::vec(
        (
            0u64..40_000,
            prop::collection::vec(any::<u8>(), 1..6_000),
        ),
        1..10,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Any sequence of overlapping writes reads back exactly what the model
    /// says, including writes that straddle extent boundaries.
    #[test]
    fn prop_random_writes_roundtrip(writes in arb_writes()) {
        let fs = make_fs();
        let sv = fs.create_subvolume("prop");
        let ino = fs.create_file(sv, 0o644, 0, 0).unwrap();

        let mut model: Vec<u8> = Vec::new();
        for (offset, data) in &writes {
            let written = fs.write(sv, ino, *offset, data).unwrap();
            prop_assert_eq!(written, data.len());
            apply_to_model(&mut model, *offset, data);
        }

        let read_back = fs.read(sv, ino, 0, model.len()).unwrap();
        prop_assert_eq!(read_back, model);

        let report = fs.scrub().unwrap();
        prop_assert!(report.is_clean(), "scrub found {:?}", report.refcount_mismatches);
    }

    /// A snapshot's content never changes, whatever the live tree does
    /// afterwards.
    #[test]
    fn prop_snapshot_immutability(
        initial in prop::collection::vec(any::<u8>(), 1..20_000),
        later in arb_writes(),
        truncate_to in prop::option::of(0u64..20_000),
    ) {
        let fs = make_fs();
        let sv = fs.create_subvolume("prop");
        let ino = fs.create_file(sv, 0o644, 0, 0).unwrap();

        fs.write(sv, ino, 0, &initial).unwrap();
        let snap = fs.create_snapshot(sv).unwrap();

        for (offset, data) in &later {
            fs.write(sv, ino, *offset, data).unwrap();
        }
        if let Some(size) = truncate_to {
            fs.truncate(sv, ino, size).unwrap();
        }

        let frozen = fs.read_snapshot(sv, snap, ino, 0, initial.len()).unwrap();
        prop_assert_eq!(frozen, initial);
        prop_assert!(fs.scrub().unwrap().is_clean());
    }

    /// Creating and deleting a snapshot around arbitrary writes conserves
    /// refcounts and frees everything only the snapshot pinned.
    #[test]
    fn prop_snapshot_delete_conserves_refcounts(
        before in arb_writes(),
        after in arb_writes(),
    ) {
        let fs = make_fs();
        let sv = fs.create_subvolume("prop");
        let ino = fs.create_file(sv, 0o644, 0, 0).unwrap();

        for (offset, data) in &before {
            fs.write(sv, ino, *offset, data).unwrap();
        }
        let snap = fs.create_snapshot(sv).unwrap();
        let mut model: Vec<u8> = Vec::new();
        for (offset, data) in &before {
            apply_to_model(&mut model, *offset, data);
        }
        for (offset, data) in &after {
            fs.write(sv, ino, *offset, data).unwrap();
            apply_to_model(&mut model, *offset, data);
        }

        fs.delete_snapshot(sv, snap).unwrap();

        let read_back = fs.read(sv, ino, 0, model.len()).unwrap();
        prop_assert_eq!(read_back, model);
        let report = fs.scrub().unwrap();
        prop_assert!(report.is_clean(), "scrub found {:?}", report.refcount_mismatches);
    }

    /// Rolling back twice to the same snapshot is idempotent.
    #[test]
    fn prop_rollback_idempotent(
        before in arb_writes(),
        after in arb_writes(),
    ) {
        let fs = make_fs();
        let sv = fs.create_subvolume("prop");
        let ino = fs.create_file(sv, 0o644, 0, 0).unwrap();

        let mut model: Vec<u8> = Vec::new();
        for (offset, data) in &before {
            fs.write(sv, ino, *offset, data).unwrap();
            apply_to_model(&mut model, *offset, data);
        }
        let snap = fs.create_snapshot(sv).unwrap();
        for (offset, data) in &after {
            fs.write(sv, ino, *offset, data).unwrap();
        }

        fs.rollback_snapshot(sv, snap).unwrap();
        let first = fs.read(sv, ino, 0, model.len()).unwrap();
        let free_first = fs.allocator_stats().free_blocks;

        fs.rollback_snapshot(sv, snap).unwrap();
        let second = fs.read(sv, ino, 0, model.len()).unwrap();

        prop_assert_eq!(&first, &model);
        prop_assert_eq!(&second, &model);
        prop_assert_eq!(free_first, fs.allocator_stats().free_blocks);
        prop_assert!(fs.scrub().unwrap().is_clean());
    }
}
