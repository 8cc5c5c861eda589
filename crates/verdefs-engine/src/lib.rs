#![warn(missing_docs)]

//! VerdeFS engine: copy-on-write extent mapping, snapshots, subvolumes, dedup
//!
//! This crate is the write-path coordinator over the storage and reduction
//! layers. It maps logical file offsets to physical blocks through per-inode
//! extent trees, enforces copy-on-write semantics across snapshots via a
//! monotonic generation counter, deduplicates identical block content, and
//! keeps allocation and reference-count bookkeeping consistent through a
//! single ledger.
//!
//! The entry point is [`Filesystem`], an explicit instance handle consumed
//! by the virtual-filesystem collaborator.

pub mod checkpoint;
pub mod cow;
pub mod error;
pub mod extent;
pub mod fs;
pub mod inode;
pub mod ledger;
pub mod scrub;
pub mod snapshot;
pub mod stats;
pub mod subvolume;

pub use checkpoint::{CHECKPOINT_MAGIC, CHECKPOINT_VERSION};
pub use cow::{CowEngine, EngineConfig};
pub use error::{EngineError, EngineResult};
pub use extent::{Extent, ExtentRef, ExtentTree, ResolvedSlice, SpliceOutcome};
pub use fs::Filesystem;
pub use inode::{FileKind, Inode};
pub use ledger::{LedgerState, RefLedger};
pub use scrub::{RefcountMismatch, ScrubChecksumError, ScrubReport};
pub use snapshot::{Snapshot, SnapshotId, SnapshotInfo};
pub use stats::{EngineCounters, EngineStats};
pub use subvolume::{QuotaLimits, Subvolume, SubvolumeId, SubvolumeUsage};
