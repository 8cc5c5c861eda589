//! Checkpoint serialization of all engine-owned persisted state.
//!
//! The image captures the allocator bitmaps, the reference ledger, the dedup
//! table, and every subvolume's metadata — including the structural sharing
//! between a live tree and its snapshots, which is what the refcount
//! semantics depend on. Inode instances are written once and views reference
//! them by index, so a restore rebuilds the exact same sharing graph.
//!
//! Crash-safe replay around this image belongs to the journaling
//! collaborator; this module only guarantees that a committed image
//! round-trips without losing refcount consistency.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use verdefs_reduce::{DedupIndex, DedupState};
use verdefs_storage::{
    checksum, AllocatorState, BlockAllocator, BlockDevice, ChecksumAlgorithm, Geometry, InodeId,
};

use crate::cow::{CowEngine, EngineConfig};
use crate::error::{EngineError, EngineResult};
use crate::fs::{Filesystem, SubvolState};
use crate::inode::Inode;
use crate::ledger::{LedgerState, RefLedger};
use crate::snapshot::{Snapshot, SnapshotId};
use crate::stats::EngineCounters;
use crate::subvolume::{InodeTable, QuotaLimits, Subvolume, SubvolumeId, SubvolumeUsage};

/// Checkpoint magic: "VDFS".
pub const CHECKPOINT_MAGIC: u32 = 0x5644_4653;
/// Current checkpoint format version.
pub const CHECKPOINT_VERSION: u8 = 1;

/// Outer framing: magic, version, and a checksum over the serialized body.
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointEnvelope {
    magic: u32,
    version: u8,
    checksum: u32,
    body: Vec<u8>,
}

/// One view's inode table, as (inode id, instance index) pairs.
type ViewImage = Vec<(InodeId, u32)>;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotImage {
    id: SnapshotId,
    parent_id: Option<SnapshotId>,
    created_at_secs: u64,
    generation_at_creation: u64,
    entries: ViewImage,
}

#[derive(Debug, Serialize, Deserialize)]
struct SubvolumeImage {
    id: SubvolumeId,
    name: String,
    current_generation: u64,
    next_snapshot_id: u64,
    latest_snapshot: Option<SnapshotId>,
    quota: QuotaLimits,
    usage: SubvolumeUsage,
    /// Unique inode instances; views reference these by index so the
    /// restore reproduces the live/snapshot sharing graph exactly.
    instances: Vec<Inode>,
    live: ViewImage,
    snapshots: Vec<SnapshotImage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointBody {
    geometry: Geometry,
    allocator: AllocatorState,
    ledger: LedgerState,
    dedup: DedupState,
    next_subvolume_id: u64,
    subvolumes: Vec<SubvolumeImage>,
}

fn corrupted(reason: impl Into<String>) -> EngineError {
    EngineError::CheckpointCorrupted {
        reason: reason.into(),
    }
}

fn encode_view(view: &InodeTable, index: &HashMap<usize, u32>) -> ViewImage {
    let mut entries: Vec<(InodeId, u32)> = view
        .iter()
        .map(|(&ino, arc)| (ino, index[&(Arc::as_ptr(arc) as usize)]))
        .collect();
    entries.sort_by_key(|(ino, _)| *ino);
    entries
}

fn decode_view(entries: &ViewImage, instances: &[Arc<Inode>]) -> EngineResult<InodeTable> {
    let mut table = InodeTable::new();
    for &(ino, idx) in entries {
        let instance = instances
            .get(idx as usize)
            .ok_or_else(|| corrupted(format!("view references missing instance {}", idx)))?;
        table.insert(ino, instance.clone());
    }
    Ok(table)
}

impl<D: BlockDevice> Filesystem<D> {
    /// Serializes all persisted metadata into a checkpoint image.
    pub fn capture_checkpoint(&self) -> EngineResult<Vec<u8>> {
        let mut subvolumes = Vec::new();
        for (_, state) in self.subvol_states() {
            let meta = state.meta.lock();

            let mut index: HashMap<usize, u32> = HashMap::new();
            let mut instances: Vec<Inode> = Vec::new();
            {
                let mut record = |view: &InodeTable| {
                    for arc in view.values() {
                        let key = Arc::as_ptr(arc) as usize;
                        if !index.contains_key(&key) {
                            index.insert(key, instances.len() as u32);
                            instances.push((**arc).clone());
                        }
                    }
                };
                record(&meta.live);
                for snapshot in meta.snapshots.values() {
                    record(&snapshot.root);
                }
            }

            subvolumes.push(SubvolumeImage {
                id: meta.id,
                name: meta.name.clone(),
                current_generation: meta.current_generation,
                next_snapshot_id: meta.next_snapshot_id,
                latest_snapshot: meta.latest_snapshot,
                quota: meta.quota,
                usage: meta.usage,
                live: encode_view(&meta.live, &index),
                snapshots: meta
                    .snapshots
                    .values()
                    .map(|s| SnapshotImage {
                        id: s.id,
                        parent_id: s.parent_id,
                        created_at_secs: s.created_at_secs,
                        generation_at_creation: s.generation_at_creation,
                        entries: encode_view(&s.root, &index),
                    })
                    .collect(),
                instances,
            });
        }

        let body = CheckpointBody {
            geometry: self.geometry,
            allocator: self.allocator.state(),
            ledger: self.ledger.state(),
            dedup: self.dedup.state(),
            next_subvolume_id: self
                .next_subvolume_id
                .load(std::sync::atomic::Ordering::Relaxed),
            subvolumes,
        };
        let body_bytes =
            bincode::serialize(&body).map_err(|e| corrupted(format!("encode body: {}", e)))?;
        let envelope = CheckpointEnvelope {
            magic: CHECKPOINT_MAGIC,
            version: CHECKPOINT_VERSION,
            checksum: checksum::compute(ChecksumAlgorithm::Crc32c, &body_bytes).value as u32,
            body: body_bytes,
        };
        info!(subvolumes = body.subvolumes.len(), "captured checkpoint");
        bincode::serialize(&envelope).map_err(|e| corrupted(format!("encode envelope: {}", e)))
    }

    /// Rebuilds a filesystem instance from a checkpoint image over the given
    /// device. The device geometry must match the one recorded at capture.
    pub fn restore_checkpoint(device: D, image: &[u8], config: EngineConfig) -> EngineResult<Self> {
        let envelope: CheckpointEnvelope =
            bincode::deserialize(image).map_err(|e| corrupted(format!("decode envelope: {}", e)))?;
        if envelope.magic != CHECKPOINT_MAGIC {
            return Err(corrupted(format!("bad magic {:#010x}", envelope.magic)));
        }
        if envelope.version != CHECKPOINT_VERSION {
            return Err(corrupted(format!("unsupported version {}", envelope.version)));
        }
        let body_sum = checksum::compute(ChecksumAlgorithm::Crc32c, &envelope.body).value as u32;
        if body_sum != envelope.checksum {
            return Err(corrupted("body checksum mismatch"));
        }
        let body: CheckpointBody = bincode::deserialize(&envelope.body)
            .map_err(|e| corrupted(format!("decode body: {}", e)))?;

        let device = Arc::new(device);
        let geometry = device.geometry();
        if geometry != body.geometry {
            return Err(corrupted("device geometry does not match checkpoint"));
        }

        let allocator = Arc::new(BlockAllocator::from_state(body.allocator));
        let dedup = Arc::new(DedupIndex::from_state(body.dedup));
        dedup.set_enabled(config.dedup.enabled);
        let ledger = Arc::new(RefLedger::from_state(
            body.ledger,
            allocator.clone(),
            dedup.clone(),
        ));
        let counters = Arc::new(EngineCounters::default());
        let cow = CowEngine::new(
            device.clone(),
            allocator.clone(),
            dedup.clone(),
            ledger.clone(),
            counters.clone(),
            config.clone(),
        );

        let mut subvolumes = HashMap::new();
        for sv in body.subvolumes {
            let instances: Vec<Arc<Inode>> = sv.instances.into_iter().map(Arc::new).collect();
            let mut subvolume = Subvolume::new(sv.id, sv.name);
            subvolume.live = Arc::new(decode_view(&sv.live, &instances)?);
            subvolume.current_generation = sv.current_generation;
            subvolume.next_snapshot_id = sv.next_snapshot_id;
            subvolume.latest_snapshot = sv.latest_snapshot;
            subvolume.quota = sv.quota;
            subvolume.usage = sv.usage;
            for snap in sv.snapshots {
                subvolume.snapshots.insert(
                    snap.id,
                    Snapshot {
                        id: snap.id,
                        parent_id: snap.parent_id,
                        created_at_secs: snap.created_at_secs,
                        generation_at_creation: snap.generation_at_creation,
                        root: Arc::new(decode_view(&snap.entries, &instances)?),
                    },
                );
            }
            subvolumes.insert(sv.id, Arc::new(SubvolState::new(subvolume)));
        }

        info!(subvolumes = subvolumes.len(), "restored checkpoint");
        Ok(Self {
            instance_id: uuid::Uuid::new_v4(),
            config,
            device,
            geometry,
            allocator,
            dedup,
            ledger,
            counters,
            cow,
            subvolumes: parking_lot::RwLock::new(subvolumes),
            next_subvolume_id: std::sync::atomic::AtomicU64::new(body.next_subvolume_id),
        })
    }
}
