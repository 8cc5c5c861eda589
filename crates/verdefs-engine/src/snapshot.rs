//! Snapshot lifecycle: create, list, delete, rollback.
//!
//! A snapshot is a frozen handle to the subvolume's inode table plus the COW
//! generation boundary recorded at creation. Creation copies no blocks and
//! walks no metadata: it clones the table handle and bumps the generation so
//! every later write sees a generation mismatch and is forced through the
//! fork/dedup path instead of mutating shared blocks in place.
//!
//! Deletion and rollback settle references structurally: an inode instance
//! uniquely owned by the dropped view releases its extents (cascading into
//! block frees), while instances still shared with other views are simply
//! dropped.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use verdefs_storage::BlockAllocator;

use crate::error::{EngineError, EngineResult};
use crate::ledger::RefLedger;
use crate::subvolume::{InodeTable, Subvolume};

/// Unique identifier for a snapshot within its subvolume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotId(pub u64);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SnapshotId({})", self.0)
    }
}

/// An immutable point-in-time view of a subvolume.
pub struct Snapshot {
    /// Snapshot identity.
    pub id: SnapshotId,
    /// Parent in the snapshot lineage, if any.
    pub parent_id: Option<SnapshotId>,
    /// Creation timestamp (seconds since epoch).
    pub created_at_secs: u64,
    /// The subvolume's COW generation when this snapshot was taken. Blocks
    /// written at or before this generation are visible in the snapshot.
    pub generation_at_creation: u64,
    /// Frozen inode table.
    pub(crate) root: Arc<InodeTable>,
}

impl Snapshot {
    /// Shared handle to the frozen inode table, for reads.
    pub fn root(&self) -> Arc<InodeTable> {
        self.root.clone()
    }
}

/// Serializable description of a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Snapshot identity.
    pub id: SnapshotId,
    /// Parent in the lineage, if any.
    pub parent_id: Option<SnapshotId>,
    /// Creation timestamp (seconds since epoch).
    pub created_at_secs: u64,
    /// Generation boundary recorded at creation.
    pub generation_at_creation: u64,
    /// Number of inodes visible in the snapshot.
    pub inode_count: u64,
}

impl Subvolume {
    /// Creates a snapshot of the live tree. O(1): clones the table handle,
    /// records the generation boundary, and advances the live generation.
    pub fn create_snapshot(&mut self, now_secs: u64) -> SnapshotId {
        let id = SnapshotId(self.next_snapshot_id);
        self.next_snapshot_id += 1;

        let snapshot = Snapshot {
            id,
            parent_id: self.latest_snapshot,
            created_at_secs: now_secs,
            generation_at_creation: self.current_generation,
            root: self.live.clone(),
        };
        self.current_generation += 1;
        self.latest_snapshot = Some(id);
        info!(
            subvolume = self.id.as_u64(),
            snapshot = id.0,
            generation = snapshot.generation_at_creation,
            "created snapshot"
        );
        self.snapshots.insert(id, snapshot);
        id
    }

    /// Looks up a snapshot.
    pub fn snapshot(&self, id: SnapshotId) -> EngineResult<&Snapshot> {
        self.snapshots
            .get(&id)
            .ok_or(EngineError::SnapshotNotFound(id))
    }

    /// Lists snapshots in id order.
    pub fn list_snapshots(&self) -> Vec<SnapshotInfo> {
        self.snapshots
            .values()
            .map(|s| SnapshotInfo {
                id: s.id,
                parent_id: s.parent_id,
                created_at_secs: s.created_at_secs,
                generation_at_creation: s.generation_at_creation,
                inode_count: s.root.len() as u64,
            })
            .collect()
    }

    /// Deletes a snapshot: re-parents its children to its own parent (never
    /// orphaning them), then releases every reference the dropped view
    /// uniquely owned, freeing now-unreferenced blocks and inode ids.
    pub fn delete_snapshot(
        &mut self,
        id: SnapshotId,
        ledger: &RefLedger,
        allocator: &BlockAllocator,
    ) -> EngineResult<()> {
        let snapshot = self
            .snapshots
            .remove(&id)
            .ok_or(EngineError::SnapshotNotFound(id))?;

        for child in self.snapshots.values_mut() {
            if child.parent_id == Some(id) {
                child.parent_id = snapshot.parent_id;
            }
        }
        if self.latest_snapshot == Some(id) {
            self.latest_snapshot = snapshot.parent_id;
        }

        debug!(subvolume = self.id.as_u64(), snapshot = id.0, "deleting snapshot");
        self.release_view(snapshot.root, ledger, allocator)
    }

    /// Rolls the live tree back to a snapshot, then reconciles: every
    /// reference reachable only from the old live tree is released. Rolling
    /// back twice to the same snapshot is idempotent.
    pub fn rollback(
        &mut self,
        id: SnapshotId,
        ledger: &RefLedger,
        allocator: &BlockAllocator,
    ) -> EngineResult<()> {
        let root = self.snapshot(id)?.root.clone();
        let old_live = std::mem::replace(&mut self.live, root);
        self.current_generation += 1;

        self.usage.used_inodes = self.live.len() as u64;
        self.usage.used_bytes = self.live.values().map(|i| i.size).sum();

        info!(
            subvolume = self.id.as_u64(),
            snapshot = id.0,
            generation = self.current_generation,
            "rolled back to snapshot"
        );
        self.release_view(old_live, ledger, allocator)
    }

    /// Releases whatever a dropped view uniquely owned. A table still shared
    /// with another view owns nothing exclusively; within an exclusively
    /// owned table, each inode instance is released only if no other view
    /// holds the same instance.
    pub(crate) fn release_view(
        &mut self,
        view: Arc<InodeTable>,
        ledger: &RefLedger,
        allocator: &BlockAllocator,
    ) -> EngineResult<()> {
        let table = match Arc::try_unwrap(view) {
            Ok(table) => table,
            Err(_) => return Ok(()),
        };
        for (ino, slot) in table {
            if let Ok(inode) = Arc::try_unwrap(slot) {
                for r in inode.extents.refs() {
                    ledger.release(r.block_id)?;
                }
                if !self.ino_referenced(ino) {
                    allocator.free_inode(ino)?;
                    debug!(ino = ino.as_u64(), "freed inode id");
                }
            }
        }
        Ok(())
    }
}
