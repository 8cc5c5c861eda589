//! Subvolumes: independently quota-managed namespaces over one shared pool.
//!
//! A subvolume owns a live inode table and a snapshot lineage. The live
//! table and every snapshot hold `Arc` handles into the same inode objects;
//! sharing is broken lazily, one inode at a time, by the first write that
//! touches a shared inode. Breaking the share deep-clones the inode and
//! acquires one additional ledger reference per extent, which is what keeps
//! `refcount == number of owning inode instances` true at all times without
//! an O(n) walk at snapshot creation.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use verdefs_storage::InodeId;

use crate::error::{EngineError, EngineResult};
use crate::inode::Inode;
use crate::ledger::RefLedger;
use crate::snapshot::{Snapshot, SnapshotId};

/// The inode table shared between a subvolume's live view and its snapshots.
pub type InodeTable = HashMap<InodeId, Arc<Inode>>;

/// Unique identifier for a subvolume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubvolumeId(u64);

impl SubvolumeId {
    /// Creates a new SubvolumeId from a raw u64 value.
    pub fn new(id: u64) -> Self {
        SubvolumeId(id)
    }

    /// Returns the raw u64 value of this subvolume ID.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubvolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hard quota limits for a subvolume. `u64::MAX` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    /// Maximum logical bytes across the live tree.
    pub bytes: u64,
    /// Maximum live inodes.
    pub inodes: u64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            bytes: u64::MAX,
            inodes: u64::MAX,
        }
    }
}

/// Current usage of a subvolume's live tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubvolumeUsage {
    /// Logical bytes across live inodes.
    pub used_bytes: u64,
    /// Live inode count.
    pub used_inodes: u64,
}

/// A subvolume: live inode table, snapshot lineage, quota, and the COW
/// generation counter that gates in-place mutation.
pub struct Subvolume {
    /// Subvolume identity.
    pub id: SubvolumeId,
    /// Human-readable name.
    pub name: String,
    pub(crate) live: Arc<InodeTable>,
    pub(crate) snapshots: BTreeMap<SnapshotId, Snapshot>,
    pub(crate) current_generation: u64,
    pub(crate) next_snapshot_id: u64,
    pub(crate) latest_snapshot: Option<SnapshotId>,
    pub(crate) quota: QuotaLimits,
    pub(crate) usage: SubvolumeUsage,
}

impl Subvolume {
    /// Creates an empty subvolume at generation 1.
    pub fn new(id: SubvolumeId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            live: Arc::new(InodeTable::new()),
            snapshots: BTreeMap::new(),
            current_generation: 1,
            next_snapshot_id: 1,
            latest_snapshot: None,
            quota: QuotaLimits::default(),
            usage: SubvolumeUsage::default(),
        }
    }

    /// The COW generation stamped on new writes.
    pub fn generation(&self) -> u64 {
        self.current_generation
    }

    /// Current quota limits.
    pub fn quota(&self) -> QuotaLimits {
        self.quota
    }

    /// Replaces the quota limits. Existing usage above the new limits is not
    /// reclaimed; it only blocks further growth.
    pub fn set_quota(&mut self, quota: QuotaLimits) {
        self.quota = quota;
    }

    /// Current usage of the live tree.
    pub fn usage(&self) -> SubvolumeUsage {
        self.usage
    }

    /// Shared handle to the live tree, for lock-free reads.
    pub fn live(&self) -> Arc<InodeTable> {
        self.live.clone()
    }

    /// Fails with `QuotaExceeded` if growing the live tree by `bytes` would
    /// pass the byte quota. Nothing is applied on failure.
    pub fn admit_bytes(&self, bytes: u64) -> EngineResult<()> {
        if self.usage.used_bytes.saturating_add(bytes) > self.quota.bytes {
            return Err(EngineError::QuotaExceeded {
                subvolume: self.id,
                resource: "bytes",
            });
        }
        Ok(())
    }

    /// Fails with `QuotaExceeded` if creating one more inode would pass the
    /// inode quota.
    pub fn admit_inode(&self) -> EngineResult<()> {
        if self.usage.used_inodes.saturating_add(1) > self.quota.inodes {
            return Err(EngineError::QuotaExceeded {
                subvolume: self.id,
                resource: "inodes",
            });
        }
        Ok(())
    }

    /// Looks up an inode in the live tree.
    pub fn get_inode(&self, ino: InodeId) -> EngineResult<&Arc<Inode>> {
        self.live.get(&ino).ok_or(EngineError::InodeNotFound(ino))
    }

    /// Inserts a freshly created inode into the live tree.
    pub(crate) fn insert_inode(&mut self, inode: Inode) {
        let ino = inode.ino;
        Arc::make_mut(&mut self.live).insert(ino, Arc::new(inode));
        self.usage.used_inodes += 1;
    }

    /// Mutable access to a live inode, breaking COW sharing if a snapshot
    /// still holds this instance. The fork deep-clones the inode, stamps the
    /// current generation, and acquires one additional reference per extent.
    pub(crate) fn inode_mut(
        &mut self,
        ino: InodeId,
        ledger: &RefLedger,
    ) -> EngineResult<&mut Inode> {
        let generation = self.current_generation;
        let live = Arc::make_mut(&mut self.live);
        let slot = live.get_mut(&ino).ok_or(EngineError::InodeNotFound(ino))?;
        if Arc::strong_count(slot) > 1 {
            let mut forked = (**slot).clone();
            for r in forked.extents.refs() {
                ledger.acquire(r.block_id)?;
            }
            forked.generation = generation;
            debug!(ino = ino.as_u64(), generation, "forked shared inode");
            *slot = Arc::new(forked);
        }
        Ok(Arc::make_mut(slot))
    }

    /// Removes an inode from the live tree, returning its handle.
    pub(crate) fn take_inode(&mut self, ino: InodeId) -> EngineResult<Arc<Inode>> {
        let live = Arc::make_mut(&mut self.live);
        let arc = live.remove(&ino).ok_or(EngineError::InodeNotFound(ino))?;
        self.usage.used_inodes = self.usage.used_inodes.saturating_sub(1);
        Ok(arc)
    }

    /// True if any view of this subvolume (live or snapshot) still maps the
    /// inode id. Gate for returning the id to the allocator.
    pub(crate) fn ino_referenced(&self, ino: InodeId) -> bool {
        self.live.contains_key(&ino)
            || self.snapshots.values().any(|s| s.root.contains_key(&ino))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_subvolume() {
        let sv = Subvolume::new(SubvolumeId::new(1), "default");
        assert_eq!(sv.generation(), 1);
        assert_eq!(sv.usage().used_inodes, 0);
        assert!(sv.snapshots.is_empty());
    }

    #[test]
    fn test_quota_admission_bytes() {
        let mut sv = Subvolume::new(SubvolumeId::new(1), "q");
        sv.set_quota(QuotaLimits {
            bytes: 1000,
            inodes: 10,
        });
        assert!(sv.admit_bytes(1000).is_ok());
        sv.usage.used_bytes = 600;
        assert!(sv.admit_bytes(400).is_ok());
        assert!(matches!(
            sv.admit_bytes(401),
            Err(EngineError::QuotaExceeded {
                resource: "bytes",
                ..
            })
        ));
    }

    #[test]
    fn test_quota_admission_inodes() {
        let mut sv = Subvolume::new(SubvolumeId::new(1), "q");
        sv.set_quota(QuotaLimits {
            bytes: u64::MAX,
            inodes: 1,
        });
        assert!(sv.admit_inode().is_ok());
        sv.usage.used_inodes = 1;
        assert!(matches!(
            sv.admit_inode(),
            Err(EngineError::QuotaExceeded {
                resource: "inodes",
                ..
            })
        ));
    }

    #[test]
    fn test_unlimited_by_default() {
        let sv = Subvolume::new(SubvolumeId::new(1), "free");
        assert!(sv.admit_bytes(u64::MAX / 2).is_ok());
        assert!(sv.admit_inode().is_ok());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", SubvolumeId::new(9)), "9");
    }
}
