//! The filesystem instance handle.
//!
//! An explicit handle threaded through every call — there is no process-wide
//! state, so multiple instances can be mounted side by side and tests build
//! throwaway instances freely. This is the surface the virtual-filesystem
//! collaborator drives: read/write/truncate, snapshot lifecycle, quotas, and
//! statistics.
//!
//! Lock domains, in acquisition order: allocation, dedup index, per-inode
//! write serialization, subvolume metadata. The allocator and dedup/ledger
//! mutexes are leaf locks (acquired and released within a single call), so
//! the write path may call into them while holding an inode guard without
//! inverting the hierarchy. Reads never take the inode guard: they clone the
//! subvolume's table handle and walk a stable tree lock-free.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use verdefs_reduce::{DedupIndex, DedupStats};
use verdefs_storage::{
    AllocatorConfig, AllocatorStats, BlockAllocator, BlockDevice, BlockId, Geometry, InodeId,
};

use crate::cow::{CowEngine, EngineConfig};
use crate::error::{EngineError, EngineResult};
use crate::inode::Inode;
use crate::ledger::RefLedger;
use crate::snapshot::{SnapshotId, SnapshotInfo};
use crate::stats::{EngineCounters, EngineStats};
use crate::subvolume::{QuotaLimits, Subvolume, SubvolumeId, SubvolumeUsage};

/// Seconds since the Unix epoch, for inode timestamps.
pub(crate) fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Per-subvolume runtime state: metadata under its own mutex, plus the
/// per-inode write serialization table.
pub(crate) struct SubvolState {
    pub(crate) meta: Mutex<Subvolume>,
    pub(crate) write_locks: DashMap<InodeId, Arc<Mutex<()>>>,
}

impl SubvolState {
    pub(crate) fn new(subvolume: Subvolume) -> Self {
        Self {
            meta: Mutex::new(subvolume),
            write_locks: DashMap::new(),
        }
    }
}

/// A mounted filesystem instance.
pub struct Filesystem<D: BlockDevice> {
    pub(crate) instance_id: Uuid,
    pub(crate) config: EngineConfig,
    pub(crate) device: Arc<D>,
    pub(crate) geometry: Geometry,
    pub(crate) allocator: Arc<BlockAllocator>,
    pub(crate) dedup: Arc<DedupIndex>,
    pub(crate) ledger: Arc<RefLedger>,
    pub(crate) counters: Arc<EngineCounters>,
    pub(crate) cow: CowEngine<D>,
    pub(crate) subvolumes: RwLock<HashMap<SubvolumeId, Arc<SubvolState>>>,
    pub(crate) next_subvolume_id: AtomicU64,
}

impl<D: BlockDevice> Filesystem<D> {
    /// Formats a new filesystem over the given device.
    pub fn format(device: D, config: EngineConfig) -> EngineResult<Self> {
        let device = Arc::new(device);
        let geometry = device.geometry();
        let allocator = Arc::new(BlockAllocator::new(AllocatorConfig {
            total_blocks: geometry.total_blocks,
            total_inodes: geometry.total_inodes,
        })?);
        let dedup = Arc::new(DedupIndex::new(config.dedup.clone()));
        let ledger = Arc::new(RefLedger::new(allocator.clone(), dedup.clone()));
        let counters = Arc::new(EngineCounters::default());
        let cow = CowEngine::new(
            device.clone(),
            allocator.clone(),
            dedup.clone(),
            ledger.clone(),
            counters.clone(),
            config.clone(),
        );
        let instance_id = Uuid::new_v4();
        info!(
            %instance_id,
            block_size = geometry.block_size,
            total_blocks = geometry.total_blocks,
            total_inodes = geometry.total_inodes,
            "formatted filesystem"
        );
        Ok(Self {
            instance_id,
            config,
            device,
            geometry,
            allocator,
            dedup,
            ledger,
            counters,
            cow,
            subvolumes: RwLock::new(HashMap::new()),
            next_subvolume_id: AtomicU64::new(1),
        })
    }

    /// Unique id of this mounted instance.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Creates an empty subvolume.
    pub fn create_subvolume(&self, name: impl Into<String>) -> SubvolumeId {
        let id = SubvolumeId::new(self.next_subvolume_id.fetch_add(1, Ordering::Relaxed));
        let subvolume = Subvolume::new(id, name);
        info!(subvolume = id.as_u64(), "created subvolume");
        self.subvolumes
            .write()
            .insert(id, Arc::new(SubvolState::new(subvolume)));
        id
    }

    fn subvol_state(&self, id: SubvolumeId) -> EngineResult<Arc<SubvolState>> {
        self.subvolumes
            .read()
            .get(&id)
            .cloned()
            .ok_or(EngineError::SubvolumeNotFound(id))
    }

    fn write_lock(&self, state: &SubvolState, ino: InodeId) -> Arc<Mutex<()>> {
        state.write_locks.entry(ino).or_default().clone()
    }

    /// Creates a regular file in the subvolume, admitting it against the
    /// inode quota first.
    pub fn create_file(
        &self,
        subvol: SubvolumeId,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> EngineResult<InodeId> {
        let state = self.subvol_state(subvol)?;
        let mut meta = state.meta.lock();
        meta.admit_inode()?;
        let ino = self.allocator.allocate_inode()?;
        let inode = Inode::new_file(
            ino,
            mode,
            uid,
            gid,
            self.config.compression,
            self.config.checksum,
            meta.generation(),
            now_secs(),
        );
        meta.insert_inode(inode);
        debug!(subvolume = subvol.as_u64(), ino = ino.as_u64(), "created file");
        Ok(ino)
    }

    /// Writes `data` at `offset`, returning the number of bytes written.
    ///
    /// Admission, staging, and commit are distinct phases: quota is reserved
    /// up front (and returned on failure or short write), staging works
    /// against an immutable tree handle, and only commit touches the live
    /// tree. A failure before commit leaves every structure untouched.
    pub fn write(
        &self,
        subvol: SubvolumeId,
        ino: InodeId,
        offset: u64,
        data: &[u8],
    ) -> EngineResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let state = self.subvol_state(subvol)?;
        let wlock = self.write_lock(&state, ino);
        let _write_guard = wlock.lock();

        let (tree, generation, size_before, reserved) = {
            let mut meta = state.meta.lock();
            let size_before = meta.get_inode(ino)?.size;
            let growth = (offset + data.len() as u64).saturating_sub(size_before);
            meta.admit_bytes(growth)?;
            meta.usage.used_bytes += growth;
            (meta.live(), meta.generation(), size_before, growth)
        };

        let plan = match self.cow.stage_write(&tree, ino, offset, data, generation) {
            Ok(plan) => plan,
            Err(e) => {
                let mut meta = state.meta.lock();
                meta.usage.used_bytes = meta.usage.used_bytes.saturating_sub(reserved);
                return Err(e);
            }
        };

        let mut meta = state.meta.lock();
        match self.cow.commit_write(&mut meta, ino, plan, now_secs()) {
            Ok(written) => {
                let actual_growth =
                    (offset + written as u64).saturating_sub(size_before).min(reserved);
                meta.usage.used_bytes = meta
                    .usage
                    .used_bytes
                    .saturating_sub(reserved - actual_growth);
                Ok(written)
            }
            Err(e) => {
                meta.usage.used_bytes = meta.usage.used_bytes.saturating_sub(reserved);
                Err(e)
            }
        }
    }

    /// Reads up to `len` bytes at `offset` from the live view. Holes read as
    /// zeroes; the result is truncated at end of file.
    pub fn read(
        &self,
        subvol: SubvolumeId,
        ino: InodeId,
        offset: u64,
        len: usize,
    ) -> EngineResult<Vec<u8>> {
        let state = self.subvol_state(subvol)?;
        let tree = state.meta.lock().live();
        self.cow.read_tree(&tree, ino, offset, len)
    }

    /// Reads through a snapshot's frozen view.
    pub fn read_snapshot(
        &self,
        subvol: SubvolumeId,
        snapshot: SnapshotId,
        ino: InodeId,
        offset: u64,
        len: usize,
    ) -> EngineResult<Vec<u8>> {
        let state = self.subvol_state(subvol)?;
        let tree = {
            let meta = state.meta.lock();
            meta.snapshot(snapshot)?.root()
        };
        self.cow.read_tree(&tree, ino, offset, len)
    }

    /// Truncates a file. Shrinking releases every reference wholly beyond
    /// the new size; growing just extends the sparse tail.
    pub fn truncate(&self, subvol: SubvolumeId, ino: InodeId, new_size: u64) -> EngineResult<()> {
        let state = self.subvol_state(subvol)?;
        let wlock = self.write_lock(&state, ino);
        let _write_guard = wlock.lock();

        let mut meta = state.meta.lock();
        let size_before = meta.get_inode(ino)?.size;
        if new_size > size_before {
            meta.admit_bytes(new_size - size_before)?;
        }
        self.cow.truncate(&mut meta, ino, new_size, now_secs())?;
        if new_size >= size_before {
            meta.usage.used_bytes += new_size - size_before;
        } else {
            meta.usage.used_bytes = meta
                .usage
                .used_bytes
                .saturating_sub(size_before - new_size);
        }
        Ok(())
    }

    /// Returns a copy of the inode's current attributes from the live view.
    pub fn inode(&self, subvol: SubvolumeId, ino: InodeId) -> EngineResult<Inode> {
        let state = self.subvol_state(subvol)?;
        let meta = state.meta.lock();
        Ok((**meta.get_inode(ino)?).clone())
    }

    /// Adds one link to the inode; driven by directory-entry add
    /// notifications from the VFS collaborator.
    pub fn link(&self, subvol: SubvolumeId, ino: InodeId) -> EngineResult<()> {
        let state = self.subvol_state(subvol)?;
        let wlock = self.write_lock(&state, ino);
        let _write_guard = wlock.lock();
        let mut meta = state.meta.lock();
        let inode = meta.inode_mut(ino, &self.ledger)?;
        inode.nlink += 1;
        inode.ctime_secs = now_secs();
        Ok(())
    }

    /// Drops one link to the inode. At zero links the inode leaves the live
    /// tree; its references are released unless a snapshot still holds the
    /// instance, and its id returns to the allocator once no view maps it.
    pub fn unlink(&self, subvol: SubvolumeId, ino: InodeId) -> EngineResult<()> {
        let state = self.subvol_state(subvol)?;
        let wlock = self.write_lock(&state, ino);
        let _write_guard = wlock.lock();

        let mut meta = state.meta.lock();
        let nlink = meta.get_inode(ino)?.nlink;
        if nlink > 1 {
            let inode = meta.inode_mut(ino, &self.ledger)?;
            inode.nlink -= 1;
            inode.ctime_secs = now_secs();
            return Ok(());
        }

        let arc = meta.take_inode(ino)?;
        meta.usage.used_bytes = meta.usage.used_bytes.saturating_sub(arc.size);
        if let Ok(inode) = Arc::try_unwrap(arc) {
            for r in inode.extents.refs() {
                self.ledger.release(r.block_id)?;
            }
            if !meta.ino_referenced(ino) {
                self.allocator.free_inode(ino)?;
            }
        }
        state.write_locks.remove(&ino);
        debug!(subvolume = subvol.as_u64(), ino = ino.as_u64(), "unlinked");
        Ok(())
    }

    /// Creates a snapshot of the subvolume. O(1): no metadata walk, no data
    /// copy, and no waiting on in-flight writes to other inodes.
    pub fn create_snapshot(&self, subvol: SubvolumeId) -> EngineResult<SnapshotId> {
        let state = self.subvol_state(subvol)?;
        let mut meta = state.meta.lock();
        Ok(meta.create_snapshot(now_secs()))
    }

    /// Deletes a snapshot, re-parenting its children and freeing whatever it
    /// exclusively pinned.
    pub fn delete_snapshot(&self, subvol: SubvolumeId, id: SnapshotId) -> EngineResult<()> {
        let state = self.subvol_state(subvol)?;
        let mut meta = state.meta.lock();
        meta.delete_snapshot(id, &self.ledger, &self.allocator)
    }

    /// Rolls the subvolume's live tree back to a snapshot.
    pub fn rollback_snapshot(&self, subvol: SubvolumeId, id: SnapshotId) -> EngineResult<()> {
        let state = self.subvol_state(subvol)?;
        let mut meta = state.meta.lock();
        meta.rollback(id, &self.ledger, &self.allocator)
    }

    /// Lists the subvolume's snapshots in id order.
    pub fn list_snapshots(&self, subvol: SubvolumeId) -> EngineResult<Vec<SnapshotInfo>> {
        let state = self.subvol_state(subvol)?;
        let meta = state.meta.lock();
        Ok(meta.list_snapshots())
    }

    /// Replaces the subvolume's quota limits.
    pub fn set_quota(&self, subvol: SubvolumeId, quota: QuotaLimits) -> EngineResult<()> {
        let state = self.subvol_state(subvol)?;
        state.meta.lock().set_quota(quota);
        Ok(())
    }

    /// Current quota limits of the subvolume.
    pub fn get_quota(&self, subvol: SubvolumeId) -> EngineResult<QuotaLimits> {
        Ok(self.subvol_state(subvol)?.meta.lock().quota())
    }

    /// Current usage of the subvolume's live tree.
    pub fn get_usage(&self, subvol: SubvolumeId) -> EngineResult<SubvolumeUsage> {
        Ok(self.subvol_state(subvol)?.meta.lock().usage())
    }

    /// Aggregate engine statistics.
    pub fn stats(&self) -> EngineStats {
        let astats = self.allocator.stats();
        let (compression_ratio, dedup_ratio) = self.counters.ratios();
        EngineStats {
            total_blocks: astats.total_blocks,
            free_blocks: astats.free_blocks,
            compressed_blocks: self.counters.compressed_blocks.load(Ordering::Relaxed),
            deduplicated_blocks: self.ledger.shared_blocks(),
            cow_blocks: self.counters.cow_forks.load(Ordering::Relaxed),
            in_place_writes: self.counters.in_place_writes.load(Ordering::Relaxed),
            dedup_hits: self.counters.dedup_hits.load(Ordering::Relaxed),
            compression_ratio,
            dedup_ratio,
        }
    }

    /// Allocator statistics.
    pub fn allocator_stats(&self) -> AllocatorStats {
        self.allocator.stats()
    }

    /// Dedup index statistics.
    pub fn dedup_stats(&self) -> DedupStats {
        self.dedup.stats()
    }

    /// Enables or disables dedup lookups for new writes. Existing shared
    /// blocks are unaffected.
    pub fn set_dedup_enabled(&self, enabled: bool) {
        self.dedup.set_enabled(enabled);
    }

    /// Current refcount of a physical block, for tests and repair tooling.
    pub fn block_refcount(&self, block: BlockId) -> u64 {
        self.ledger.refcount(block)
    }

    /// Resolves which physical block backs a byte offset in the live view or
    /// a snapshot view. `None` for holes.
    pub fn resolve_block(
        &self,
        subvol: SubvolumeId,
        snapshot: Option<SnapshotId>,
        ino: InodeId,
        offset: u64,
    ) -> EngineResult<Option<BlockId>> {
        let state = self.subvol_state(subvol)?;
        let tree = {
            let meta = state.meta.lock();
            match snapshot {
                Some(id) => meta.snapshot(id)?.root(),
                None => meta.live(),
            }
        };
        let inode = tree.get(&ino).ok_or(EngineError::InodeNotFound(ino))?;
        Ok(inode
            .extents
            .resolve(offset, 1)
            .first()
            .map(|p| p.block_ref.block_id))
    }

    /// Flushes the block device.
    pub fn flush(&self) -> EngineResult<()> {
        Ok(self.device.flush()?)
    }

    pub(crate) fn subvol_states(&self) -> Vec<(SubvolumeId, Arc<SubvolState>)> {
        self.subvolumes
            .read()
            .iter()
            .map(|(&id, state)| (id, state.clone()))
            .collect()
    }
}
