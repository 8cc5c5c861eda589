//! Copy-on-write write path and read path.
//!
//! Every write runs `Resolve → Decide → {InPlace | DedupHit | ForkNew} →
//! Commit`. All fallible work that touches shared state — payload encoding,
//! digests, dedup comparisons, block allocation, and the device writes for
//! forked blocks — happens in the staging phase against an immutable handle
//! to the inode table. Only after staging succeeds does commit mutate the
//! tree, so an allocation failure, an I/O error, or caller cancellation
//! mid-fork leaves the extent tree, the ledger, and the allocator exactly as
//! they were (staged reservations are returned).
//!
//! A write racing snapshot creation linearizes before the snapshot when its
//! in-place store lands in the frozen image; commit re-checks exclusivity and
//! falls back to forking when the race went the other way.

use std::sync::Arc;

use tracing::{debug, warn};

use verdefs_reduce::{
    compress, content_hash, CompressionAlgorithm, ContentHash, DedupConfig, DedupIndex,
};
use verdefs_storage::{
    checksum, BlockAllocator, BlockDevice, BlockId, Checksum, ChecksumAlgorithm, Geometry,
    InodeId, StorageError,
};

use crate::error::{EngineError, EngineResult};
use crate::extent::ExtentRef;
use crate::inode::FileKind;
use crate::ledger::RefLedger;
use crate::stats::EngineCounters;
use crate::subvolume::{InodeTable, Subvolume};

/// Configuration for the COW engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Compression selector applied to new file payloads.
    pub compression: CompressionAlgorithm,
    /// Checksum algorithm stamped on new block references.
    pub checksum: ChecksumAlgorithm,
    /// Whether checksums are verified on every read.
    pub verify_checksums: bool,
    /// Dedup index configuration.
    pub dedup: DedupConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            compression: CompressionAlgorithm::None,
            checksum: ChecksumAlgorithm::Crc32c,
            verify_checksums: true,
            dedup: DedupConfig::default(),
        }
    }
}

/// Per-block-slot decision staged for commit.
enum SlotAction {
    /// The owning reference is exclusive at the current generation: overwrite
    /// the physical block, keep the tree linkage.
    InPlace {
        block: BlockId,
        old_generation: u64,
        stored: Vec<u8>,
        compression: CompressionAlgorithm,
        checksum: Checksum,
        hash: ContentHash,
    },
    /// Identical content already stored: reference it instead of allocating.
    DedupHit {
        block: BlockId,
        stored_len: u32,
        compression: CompressionAlgorithm,
        checksum: Checksum,
    },
    /// A fresh block was allocated and written during staging.
    Fork {
        block: BlockId,
        stored_len: u32,
        compression: CompressionAlgorithm,
        checksum: Checksum,
        hash: ContentHash,
    },
}

struct SlotPlan {
    slot_start: u64,
    new_extent_len: u64,
    write_len: u64,
    action: SlotAction,
}

/// A fully staged write, ready to commit or abort.
pub(crate) struct WritePlan {
    offset: u64,
    generation: u64,
    slots: Vec<SlotPlan>,
    staged_blocks: Vec<BlockId>,
    dedup_acquired: Vec<BlockId>,
}

/// The write-path coordinator: decides in-place vs fork vs dedup, threads
/// new extents into the tree, and settles refcounts through the ledger.
pub struct CowEngine<D: BlockDevice> {
    device: Arc<D>,
    geometry: Geometry,
    allocator: Arc<BlockAllocator>,
    dedup: Arc<DedupIndex>,
    ledger: Arc<RefLedger>,
    counters: Arc<EngineCounters>,
    config: EngineConfig,
}

impl<D: BlockDevice> CowEngine<D> {
    /// Creates a new COW engine over the given collaborators.
    pub fn new(
        device: Arc<D>,
        allocator: Arc<BlockAllocator>,
        dedup: Arc<DedupIndex>,
        ledger: Arc<RefLedger>,
        counters: Arc<EngineCounters>,
        config: EngineConfig,
    ) -> Self {
        let geometry = device.geometry();
        Self {
            device,
            geometry,
            allocator,
            dedup,
            ledger,
            counters,
            config,
        }
    }

    /// Stages a write against an immutable view of the inode table.
    /// On error, every staged reservation has already been returned.
    pub(crate) fn stage_write(
        &self,
        tree: &InodeTable,
        ino: InodeId,
        offset: u64,
        data: &[u8],
        generation: u64,
    ) -> EngineResult<WritePlan> {
        let mut plan = WritePlan {
            offset,
            generation,
            slots: Vec::new(),
            staged_blocks: Vec::new(),
            dedup_acquired: Vec::new(),
        };
        match self.stage_slots(tree, ino, offset, data, generation, &mut plan) {
            Ok(()) => Ok(plan),
            Err(e) => {
                self.abort_stage(plan);
                Err(e)
            }
        }
    }

    fn stage_slots(
        &self,
        tree: &InodeTable,
        ino: InodeId,
        offset: u64,
        data: &[u8],
        generation: u64,
        plan: &mut WritePlan,
    ) -> EngineResult<()> {
        let inode = tree.get(&ino).ok_or(EngineError::InodeNotFound(ino))?;
        if inode.kind != FileKind::RegularFile {
            return Err(EngineError::NotAFile(ino));
        }
        if data.is_empty() {
            return Ok(());
        }
        let bs = self.geometry.block_size as u64;
        let end = offset + data.len() as u64;

        let first_slot = offset / bs;
        let last_slot = (end - 1) / bs;
        for slot in first_slot..=last_slot {
            let slot_start = slot * bs;
            let slot_end = slot_start + bs;
            let wstart = offset.max(slot_start);
            let wend = end.min(slot_end);
            let data_slice = &data[(wstart - offset) as usize..(wend - offset) as usize];

            let pieces = inode.extents.resolve(slot_start, bs);
            let old_end = pieces
                .iter()
                .map(|p| p.logical_offset + p.length)
                .max()
                .unwrap_or(slot_start);
            let payload_end = wend.max(old_end).min(slot_end);
            let payload_len = payload_end - slot_start;

            let mut payload = vec![0u8; payload_len as usize];
            let fully_covered = wstart == slot_start && wend >= payload_end;
            if !fully_covered {
                for p in &pieces {
                    let decoded = self.read_payload(&p.block_ref)?;
                    let src_start = p.payload_offset as usize;
                    let src_end = src_start + p.length as usize;
                    if decoded.len() < src_end {
                        return Err(StorageError::invariant(format!(
                            "payload of {} shorter than extent",
                            p.block_ref.block_id
                        ))
                        .into());
                    }
                    let dst = (p.logical_offset - slot_start) as usize;
                    payload[dst..dst + p.length as usize]
                        .copy_from_slice(&decoded[src_start..src_end]);
                }
            }
            payload[(wstart - slot_start) as usize..(wend - slot_start) as usize]
                .copy_from_slice(data_slice);

            let (stored, compression, sum) =
                self.encode_payload(&payload, inode.compression, inode.checksum)?;
            let hash = content_hash(&stored);

            let exclusive = pieces.len() == 1 && {
                let p = &pieces[0];
                p.extent_start == slot_start
                    && p.payload_offset == 0
                    && p.block_ref.cow_generation == generation
                    && self.ledger.refcount(p.block_ref.block_id) == 1
            };

            let action = if exclusive {
                debug!(ino = ino.as_u64(), slot = slot, "write decision: in-place");
                SlotAction::InPlace {
                    block: pieces[0].block_ref.block_id,
                    old_generation: pieces[0].block_ref.cow_generation,
                    stored,
                    compression,
                    checksum: sum,
                    hash,
                }
            } else if let Some(action) = self.stage_dedup_hit(&hash, &stored, compression, sum, plan)? {
                debug!(ino = ino.as_u64(), slot = slot, "write decision: dedup hit");
                action
            } else {
                let block = self.allocator.allocate_block()?;
                plan.staged_blocks.push(block);
                self.device.write_block(block, &self.pad(&stored))?;
                debug!(
                    ino = ino.as_u64(),
                    slot = slot,
                    block = block.as_u64(),
                    "write decision: fork"
                );
                SlotAction::Fork {
                    block,
                    stored_len: stored.len() as u32,
                    compression,
                    checksum: sum,
                    hash,
                }
            };

            plan.slots.push(SlotPlan {
                slot_start,
                new_extent_len: payload_len,
                write_len: wend - wstart,
                action,
            });
        }
        Ok(())
    }

    /// Attempts a dedup hit for staged content. A digest match alone is never
    /// trusted: the candidate payload is compared byte-for-byte, and the
    /// acquisition re-validates the index entry under the ledger lock. An
    /// unreadable candidate degrades to a miss rather than failing the write.
    fn stage_dedup_hit(
        &self,
        hash: &ContentHash,
        stored: &[u8],
        compression: CompressionAlgorithm,
        sum: Checksum,
        plan: &mut WritePlan,
    ) -> EngineResult<Option<SlotAction>> {
        if !self.dedup.enabled() {
            return Ok(None);
        }
        let Some(entry) = self.dedup.lookup(hash) else {
            return Ok(None);
        };
        if entry.size as usize != stored.len() {
            self.dedup.record_collision();
            return Ok(None);
        }
        let raw = match self.read_raw(entry.block_id) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(block = entry.block_id.as_u64(), error = %e, "dedup candidate unreadable, forking");
                return Ok(None);
            }
        };
        if raw.len() < stored.len() || raw[..stored.len()] != *stored {
            self.dedup.record_collision();
            return Ok(None);
        }
        if self.ledger.acquire_dedup(hash, &entry)?.is_none() {
            return Ok(None);
        }
        plan.dedup_acquired.push(entry.block_id);
        Ok(Some(SlotAction::DedupHit {
            block: entry.block_id,
            stored_len: entry.size,
            compression,
            checksum: sum,
        }))
    }

    /// Returns every staged reservation: allocated blocks go back to the
    /// allocator, dedup acquisitions are released. Used on staging failure
    /// and caller cancellation.
    pub(crate) fn abort_stage(&self, plan: WritePlan) {
        for block in plan.staged_blocks {
            if let Err(e) = self.allocator.free_block(block) {
                warn!(block = block.as_u64(), error = %e, "failed to return staged block");
            }
        }
        for block in plan.dedup_acquired {
            if let Err(e) = self.ledger.release(block) {
                warn!(block = block.as_u64(), error = %e, "failed to release staged dedup ref");
            }
        }
    }

    /// Commits a staged write into the subvolume's live tree. Returns the
    /// number of bytes written; an in-place device failure after earlier
    /// slots already landed surfaces as a short write.
    pub(crate) fn commit_write(
        &self,
        subvol: &mut Subvolume,
        ino: InodeId,
        plan: WritePlan,
        now_secs: u64,
    ) -> EngineResult<usize> {
        let commit_gen = subvol.current_generation;
        let mut written: u64 = 0;
        let mut committed = 0usize;
        let mut failure: Option<EngineError> = None;

        {
            let inode = match subvol.inode_mut(ino, &self.ledger) {
                Ok(inode) => inode,
                Err(e) => {
                    self.release_uncommitted(&plan.slots);
                    return Err(e);
                }
            };
            for slot in &plan.slots {
                let result = match &slot.action {
                    SlotAction::InPlace {
                        block,
                        old_generation,
                        stored,
                        compression,
                        checksum,
                        hash,
                    } => self.commit_in_place(
                        &mut inode.extents,
                        slot,
                        *block,
                        *old_generation,
                        stored,
                        *compression,
                        *checksum,
                        *hash,
                        plan.generation,
                        commit_gen,
                    ),
                    SlotAction::DedupHit {
                        block,
                        stored_len,
                        compression,
                        checksum,
                    } => {
                        let r = ExtentRef {
                            block_id: *block,
                            compression: *compression,
                            checksum: *checksum,
                            stored_len: *stored_len,
                            cow_generation: commit_gen,
                        };
                        let out = self.splice(&mut inode.extents, slot, r);
                        EngineCounters::bump(&self.counters.dedup_hits);
                        out
                    }
                    SlotAction::Fork {
                        block,
                        stored_len,
                        compression,
                        checksum,
                        hash,
                    } => match self.ledger.register(*block) {
                        Ok(()) => {
                            let r = ExtentRef {
                                block_id: *block,
                                compression: *compression,
                                checksum: *checksum,
                                stored_len: *stored_len,
                                cow_generation: commit_gen,
                            };
                            let out = self.splice(&mut inode.extents, slot, r);
                            if out.is_ok() {
                                if self.dedup.enabled() {
                                    self.dedup.insert(*hash, *block, *stored_len);
                                }
                                EngineCounters::bump(&self.counters.cow_forks);
                                EngineCounters::add(
                                    &self.counters.physical_bytes_written,
                                    *stored_len as u64,
                                );
                                if *compression != CompressionAlgorithm::None {
                                    EngineCounters::bump(&self.counters.compressed_blocks);
                                }
                            }
                            out
                        }
                        Err(e) => Err(e.into()),
                    },
                };
                match result {
                    Ok(()) => {
                        written += slot.write_len;
                        committed += 1;
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }

            if written > 0 {
                inode.size = inode.size.max(plan.offset + written);
                inode.touch_modified(now_secs);
                inode.generation = commit_gen;
                EngineCounters::add(&self.counters.logical_bytes_written, written);
            }
        }

        self.release_uncommitted(&plan.slots[committed..]);

        match failure {
            Some(e) if written == 0 => Err(e),
            Some(e) => {
                warn!(ino = ino.as_u64(), error = %e, written, "short write");
                Ok(written as usize)
            }
            None => Ok(written as usize),
        }
    }

    /// Returns reservations held by slots that never committed: staged fork
    /// blocks go back to the allocator, staged dedup acquisitions are
    /// released.
    fn release_uncommitted(&self, slots: &[SlotPlan]) {
        for slot in slots {
            match &slot.action {
                SlotAction::Fork { block, .. } => {
                    if let Err(e) = self.allocator.free_block(*block) {
                        warn!(block = block.as_u64(), error = %e, "failed to return staged block");
                    }
                }
                SlotAction::DedupHit { block, .. } => {
                    if let Err(e) = self.ledger.release(*block) {
                        warn!(block = block.as_u64(), error = %e, "failed to release staged dedup ref");
                    }
                }
                SlotAction::InPlace { .. } => {}
            }
        }
    }

    /// Commits one in-place slot, re-validating exclusivity now that the
    /// subvolume lock is held. If a snapshot or a dedup acquisition raced in
    /// since staging, falls back to forking a fresh block.
    #[allow(clippy::too_many_arguments)]
    fn commit_in_place(
        &self,
        extents: &mut crate::extent::ExtentTree,
        slot: &SlotPlan,
        block: BlockId,
        old_generation: u64,
        stored: &[u8],
        compression: CompressionAlgorithm,
        sum: Checksum,
        hash: ContentHash,
        staged_gen: u64,
        commit_gen: u64,
    ) -> EngineResult<()> {
        self.ledger.invalidate_dedup(block);
        let still_exclusive = commit_gen == staged_gen && self.ledger.refcount(block) == 1;

        if still_exclusive {
            self.device.write_block(block, &self.pad(stored))?;
            let r = ExtentRef {
                block_id: block,
                compression,
                checksum: sum,
                stored_len: stored.len() as u32,
                cow_generation: old_generation,
            };
            if !extents.update_in_place(slot.slot_start, slot.new_extent_len, r) {
                return Err(StorageError::invariant(format!(
                    "in-place extent at {} vanished during commit",
                    slot.slot_start
                ))
                .into());
            }
            if self.dedup.enabled() {
                self.dedup.insert(hash, block, stored.len() as u32);
            }
            EngineCounters::bump(&self.counters.in_place_writes);
            Ok(())
        } else {
            // Lost exclusivity between staging and commit; fork now.
            let new_block = self.allocator.allocate_block()?;
            if let Err(e) = self.device.write_block(new_block, &self.pad(stored)) {
                let _ = self.allocator.free_block(new_block);
                return Err(e.into());
            }
            self.ledger.register(new_block)?;
            let r = ExtentRef {
                block_id: new_block,
                compression,
                checksum: sum,
                stored_len: stored.len() as u32,
                cow_generation: commit_gen,
            };
            self.splice(extents, slot, r)?;
            if self.dedup.enabled() {
                self.dedup.insert(hash, new_block, stored.len() as u32);
            }
            EngineCounters::bump(&self.counters.cow_forks);
            EngineCounters::add(&self.counters.physical_bytes_written, stored.len() as u64);
            Ok(())
        }
    }

    /// Threads a new reference into the tree and settles the displaced ones.
    /// Remnant acquisitions are applied before releases so a block shared
    /// between a displaced entry and its remnants never transits through
    /// refcount zero.
    fn splice(
        &self,
        extents: &mut crate::extent::ExtentTree,
        slot: &SlotPlan,
        r: ExtentRef,
    ) -> EngineResult<()> {
        let outcome = extents.insert_or_replace(slot.slot_start, slot.new_extent_len, r);
        for acquired in &outcome.acquired {
            self.ledger.acquire(acquired.block_id)?;
        }
        for released in &outcome.released {
            self.ledger.release(released.block_id)?;
        }
        Ok(())
    }

    /// Reads a logical range from an inode in the given view. Holes and the
    /// tail beyond EOF read as zeroes / truncate the result.
    pub(crate) fn read_tree(
        &self,
        tree: &InodeTable,
        ino: InodeId,
        offset: u64,
        len: usize,
    ) -> EngineResult<Vec<u8>> {
        let inode = tree.get(&ino).ok_or(EngineError::InodeNotFound(ino))?;
        if inode.kind != FileKind::RegularFile {
            return Err(EngineError::NotAFile(ino));
        }
        if len == 0 || offset >= inode.size {
            return Ok(Vec::new());
        }
        let end = inode.size.min(offset + len as u64);
        let mut out = vec![0u8; (end - offset) as usize];
        for p in inode.extents.resolve(offset, end - offset) {
            let decoded = self.read_payload(&p.block_ref)?;
            let src_start = p.payload_offset as usize;
            let src_end = src_start + p.length as usize;
            if decoded.len() < src_end {
                return Err(StorageError::invariant(format!(
                    "payload of {} shorter than extent",
                    p.block_ref.block_id
                ))
                .into());
            }
            let dst = (p.logical_offset - offset) as usize;
            out[dst..dst + p.length as usize].copy_from_slice(&decoded[src_start..src_end]);
        }
        EngineCounters::bump(&self.counters.reads);
        Ok(out)
    }

    /// Truncates an inode, releasing every reference wholly beyond the new
    /// size. The boundary extent is trimmed in place.
    pub(crate) fn truncate(
        &self,
        subvol: &mut Subvolume,
        ino: InodeId,
        new_size: u64,
        now_secs: u64,
    ) -> EngineResult<()> {
        let inode = subvol.inode_mut(ino, &self.ledger)?;
        if inode.kind != FileKind::RegularFile {
            return Err(EngineError::NotAFile(ino));
        }
        let released = inode.extents.truncate_to(new_size);
        inode.size = new_size;
        inode.touch_modified(now_secs);
        for r in released {
            self.ledger.release(r.block_id)?;
        }
        Ok(())
    }

    /// Decodes one block reference: raw read (with a single retry on a
    /// transient fault), checksum verification, decompression.
    pub(crate) fn read_payload(&self, r: &ExtentRef) -> EngineResult<Vec<u8>> {
        let raw = self.read_raw(r.block_id)?;
        let stored_len = r.stored_len as usize;
        if raw.len() < stored_len {
            return Err(StorageError::invariant(format!(
                "stored length of {} exceeds block size",
                r.block_id
            ))
            .into());
        }
        let stored = &raw[..stored_len];
        if self.config.verify_checksums && r.checksum.algorithm != ChecksumAlgorithm::None {
            let actual = checksum::compute(r.checksum.algorithm, stored);
            if actual.value != r.checksum.value {
                return Err(StorageError::ChecksumMismatch {
                    block_id: r.block_id,
                    expected: r.checksum.value,
                    actual: actual.value,
                }
                .into());
            }
        }
        Ok(verdefs_reduce::decompress(stored, r.compression)?)
    }

    /// Raw block read with a single retry on transient device errors; all
    /// other failures propagate.
    fn read_raw(&self, id: BlockId) -> EngineResult<Vec<u8>> {
        match self.device.read_block(id) {
            Ok(raw) => Ok(raw),
            Err(e) if e.is_transient() => {
                EngineCounters::bump(&self.counters.read_retries);
                warn!(block = id.as_u64(), error = %e, "transient read error, retrying once");
                Ok(self.device.read_block(id)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Compresses a payload with the inode's selector, falling back to raw
    /// storage when compression does not help or would not fit the block.
    fn encode_payload(
        &self,
        payload: &[u8],
        algo: CompressionAlgorithm,
        checksum_algo: ChecksumAlgorithm,
    ) -> EngineResult<(Vec<u8>, CompressionAlgorithm, Checksum)> {
        let bs = self.geometry.block_size as usize;
        let (stored, used) = match algo {
            CompressionAlgorithm::None => (payload.to_vec(), CompressionAlgorithm::None),
            algo => {
                let compressed = compress(payload, algo)?;
                if compressed.len() < payload.len() && compressed.len() <= bs {
                    (compressed, algo)
                } else {
                    (payload.to_vec(), CompressionAlgorithm::None)
                }
            }
        };
        let sum = checksum::compute(checksum_algo, &stored);
        Ok((stored, used, sum))
    }

    /// Zero-pads stored bytes to the device block size.
    fn pad(&self, stored: &[u8]) -> Vec<u8> {
        let mut padded = vec![0u8; self.geometry.block_size as usize];
        padded[..stored.len()].copy_from_slice(stored);
        padded
    }
}
