//! Integrity scrub: checksum sweep plus refcount conservation check.
//!
//! The scrub walks every view of every subvolume (live trees and snapshots),
//! decodes each referenced block, and verifies its checksum. At the same
//! time it enumerates references the way the ledger defines them — one per
//! tree entry per distinct inode instance — and compares the tally against
//! the ledger's counts. Findings are reported, never repaired in place;
//! repair is a separate tool's decision.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use verdefs_storage::{BlockDevice, BlockId, InodeId};

use crate::error::EngineResult;
use crate::fs::Filesystem;
use crate::subvolume::SubvolumeId;

/// A block whose payload failed checksum verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrubChecksumError {
    /// Subvolume owning the reference.
    pub subvolume: SubvolumeId,
    /// Inode owning the reference.
    pub ino: InodeId,
    /// Logical offset of the extent.
    pub logical_offset: u64,
    /// The corrupt block.
    pub block_id: BlockId,
    /// Error text from the failed decode.
    pub error: String,
}

/// A block whose ledger count disagrees with the enumerated references.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RefcountMismatch {
    /// The block in question.
    pub block_id: BlockId,
    /// Count the ledger holds.
    pub ledger_count: u64,
    /// References actually enumerated across all views.
    pub enumerated: u64,
}

/// Outcome of a scrub pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrubReport {
    /// Block references decoded and verified.
    pub blocks_checked: u64,
    /// Stored bytes verified.
    pub bytes_verified: u64,
    /// Checksum failures found.
    pub checksum_errors: Vec<ScrubChecksumError>,
    /// Refcount conservation violations found.
    pub refcount_mismatches: Vec<RefcountMismatch>,
}

impl ScrubReport {
    /// True when the scrub found nothing wrong.
    pub fn is_clean(&self) -> bool {
        self.checksum_errors.is_empty() && self.refcount_mismatches.is_empty()
    }
}

impl<D: BlockDevice> Filesystem<D> {
    /// Runs a full scrub over every view of every subvolume.
    pub fn scrub(&self) -> EngineResult<ScrubReport> {
        let mut report = ScrubReport::default();
        let mut enumerated: HashMap<BlockId, u64> = HashMap::new();
        let mut seen_instances: HashSet<usize> = HashSet::new();

        for (subvol_id, state) in self.subvol_states() {
            let views = {
                let meta = state.meta.lock();
                let mut views = vec![meta.live()];
                views.extend(meta.snapshots.values().map(|s| s.root()));
                views
            };

            for view in views {
                for (ino, inode) in view.iter() {
                    // Each distinct instance counts once, however many views
                    // share it.
                    let instance = std::sync::Arc::as_ptr(inode) as usize;
                    if !seen_instances.insert(instance) {
                        continue;
                    }
                    for (logical_offset, extent) in inode.extents.iter() {
                        *enumerated.entry(extent.block_ref.block_id).or_insert(0) += 1;
                        report.blocks_checked += 1;
                        report.bytes_verified += extent.block_ref.stored_len as u64;
                        if let Err(e) = self.cow.read_payload(&extent.block_ref) {
                            warn!(
                                subvolume = subvol_id.as_u64(),
                                ino = ino.as_u64(),
                                block = extent.block_ref.block_id.as_u64(),
                                error = %e,
                                "scrub: unreadable block reference"
                            );
                            report.checksum_errors.push(ScrubChecksumError {
                                subvolume: subvol_id,
                                ino: *ino,
                                logical_offset,
                                block_id: extent.block_ref.block_id,
                                error: e.to_string(),
                            });
                        }
                    }
                }
            }
        }

        let ledger_counts: HashMap<BlockId, u64> =
            self.ledger.state().counts.into_iter().collect();
        for (&block, &count) in &enumerated {
            let ledger_count = ledger_counts.get(&block).copied().unwrap_or(0);
            if ledger_count != count {
                report.refcount_mismatches.push(RefcountMismatch {
                    block_id: block,
                    ledger_count,
                    enumerated: count,
                });
            }
        }
        for (&block, &ledger_count) in &ledger_counts {
            if !enumerated.contains_key(&block) {
                report.refcount_mismatches.push(RefcountMismatch {
                    block_id: block,
                    ledger_count,
                    enumerated: 0,
                });
            }
        }

        info!(
            blocks_checked = report.blocks_checked,
            checksum_errors = report.checksum_errors.len(),
            refcount_mismatches = report.refcount_mismatches.len(),
            "scrub complete"
        );
        Ok(report)
    }
}
