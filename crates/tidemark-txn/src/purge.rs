//! Purge: first-phase GC.
//!
//! Pops rollback segments from the purge heap in scn order while the head is
//! at or below the purge vision, purges one committed log per pop, marks its
//! TXN slot PURGED and re-pushes the segment keyed by its next log. Purged
//! logs are truncated from the history list in batches: transaction logs move
//! to semi-purge and the erase heap, temporary logs are freed outright.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tidemark_observability::{GcEvent, GcObserver, TxnStats};
use tidemark_types::{RsegId, Scn, TrxId};

use crate::config::GcConfig;
use crate::gc_heap::{GcHeap, RsegIds};
use crate::heartbeat::HeartbeatFreezer;
use crate::rseg::{LogRef, RollbackSegment, RsegInner, RsegKind, RsegSet};
use crate::storage::{RowStore, UndoRecord};
use crate::txn_slot::TxnSlots;
use crate::vision::ViewRegistry;
use crate::watermark::GcWatermarks;

/// Result of one purge batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeBatchResult {
    pub logs_purged: u64,
    pub records_purged: u64,
    /// Stopped because the heap head is newer than the purge vision.
    pub stalled: bool,
    /// Stopped because the coordinator heartbeat is missing.
    pub frozen: bool,
    pub cancelled: bool,
    pub heap_remaining: usize,
}

/// Shared collaborators of the two GC schedulers.
#[derive(Clone)]
pub struct GcContext {
    pub rsegs: Arc<RsegSet>,
    pub slots: Arc<TxnSlots>,
    pub views: Arc<ViewRegistry>,
    pub watermarks: Arc<GcWatermarks>,
    pub stats: Arc<TxnStats>,
    pub observer: Arc<dyn GcObserver>,
}

impl std::fmt::Debug for GcContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcContext")
            .field("rsegs", &self.rsegs.all().len())
            .finish_non_exhaustive()
    }
}

/// Transaction segments first, so the slot segment is always at least as
/// far along as the temporary ones processed under the same key.
pub fn arrange_txn_first(rsegs: &RsegSet, ids: &mut RsegIds) {
    ids.sort_by_key(|id| {
        rsegs
            .get(*id)
            .map_or(2, |r| u8::from(r.kind() != RsegKind::Txn))
    });
}

pub struct PurgeScheduler {
    ctx: GcContext,
    heap: GcHeap,
    erase_heap: Arc<GcHeap>,
    rows: Arc<dyn RowStore>,
    freezer: Arc<HeartbeatFreezer>,
    config: GcConfig,
}

impl std::fmt::Debug for PurgeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PurgeScheduler")
            .field("heap_len", &self.heap.len())
            .field("purged_scn", &self.ctx.watermarks.purged_scn())
            .finish_non_exhaustive()
    }
}

impl PurgeScheduler {
    pub fn new(
        ctx: GcContext,
        erase_heap: Arc<GcHeap>,
        rows: Arc<dyn RowStore>,
        freezer: Arc<HeartbeatFreezer>,
        config: GcConfig,
    ) -> Self {
        Self {
            ctx,
            heap: GcHeap::new(),
            erase_heap,
            rows,
            freezer,
            config,
        }
    }

    pub fn heap(&self) -> &GcHeap {
        &self.heap
    }

    /// Publish a segment whose history just gained `scn`. Called with the
    /// segment lock held.
    pub fn enqueue(&self, rseg_id: RsegId, inner: &mut RsegInner, scn: Scn) {
        if inner.purge_queued {
            return;
        }
        inner.purge_queued = true;
        let purged = self.ctx.watermarks.purged_scn();
        if scn < purged {
            TxnStats::incr(&self.ctx.stats.purge_out_of_order);
            tracing::debug!(
                rseg_id,
                scn = scn.get(),
                purged_scn = purged.get(),
                "segment pushed behind the purge iterator"
            );
            self.ctx.observer.on_event(&GcEvent::PurgeOutOfOrder {
                rseg_id,
                scn,
                purged_scn: purged,
            });
        }
        self.heap.push(scn, rseg_id);
    }

    /// Purge up to `purge_batch_logs` logs. Stops early when cancelled,
    /// frozen, or blocked by the purge vision.
    pub fn run_batch(&self, cancel: &AtomicBool) -> PurgeBatchResult {
        let mut result = PurgeBatchResult::default();
        while result.logs_purged < self.config.purge_batch_logs as u64 {
            if cancel.load(Ordering::Acquire) {
                result.cancelled = true;
                break;
            }
            if self.freezer.determine_freeze() {
                result.frozen = true;
                break;
            }
            let vision = self.ctx.views.purge_vision();
            let (scn, mut ids) = match self.heap.pop_if(|scn| scn <= vision) {
                Ok(Some(top)) => top,
                Ok(None) => break,
                Err(top_scn) => {
                    TxnStats::incr(&self.ctx.stats.purge_stalls);
                    self.ctx.observer.on_event(&GcEvent::PurgeStalled {
                        top_scn,
                        vision_scn: vision,
                    });
                    result.stalled = true;
                    break;
                }
            };
            arrange_txn_first(&self.ctx.rsegs, &mut ids);
            for id in ids {
                match self.ctx.rsegs.get(id) {
                    Ok(rseg) => {
                        if let Some(records) = self.purge_one(rseg) {
                            result.logs_purged += 1;
                            result.records_purged += records;
                        }
                    }
                    Err(err) => {
                        tracing::error!(rseg_id = id, scn = scn.get(), %err, "heap entry for unknown segment");
                    }
                }
            }
            self.debug_validate();
        }
        result.heap_remaining = self.heap.len();
        TxnStats::add(&self.ctx.stats.purge_logs, result.logs_purged);
        TxnStats::add(&self.ctx.stats.purge_records, result.records_purged);
        if result.logs_purged > 0 {
            tracing::debug!(
                logs = result.logs_purged,
                records = result.records_purged,
                purged_scn = self.ctx.watermarks.purged_scn().get(),
                heap_remaining = result.heap_remaining,
                "purge batch complete"
            );
        }
        result
    }

    /// Purge the oldest unpurged log of `rseg`. Returns records purged, or
    /// `None` when the segment had nothing to purge.
    fn purge_one(&self, rseg: &RollbackSegment) -> Option<u64> {
        let log = {
            let mut inner = rseg.lock();
            let Some(log) = inner.next_unpurged().copied() else {
                inner.purge_queued = false;
                return None;
            };
            log
        };

        let undo = self.ctx.slots.undo();
        let mut records = 0;
        for rec in undo.records(log.addr) {
            if rec.kind.is_noop() {
                continue;
            }
            if rec.kind.removes_row() {
                self.purge_row(&rec, log.trx_id);
            }
            records += 1;
        }
        if let Err(err) = self.ctx.slots.mark_purged(log.addr) {
            tracing::error!(rseg_id = rseg.id(), slot = %log.addr, %err, "cannot mark TXN slot purged");
        }
        let out_of_order = self.ctx.stats.purge_out_of_order.load(Ordering::Relaxed) > 0;
        self.ctx.watermarks.validate_purged(log.scn, out_of_order);
        self.ctx.watermarks.advance_purged(log.scn, log.gcn);
        self.ctx.observer.on_event(&GcEvent::TxnPurged {
            rseg_id: rseg.id(),
            trx_id: log.trx_id,
            scn: log.scn,
        });

        let truncated = {
            let mut inner = rseg.lock();
            inner.advance_purge_cursor();
            let truncated = if inner.purge_cursor >= self.config.truncate_batch_logs
                || inner.unpurged_len() == 0
            {
                self.truncate(rseg, &mut inner)
            } else {
                0
            };
            match inner.next_purge_scn() {
                Some(next) => self.heap.push(next, rseg.id()),
                None => inner.purge_queued = false,
            }
            truncated
        };
        if truncated > 0 {
            self.ctx.observer.on_event(&GcEvent::SegmentPurged {
                rseg_id: rseg.id(),
                scn: log.scn,
                logs: truncated,
            });
        }
        Some(records)
    }

    /// Remove a delete-marked row, trying the recorded position first.
    fn purge_row(&self, rec: &UndoRecord, trx_id: TrxId) -> bool {
        if let Some(hint) = rec.hint {
            if hint.table() == rec.table && self.rows.row_key(hint) == Some(rec.key) {
                TxnStats::incr(&self.ctx.stats.page_hint_hit);
                return self.rows.purge_row(hint, trx_id);
            }
            TxnStats::incr(&self.ctx.stats.page_hint_miss);
        }
        match self.rows.search(rec.table, rec.key) {
            Some(pos) => self.rows.purge_row(pos, trx_id),
            None => false,
        }
    }

    /// Cut the purged prefix of the history list. Returns logs truncated.
    fn truncate(&self, rseg: &RollbackSegment, inner: &mut RsegInner) -> u64 {
        let logs: Vec<LogRef> = inner.truncate_purged();
        let n = logs.len() as u64;
        match rseg.kind() {
            RsegKind::Txn => {
                inner.semi_purge.extend(logs);
                if !inner.erase_queued {
                    if let Some(scn) = inner.next_erase_scn() {
                        inner.erase_queued = true;
                        self.erase_heap.push(scn, rseg.id());
                    }
                }
            }
            RsegKind::Temporary => {
                for log in logs {
                    self.ctx.slots.undo().reset_records(log.addr);
                    self.ctx.slots.free(log.addr);
                }
            }
        }
        TxnStats::add(&self.ctx.stats.truncated_logs, n);
        n
    }

    /// Watermark bound after a heap mutation.
    fn debug_validate(&self) {
        if cfg!(debug_assertions) && self.ctx.stats.purge_out_of_order.load(Ordering::Relaxed) == 0 {
            let purged = self.ctx.watermarks.purged_scn();
            if let Some(top) = self.heap.top() {
                debug_assert!(purged <= top, "purged {purged} passed heap top {top}");
            }
            let erased = self.ctx.watermarks.erased_scn();
            debug_assert!(erased <= purged, "erased {erased} passed purged {purged}");
        }
    }
}
