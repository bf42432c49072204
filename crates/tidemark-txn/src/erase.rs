//! Erase: second-phase GC.
//!
//! A purged log stays in its segment's semi-purge list until it is older than
//! every open snapshot and its commit time is outside the flashback retention
//! window. Erasing marks the TXN slot ERASED and returns the segment for
//! reuse, preferring the cached list.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tidemark_observability::{GcEvent, TxnStats};
use tidemark_types::{Scn, Utc};

use crate::clock::TransactionClock;
use crate::config::GcConfig;
use crate::gc_heap::GcHeap;
use crate::purge::{GcContext, arrange_txn_first};
use crate::rseg::RollbackSegment;

/// Whether a commit at `commit_utc` has left the retention window at `now`.
pub fn retention_satisfied(commit_utc: Utc, now: Utc, retention: Duration) -> bool {
    commit_utc.elapsed_until(now) > retention
}

/// Result of one erase batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EraseBatchResult {
    pub logs_erased: u64,
    pub cached: u64,
    /// Stopped at a head inside the vision or the retention window.
    pub blocked: bool,
    pub cancelled: bool,
    pub heap_remaining: usize,
}

enum EraseStep {
    Erased { cached: bool },
    Blocked,
    Empty,
}

#[derive(Debug)]
pub struct EraseScheduler {
    ctx: GcContext,
    heap: Arc<GcHeap>,
    clock: Arc<TransactionClock>,
    retention: Duration,
    config: GcConfig,
}

impl EraseScheduler {
    pub fn new(
        ctx: GcContext,
        heap: Arc<GcHeap>,
        clock: Arc<TransactionClock>,
        retention: Duration,
        config: GcConfig,
    ) -> Self {
        Self {
            ctx,
            heap,
            clock,
            retention,
            config,
        }
    }

    pub fn heap(&self) -> &GcHeap {
        &self.heap
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn run_batch(&self, cancel: &AtomicBool) -> EraseBatchResult {
        let mut result = EraseBatchResult::default();
        'batch: while result.logs_erased < self.config.erase_batch_logs as u64 {
            if cancel.load(Ordering::Acquire) {
                result.cancelled = true;
                break;
            }
            let oldest = self.ctx.views.oldest_vision();
            let (scn, mut ids) = match self.heap.pop_if(|scn| scn < oldest) {
                Ok(Some(top)) => top,
                Ok(None) => break,
                Err(top_scn) => {
                    self.blocked(top_scn, Utc::NULL);
                    result.blocked = true;
                    break;
                }
            };
            arrange_txn_first(&self.ctx.rsegs, &mut ids);
            let now = self.clock.now();
            for (i, &id) in ids.iter().enumerate() {
                let Ok(rseg) = self.ctx.rsegs.get(id) else {
                    tracing::error!(rseg_id = id, "erase heap entry for unknown segment");
                    continue;
                };
                match self.erase_one(rseg, oldest, now) {
                    EraseStep::Erased { cached } => {
                        result.logs_erased += 1;
                        result.cached += u64::from(cached);
                    }
                    EraseStep::Blocked => {
                        // Segments merged into this element stay queued.
                        for &rest in &ids[i + 1..] {
                            self.heap.push(scn, rest);
                        }
                        result.blocked = true;
                        break 'batch;
                    }
                    EraseStep::Empty => {}
                }
            }
            self.debug_validate();
        }
        result.heap_remaining = self.heap.len();
        TxnStats::add(&self.ctx.stats.erase_logs, result.logs_erased);
        if result.logs_erased > 0 {
            tracing::debug!(
                logs = result.logs_erased,
                cached = result.cached,
                erased_scn = self.ctx.watermarks.erased_scn().get(),
                heap_remaining = result.heap_remaining,
                "erase batch complete"
            );
        }
        result
    }

    fn blocked(&self, top_scn: Scn, commit_utc: Utc) {
        TxnStats::incr(&self.ctx.stats.erase_blocked);
        self.ctx
            .observer
            .on_event(&GcEvent::EraseBlocked { top_scn, commit_utc });
    }

    fn erase_one(&self, rseg: &RollbackSegment, oldest: Scn, now: Utc) -> EraseStep {
        let mut inner = rseg.lock();
        let Some(log) = inner.semi_purge.front().copied() else {
            inner.erase_queued = false;
            return EraseStep::Empty;
        };
        if log.scn >= oldest || !retention_satisfied(log.utc, now, self.retention) {
            // Re-push unchanged; the head stays where it was.
            self.heap.push(log.scn, rseg.id());
            drop(inner);
            self.blocked(log.scn, log.utc);
            return EraseStep::Blocked;
        }
        inner.semi_purge.pop_front();
        if let Err(err) = self.ctx.slots.mark_erased(log.addr) {
            tracing::error!(rseg_id = rseg.id(), slot = %log.addr, %err, "cannot mark TXN slot erased");
        }
        self.ctx.watermarks.advance_erased(log.scn, log.gcn);
        self.ctx.slots.undo().reset_records(log.addr);
        let cached = inner.release(log.addr, self.config.cached_segments_max);
        match inner.next_erase_scn() {
            Some(next) => self.heap.push(next, rseg.id()),
            None => inner.erase_queued = false,
        }
        drop(inner);
        self.ctx.observer.on_event(&GcEvent::TxnErased {
            rseg_id: rseg.id(),
            trx_id: log.trx_id,
            scn: log.scn,
            cached,
        });
        EraseStep::Erased { cached }
    }

    fn debug_validate(&self) {
        if cfg!(debug_assertions) {
            let erased = self.ctx.watermarks.erased_scn();
            if let Some(top) = self.heap.top() {
                debug_assert!(erased <= top, "erased {erased} passed erase heap top {top}");
            }
            let purged = self.ctx.watermarks.purged_scn();
            debug_assert!(erased <= purged, "erased {erased} passed purged {purged}");
        }
    }
}
