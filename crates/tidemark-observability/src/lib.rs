//! Transaction-system statistics and GC observability.
//!
//! Provides the counters bumped by the resolver, commit cache, cleanout and
//! the two GC schedulers, the serializable status snapshots reported to
//! operators, and an opt-in [`GcObserver`] hook for GC events.
//!
//! # Design Principles
//!
//! - **Lock-free counters:** every counter in [`TxnStats`] is an atomic
//!   bumped with `Relaxed` ordering from the hot path.
//! - **Zero-cost when unused:** the default [`NoOpObserver`] is inlined away.
//! - **Snapshots are values:** everything reported is `serde::Serialize`.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tidemark_types::{Gcn, RsegId, Scn, TrxId, Utc};

// ---------------------------------------------------------------------------
// GcEvent
// ---------------------------------------------------------------------------

/// A single event emitted by the purge and erase schedulers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum GcEvent {
    /// Purge finished every log of a segment up to `scn`.
    SegmentPurged { rseg_id: RsegId, scn: Scn, logs: u64 },
    /// A TXN slot was marked PURGED.
    TxnPurged { rseg_id: RsegId, trx_id: TrxId, scn: Scn },
    /// A TXN slot was marked ERASED and its log released.
    TxnErased {
        rseg_id: RsegId,
        trx_id: TrxId,
        scn: Scn,
        cached: bool,
    },
    /// The heap head was not yet old enough.
    PurgeStalled { top_scn: Scn, vision_scn: Scn },
    /// The erase head is inside the retention window or the vision.
    EraseBlocked { top_scn: Scn, commit_utc: Utc },
    /// A segment was pushed behind the purge iterator.
    PurgeOutOfOrder { rseg_id: RsegId, scn: Scn, purged_scn: Scn },
}

impl GcEvent {
    /// Whether the event represents lack of progress.
    #[must_use]
    pub fn is_stall(&self) -> bool {
        matches!(
            self,
            Self::PurgeStalled { .. } | Self::EraseBlocked { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// GcObserver
// ---------------------------------------------------------------------------

/// Observer trait for GC events.
///
/// Called from the GC worker while no segment lock is held. Implementations
/// must not block.
pub trait GcObserver: Send + Sync {
    fn on_event(&self, event: &GcEvent);
}

/// Default observer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpObserver;

impl GcObserver for NoOpObserver {
    #[inline(always)]
    fn on_event(&self, _event: &GcEvent) {}
}

/// Bounded log of recent GC events; the oldest entry is dropped when full.
pub struct GcEventLog {
    inner: Mutex<EventRing>,
}

struct EventRing {
    buf: Vec<GcEvent>,
    capacity: usize,
    head: usize,
}

impl EventRing {
    fn push(&mut self, event: GcEvent) {
        if self.capacity == 0 {
            return;
        }
        if self.buf.len() < self.capacity {
            self.buf.push(event);
        } else {
            self.buf[self.head] = event;
            self.head = (self.head + 1) % self.capacity;
        }
    }

    fn ordered(&self) -> Vec<GcEvent> {
        let mut out = Vec::with_capacity(self.buf.len());
        out.extend_from_slice(&self.buf[self.head..]);
        out.extend_from_slice(&self.buf[..self.head]);
        out
    }
}

impl GcEventLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(EventRing {
                buf: Vec::with_capacity(capacity),
                capacity,
                head: 0,
            }),
        }
    }

    /// Events in arrival order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<GcEvent> {
        self.inner.lock().ordered()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut ring = self.inner.lock();
        ring.buf.clear();
        ring.head = 0;
    }
}

impl GcObserver for GcEventLog {
    fn on_event(&self, event: &GcEvent) {
        self.inner.lock().push(event.clone());
    }
}

// ---------------------------------------------------------------------------
// TxnStats
// ---------------------------------------------------------------------------

/// Counters shared by every component of the transaction system.
#[derive(Debug, Default)]
pub struct TxnStats {
    // Resolver.
    pub lookup_by_uba: AtomicU64,
    pub lost_magic_number_wrong: AtomicU64,
    pub lost_trx_id_mismatch: AtomicU64,
    pub lost_page_miss_when_safe: AtomicU64,
    pub precheck_purged: AtomicU64,
    pub precheck_erased: AtomicU64,

    // Commit cache.
    pub cache_hit: AtomicU64,
    pub cache_miss: AtomicU64,
    pub cache_evict: AtomicU64,

    // Cleanout.
    pub cleanout_collect: AtomicU64,
    pub cleanout_clean: AtomicU64,
    pub cleanout_skip: AtomicU64,
    pub commit_cleanout_collect: AtomicU64,
    pub commit_cleanout_clean: AtomicU64,
    pub commit_cleanout_skip: AtomicU64,

    // Secondary index page hints.
    pub page_hint_hit: AtomicU64,
    pub page_hint_miss: AtomicU64,

    // GC.
    pub purge_logs: AtomicU64,
    pub purge_records: AtomicU64,
    pub purge_stalls: AtomicU64,
    pub purge_out_of_order: AtomicU64,
    pub erase_logs: AtomicU64,
    pub erase_blocked: AtomicU64,
    pub truncated_logs: AtomicU64,

    // Heartbeat.
    pub heartbeat_freeze_rejects: AtomicU64,
}

#[inline]
fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[inline]
fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl TxnStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        bump(counter);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Reset every counter to zero.
    pub fn reset(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn counters(&self) -> [&AtomicU64; 25] {
        [
            &self.lookup_by_uba,
            &self.lost_magic_number_wrong,
            &self.lost_trx_id_mismatch,
            &self.lost_page_miss_when_safe,
            &self.precheck_purged,
            &self.precheck_erased,
            &self.cache_hit,
            &self.cache_miss,
            &self.cache_evict,
            &self.cleanout_collect,
            &self.cleanout_clean,
            &self.cleanout_skip,
            &self.commit_cleanout_collect,
            &self.commit_cleanout_clean,
            &self.commit_cleanout_skip,
            &self.page_hint_hit,
            &self.page_hint_miss,
            &self.purge_logs,
            &self.purge_records,
            &self.purge_stalls,
            &self.purge_out_of_order,
            &self.erase_logs,
            &self.erase_blocked,
            &self.truncated_logs,
            &self.heartbeat_freeze_rejects,
        ]
    }

    #[must_use]
    pub fn snapshot(&self) -> TxnStatsSnapshot {
        TxnStatsSnapshot {
            lookup_by_uba: load(&self.lookup_by_uba),
            lost_magic_number_wrong: load(&self.lost_magic_number_wrong),
            lost_trx_id_mismatch: load(&self.lost_trx_id_mismatch),
            lost_page_miss_when_safe: load(&self.lost_page_miss_when_safe),
            precheck_purged: load(&self.precheck_purged),
            precheck_erased: load(&self.precheck_erased),
            cache_hit: load(&self.cache_hit),
            cache_miss: load(&self.cache_miss),
            cache_evict: load(&self.cache_evict),
            cleanout_collect: load(&self.cleanout_collect),
            cleanout_clean: load(&self.cleanout_clean),
            cleanout_skip: load(&self.cleanout_skip),
            commit_cleanout_collect: load(&self.commit_cleanout_collect),
            commit_cleanout_clean: load(&self.commit_cleanout_clean),
            commit_cleanout_skip: load(&self.commit_cleanout_skip),
            page_hint_hit: load(&self.page_hint_hit),
            page_hint_miss: load(&self.page_hint_miss),
            purge_logs: load(&self.purge_logs),
            purge_records: load(&self.purge_records),
            purge_stalls: load(&self.purge_stalls),
            purge_out_of_order: load(&self.purge_out_of_order),
            erase_logs: load(&self.erase_logs),
            erase_blocked: load(&self.erase_blocked),
            truncated_logs: load(&self.truncated_logs),
            heartbeat_freeze_rejects: load(&self.heartbeat_freeze_rejects),
        }
    }
}

/// Serializable point-in-time copy of [`TxnStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TxnStatsSnapshot {
    pub lookup_by_uba: u64,
    pub lost_magic_number_wrong: u64,
    pub lost_trx_id_mismatch: u64,
    pub lost_page_miss_when_safe: u64,
    pub precheck_purged: u64,
    pub precheck_erased: u64,
    pub cache_hit: u64,
    pub cache_miss: u64,
    pub cache_evict: u64,
    pub cleanout_collect: u64,
    pub cleanout_clean: u64,
    pub cleanout_skip: u64,
    pub commit_cleanout_collect: u64,
    pub commit_cleanout_clean: u64,
    pub commit_cleanout_skip: u64,
    pub page_hint_hit: u64,
    pub page_hint_miss: u64,
    pub purge_logs: u64,
    pub purge_records: u64,
    pub purge_stalls: u64,
    pub purge_out_of_order: u64,
    pub erase_logs: u64,
    pub erase_blocked: u64,
    pub truncated_logs: u64,
    pub heartbeat_freeze_rejects: u64,
}

impl TxnStatsSnapshot {
    /// Resolver lookups that ended with a loss (corrupted or reused slot).
    #[must_use]
    pub fn lookup_losses(&self) -> u64 {
        self.lost_magic_number_wrong + self.lost_trx_id_mismatch + self.lost_page_miss_when_safe
    }

    /// Cache hit ratio in `[0, 1]`; zero when no lookups happened.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn cache_hit_ratio(&self) -> f64 {
        let total = self.cache_hit + self.cache_miss;
        if total == 0 {
            return 0.0;
        }
        self.cache_hit as f64 / total as f64
    }
}

// ---------------------------------------------------------------------------
// Status snapshots
// ---------------------------------------------------------------------------

/// Global GC progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PurgeStatus {
    pub history_length: u64,
    pub current_scn: Scn,
    pub current_gcn: Gcn,
    pub purged_scn: Scn,
    pub purged_gcn: Gcn,
    pub erased_scn: Scn,
    pub erased_gcn: Gcn,
}

/// Per rollback segment list lengths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RsegStat {
    pub rseg_id: RsegId,
    pub history_length: u64,
    pub history_pages: u64,
    pub secondary_length: u64,
    pub secondary_pages: u64,
    pub free_length: u64,
    pub cached_length: u64,
}

/// Commit image of the oldest log in a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TruncMark {
    pub utc: Utc,
    pub scn: Scn,
    pub gcn: Gcn,
}

/// Oldest retained history per rollback segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TruncStatus {
    pub rseg_id: RsegId,
    pub oldest_history: Option<TruncMark>,
    pub oldest_semi_purge: Option<TruncMark>,
}
