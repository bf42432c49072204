//! Read views and the GC visions derived from them.
//!
//! Purge may reclaim a log once no open view can still see the row version
//! it removes: `scn <= purge_vision`. Erase additionally requires the log to
//! be strictly older than every open snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tidemark_types::{Gcn, Scn, TrxId, TxnLookupResult, TxnRecord};

use crate::clock::TransactionClock;

/// Identifier of an open read view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ViewId(u64);

impl ViewId {
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// A consistent snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadView {
    pub id: ViewId,
    pub snapshot_scn: Scn,
    pub snapshot_gcn: Gcn,
    /// Transaction that opened the view, if any; its own changes are visible.
    pub trx: Option<TrxId>,
}

impl ReadView {
    /// Whether a row version with reference `rec`, resolved to `result`, is
    /// visible in this snapshot.
    pub fn sees(&self, rec: &TxnRecord, result: &TxnLookupResult) -> bool {
        if result.is_active() {
            return self.trx == Some(rec.trx_id);
        }
        result.image.scn <= self.snapshot_scn
    }
}

/// Multiset of open snapshot scns.
#[derive(Debug)]
pub struct ViewRegistry {
    clock: Arc<TransactionClock>,
    open: Mutex<BTreeMap<Scn, usize>>,
    next_id: AtomicU64,
}

impl ViewRegistry {
    pub fn new(clock: Arc<TransactionClock>) -> Self {
        Self {
            clock,
            open: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn open(&self, trx: Option<TrxId>) -> ReadView {
        let mut open = self.open.lock();
        // Taken under the registry lock so a concurrent vision computation
        // cannot miss this snapshot.
        let snapshot_scn = self.clock.load_scn();
        *open.entry(snapshot_scn).or_insert(0) += 1;
        ReadView {
            id: ViewId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            snapshot_scn,
            snapshot_gcn: self.clock.load_gcn(),
            trx,
        }
    }

    pub fn close(&self, view: &ReadView) {
        let mut open = self.open.lock();
        if let Some(count) = open.get_mut(&view.snapshot_scn) {
            *count -= 1;
            if *count == 0 {
                open.remove(&view.snapshot_scn);
            }
        } else {
            tracing::warn!(view = view.id.get(), "closing a view that is not open");
        }
    }

    pub fn open_count(&self) -> usize {
        self.open.lock().values().sum()
    }

    /// Oldest open snapshot scn, or the current scn when none is open.
    pub fn purge_vision(&self) -> Scn {
        let open = self.open.lock();
        open.keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.clock.load_scn())
    }

    /// Exclusive bound for erase: logs with `scn < oldest_vision` are older
    /// than every open snapshot.
    pub fn oldest_vision(&self) -> Scn {
        let open = self.open.lock();
        open.keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.clock.load_scn().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_types::{CommitMark, Csr, LookupStatus, SlotAddr, Utc};

    use crate::clock::ManualClock;

    fn registry() -> (Arc<TransactionClock>, ViewRegistry) {
        let clock = Arc::new(TransactionClock::new(Arc::new(ManualClock::new(
            Utc::from_secs(1),
        ))));
        (clock.clone(), ViewRegistry::new(clock))
    }

    #[test]
    fn visions_without_views_follow_clock() {
        let (clock, views) = registry();
        let scn = clock.next_scn();
        assert_eq!(views.purge_vision(), scn);
        assert_eq!(views.oldest_vision(), scn.next());
    }

    #[test]
    fn oldest_open_view_pins_vision() {
        let (clock, views) = registry();
        clock.next_scn();
        let v1 = views.open(None);
        let v1b = views.open(None);
        clock.next_scn();
        let v2 = views.open(None);
        clock.next_scn();

        assert_eq!(views.open_count(), 3);
        assert_eq!(views.purge_vision(), v1.snapshot_scn);
        assert_eq!(views.oldest_vision(), v1.snapshot_scn);
        views.close(&v1);
        assert_eq!(views.purge_vision(), v1.snapshot_scn, "duplicate still open");
        views.close(&v1b);
        assert_eq!(views.purge_vision(), v2.snapshot_scn);
        views.close(&v2);
        assert_eq!(views.purge_vision(), clock.load_scn());
        assert_ne!(v1.id, v1b.id);
    }

    #[test]
    fn visibility() {
        let (clock, views) = registry();
        let me = TrxId::new(5).unwrap();
        let other = TrxId::new(6).unwrap();
        let view = views.open(Some(me));
        let slot = SlotAddr::new(1, 2, 96);

        let mine = TxnRecord::active(me, slot);
        let theirs = TxnRecord::active(other, slot);
        assert!(view.sees(&mine, &TxnLookupResult::ACTIVE));
        assert!(!view.sees(&theirs, &TxnLookupResult::ACTIVE));

        let committed = |scn: Scn| {
            TxnLookupResult::new(
                CommitMark::new(scn, Utc::from_secs(1), Gcn::new(2000), Csr::Automatic),
                LookupStatus::Committed,
            )
        };
        assert!(view.sees(&theirs, &committed(view.snapshot_scn)));
        assert!(!view.sees(&theirs, &committed(clock.next_scn())));
    }
}
