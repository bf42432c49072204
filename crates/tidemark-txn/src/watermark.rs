//! Purged and erased watermarks.
//!
//! Every commit with `scn <= purged_scn` has been purged, every commit with
//! `scn <= erased_scn` erased. Both only move up, and the erased watermark
//! never passes the purged one. A row reference whose scn is at or below a
//! watermark can be classified without reading its undo header.

use std::sync::atomic::{AtomicU64, Ordering};

use tidemark_types::{Gcn, LookupStatus, Scn, TxnLookupResult, TxnRecord};

/// The four GC watermarks.
#[derive(Debug)]
pub struct GcWatermarks {
    purged_scn: AtomicU64,
    purged_gcn: AtomicU64,
    erased_scn: AtomicU64,
    erased_gcn: AtomicU64,
}

impl Default for GcWatermarks {
    fn default() -> Self {
        Self::new()
    }
}

impl GcWatermarks {
    pub fn new() -> Self {
        Self {
            purged_scn: AtomicU64::new(Scn::RESERVED_MAX.get()),
            purged_gcn: AtomicU64::new(0),
            erased_scn: AtomicU64::new(Scn::RESERVED_MAX.get()),
            erased_gcn: AtomicU64::new(0),
        }
    }

    pub fn purged_scn(&self) -> Scn {
        Scn::new(self.purged_scn.load(Ordering::Acquire))
    }

    pub fn purged_gcn(&self) -> Gcn {
        Gcn::new(self.purged_gcn.load(Ordering::Acquire))
    }

    pub fn erased_scn(&self) -> Scn {
        Scn::new(self.erased_scn.load(Ordering::Acquire))
    }

    pub fn erased_gcn(&self) -> Gcn {
        Gcn::new(self.erased_gcn.load(Ordering::Acquire))
    }

    pub fn advance_purged(&self, scn: Scn, gcn: Gcn) {
        self.purged_scn.fetch_max(scn.get(), Ordering::AcqRel);
        self.purged_gcn.fetch_max(gcn.get(), Ordering::AcqRel);
    }

    pub fn advance_erased(&self, scn: Scn, gcn: Gcn) {
        self.erased_scn.fetch_max(scn.get(), Ordering::AcqRel);
        self.erased_gcn.fetch_max(gcn.get(), Ordering::AcqRel);
    }

    /// Reset after recovery from the heads of the two GC heaps.
    ///
    /// `purge_top` is the oldest scn still waiting for purge, `erase_top` the
    /// oldest still waiting for erase; `current_scn` is the system scn.
    pub fn reload(&self, purge_top: Option<Scn>, erase_top: Option<Scn>, current_scn: Scn) {
        let purged = purge_top.map_or(current_scn, |scn| Scn::new(scn.get().saturating_sub(1)));
        let erased = erase_top.map_or(purged, |scn| Scn::new(scn.get().saturating_sub(1)));
        let erased = erased.min(purged);
        self.purged_scn.store(purged.get(), Ordering::Release);
        self.erased_scn.store(erased.get(), Ordering::Release);
        tracing::info!(
            purged_scn = purged.get(),
            erased_scn = erased.get(),
            "GC watermarks reloaded"
        );
    }

    pub fn precheck_if_purged(&self, rec: &TxnRecord) -> bool {
        !rec.scn.is_null() && rec.scn <= self.purged_scn()
    }

    pub fn precheck_if_erased(&self, rec: &TxnRecord) -> bool {
        !rec.scn.is_null() && rec.scn <= self.erased_scn()
    }

    /// Upgrade a `Committed` or `Purged` result using the watermarks. A
    /// status is never moved back to an earlier state.
    pub fn upgrade_status(&self, result: TxnLookupResult) -> TxnLookupResult {
        let upgradable = matches!(
            result.status,
            LookupStatus::Committed | LookupStatus::Purged
        );
        if !upgradable || result.image.is_null() {
            return result;
        }
        let scn = result.image.scn;
        let status = if scn <= self.erased_scn() {
            LookupStatus::Erased
        } else if scn <= self.purged_scn() {
            LookupStatus::Purged
        } else {
            result.status
        };
        TxnLookupResult::new(result.image, status)
    }

    /// Check a freshly purged scn against the watermark. Out-of-order pushes
    /// make a later, smaller scn legal, so the check is skipped once any were
    /// seen.
    pub fn validate_purged(&self, scn: Scn, out_of_order_seen: bool) {
        if out_of_order_seen {
            return;
        }
        debug_assert!(
            scn >= self.purged_scn(),
            "purge went backwards: {scn} < {}",
            self.purged_scn()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_types::{CommitMark, Csr, SlotAddr, TrxId, Utc};

    fn rec(scn: u64) -> TxnRecord {
        let mut r = TxnRecord::active(TrxId::new(1).unwrap(), SlotAddr::new(1, 3, 96));
        let image = CommitMark::new(Scn::new(scn), Utc::from_secs(1), Gcn::new(2000), Csr::Automatic);
        r.set_committed(&image, false);
        r
    }

    #[test]
    fn watermarks_only_move_up() {
        let w = GcWatermarks::new();
        w.advance_purged(Scn::new(2000), Gcn::new(3000));
        w.advance_purged(Scn::new(1500), Gcn::new(2500));
        assert_eq!(w.purged_scn(), Scn::new(2000));
        assert_eq!(w.purged_gcn(), Gcn::new(3000));
        w.advance_erased(Scn::new(1800), Gcn::new(2800));
        assert_eq!(w.erased_scn(), Scn::new(1800));
    }

    #[test]
    fn precheck_is_inclusive() {
        let w = GcWatermarks::new();
        w.advance_purged(Scn::new(2000), Gcn::new(3000));
        w.advance_erased(Scn::new(1500), Gcn::new(2500));
        assert!(w.precheck_if_purged(&rec(2000)));
        assert!(!w.precheck_if_purged(&rec(2001)));
        assert!(w.precheck_if_erased(&rec(1500)));
        assert!(!w.precheck_if_erased(&rec(1501)));
        let active = TxnRecord::active(TrxId::new(2).unwrap(), SlotAddr::new(1, 4, 96));
        assert!(!w.precheck_if_purged(&active));
    }

    #[test]
    fn status_upgrade() {
        let w = GcWatermarks::new();
        w.advance_purged(Scn::new(2000), Gcn::new(3000));
        w.advance_erased(Scn::new(1500), Gcn::new(2500));
        let at = |scn| {
            let image = CommitMark::new(Scn::new(scn), Utc::from_secs(1), Gcn::new(9), Csr::Automatic);
            w.upgrade_status(TxnLookupResult::new(image, LookupStatus::Committed))
                .status
        };
        assert_eq!(at(1400), LookupStatus::Erased);
        assert_eq!(at(1900), LookupStatus::Purged);
        assert_eq!(at(2100), LookupStatus::Committed);
        assert_eq!(w.upgrade_status(TxnLookupResult::ACTIVE), TxnLookupResult::ACTIVE);

        let cached = |scn, status| {
            let image = CommitMark::new(Scn::new(scn), Utc::from_secs(1), Gcn::new(9), Csr::Automatic);
            w.upgrade_status(TxnLookupResult::new(image, status)).status
        };
        assert_eq!(cached(1400, LookupStatus::Purged), LookupStatus::Erased);
        assert_eq!(cached(2100, LookupStatus::Purged), LookupStatus::Purged);
        assert_eq!(cached(2100, LookupStatus::Erased), LookupStatus::Erased);
        assert_eq!(
            w.upgrade_status(TxnLookupResult::CORRUPTED),
            TxnLookupResult::CORRUPTED
        );
    }

    #[test]
    fn reload_from_heap_tops() {
        let w = GcWatermarks::new();
        w.reload(Some(Scn::new(3000)), Some(Scn::new(2500)), Scn::new(4000));
        assert_eq!(w.purged_scn(), Scn::new(2999));
        assert_eq!(w.erased_scn(), Scn::new(2499));

        w.reload(None, None, Scn::new(4000));
        assert_eq!(w.purged_scn(), Scn::new(4000));
        assert_eq!(w.erased_scn(), Scn::new(4000));
    }
}
