//! Resolve a row's transaction reference to its commit status.
//!
//! A reference that is already stamped (committed undo pointer) answers
//! itself. An active reference goes through the commit cache, then through
//! the TXN header its undo pointer addresses. Unreadable or foreign headers
//! are downgraded to [`LookupStatus::UndoCorrupted`] with the deterministic
//! [`CommitMark::CORRUPTED`] image: a stale read always gets an answer.

use std::sync::Arc;

use tidemark_observability::TxnStats;
use tidemark_types::{CommitMark, LookupStatus, TxnLookupResult, TxnRecord, TxnState, Utc};

use crate::commit_cache::{CacheEntry, CommitCache, InsertOrigin};
use crate::safe_mode::LiveHeaderSet;
use crate::storage::UndoStore;
use crate::watermark::GcWatermarks;

/// Header-level resolution plus the slave flag needed for cleanout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub result: TxnLookupResult,
    pub is_slave: bool,
}

impl Resolution {
    const CORRUPTED: Self = Self {
        result: TxnLookupResult::CORRUPTED,
        is_slave: false,
    };
}

pub struct TxnResolver {
    undo: Arc<dyn UndoStore>,
    live: Option<Arc<LiveHeaderSet>>,
    watermarks: Arc<GcWatermarks>,
    cache: Option<Arc<CommitCache>>,
    stats: Arc<TxnStats>,
}

impl std::fmt::Debug for TxnResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnResolver")
            .field("safe_mode", &self.live.is_some())
            .field("cache", &self.cache.is_some())
            .finish_non_exhaustive()
    }
}

impl TxnResolver {
    pub fn new(
        undo: Arc<dyn UndoStore>,
        live: Option<Arc<LiveHeaderSet>>,
        watermarks: Arc<GcWatermarks>,
        cache: Option<Arc<CommitCache>>,
        stats: Arc<TxnStats>,
    ) -> Self {
        Self {
            undo,
            live,
            watermarks,
            cache,
            stats,
        }
    }

    pub fn is_safe_mode(&self) -> bool {
        self.live.is_some()
    }

    /// Resolve `rec`, stamping it in place when the outcome is final.
    pub fn resolve(&self, rec: &mut TxnRecord) -> TxnLookupResult {
        if rec.undo_ptr.is_no_redo() {
            return TxnLookupResult::new(CommitMark::TEMPORARY, LookupStatus::Committed);
        }
        if rec.is_committed() {
            return self.resolve_stamped(rec);
        }
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.lookup_record(rec) {
                return self.watermarks.upgrade_status(hit);
            }
        }
        let res = self.lookup_by_uba(rec);
        if CacheEntry::is_cacheable(res.result.status) {
            rec.set_committed(&res.result.image, res.is_slave);
            if let Some(cache) = &self.cache {
                cache.insert(
                    CacheEntry::new(rec.trx_id, &res.result.image, res.is_slave, res.result.status),
                    InsertOrigin::Resolve,
                );
            }
        }
        res.result
    }

    fn resolve_stamped(&self, rec: &TxnRecord) -> TxnLookupResult {
        let image = CommitMark::new(rec.scn, Utc::NULL, rec.gcn, rec.undo_ptr.csr());
        if self.watermarks.precheck_if_erased(rec) {
            TxnStats::incr(&self.stats.precheck_erased);
            return TxnLookupResult::new(image, LookupStatus::Erased);
        }
        if self.watermarks.precheck_if_purged(rec) {
            TxnStats::incr(&self.stats.precheck_purged);
            return TxnLookupResult::new(image, LookupStatus::Purged);
        }
        TxnLookupResult::new(image, LookupStatus::Committed)
    }

    /// Read the TXN header addressed by an active reference.
    pub fn lookup_by_uba(&self, rec: &TxnRecord) -> Resolution {
        TxnStats::incr(&self.stats.lookup_by_uba);
        let addr = rec.undo_ptr.slot_addr();
        if !addr.is_real() {
            tracing::warn!(trx_id = rec.trx_id.get(), uba = %rec.undo_ptr, "undo pointer has no slot");
            return Resolution::CORRUPTED;
        }
        if let Some(live) = &self.live {
            if !live.contains(addr) {
                TxnStats::incr(&self.stats.lost_page_miss_when_safe);
                tracing::warn!(trx_id = rec.trx_id.get(), slot = %addr, "TXN page not live");
                return Resolution::CORRUPTED;
            }
        }
        let Some(header) = self.undo.read_header(addr) else {
            tracing::error!(
                trx_id = rec.trx_id.get(),
                slot = %addr,
                "TXN header missing outside safe mode"
            );
            return Resolution::CORRUPTED;
        };
        if !header.magic_ok() {
            TxnStats::incr(&self.stats.lost_magic_number_wrong);
            tracing::warn!(
                trx_id = rec.trx_id.get(),
                slot = %addr,
                magic = header.magic,
                "TXN header magic mismatch"
            );
            return Resolution::CORRUPTED;
        }
        if header.trx_id != rec.trx_id {
            TxnStats::incr(&self.stats.lost_trx_id_mismatch);
            tracing::debug!(
                trx_id = rec.trx_id.get(),
                owner = header.trx_id.get(),
                slot = %addr,
                "TXN slot reused"
            );
            return Resolution {
                result: TxnLookupResult::new(header.prev_image, LookupStatus::Reuse),
                is_slave: false,
            };
        }
        if header.state == TxnState::Active {
            return Resolution {
                result: TxnLookupResult::ACTIVE,
                is_slave: false,
            };
        }
        let result = TxnLookupResult::new(header.image, LookupStatus::from(header.state));
        Resolution {
            result: self.watermarks.upgrade_status(result),
            is_slave: header.maddr.is_valid(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_types::{Csr, Gcn, Scn, SlotAddr, TrxId, XaAddr};

    use crate::config::CommitCacheConfig;
    use crate::mem_store::MemUndoStore;
    use crate::txn_slot::{SlotCommit, TxnSlots};

    struct Fixture {
        undo: Arc<MemUndoStore>,
        slots: TxnSlots,
        watermarks: Arc<GcWatermarks>,
        stats: Arc<TxnStats>,
        resolver: TxnResolver,
    }

    fn fixture(safe_mode: bool, cached: bool) -> Fixture {
        let undo = Arc::new(MemUndoStore::new());
        let live = safe_mode.then(|| Arc::new(LiveHeaderSet::new()));
        let stats = Arc::new(TxnStats::new());
        let watermarks = Arc::new(GcWatermarks::new());
        let cache = cached
            .then(|| Arc::new(CommitCache::new(&CommitCacheConfig::default(), stats.clone())));
        let resolver = TxnResolver::new(
            undo.clone(),
            live.clone(),
            watermarks.clone(),
            cache,
            stats.clone(),
        );
        Fixture {
            slots: TxnSlots::new(undo.clone(), live),
            undo,
            watermarks,
            stats,
            resolver,
        }
    }

    fn trx(n: u64) -> TrxId {
        TrxId::new(n).unwrap()
    }

    fn image(scn: u64, gcn: u64) -> CommitMark {
        CommitMark::new(Scn::new(scn), Utc::from_secs(100), Gcn::new(gcn), Csr::Automatic)
    }

    // -----------------------------------------------------------------------
    // Header lookups
    // -----------------------------------------------------------------------

    #[test]
    fn active_then_committed() {
        let f = fixture(false, false);
        let addr = f.slots.create(1, trx(7)).unwrap();
        let rec = TxnRecord::active(trx(7), addr);
        assert_eq!(f.resolver.lookup_by_uba(&rec).result, TxnLookupResult::ACTIVE);

        f.slots.commit(addr, &SlotCommit::plain(image(2000, 1500))).unwrap();
        let res = f.resolver.lookup_by_uba(&rec);
        assert_eq!(res.result.status, LookupStatus::Committed);
        assert_eq!(res.result.image, image(2000, 1500));
        assert!(!res.is_slave);
    }

    #[test]
    fn slave_flag_follows_master_addr() {
        let f = fixture(false, false);
        let addr = f.slots.create(1, trx(7)).unwrap();
        let info = SlotCommit {
            maddr: XaAddr::new(trx(3), SlotAddr::new(2, 9, 96).encode()),
            ..SlotCommit::plain(image(2000, 1500))
        };
        f.slots.commit(addr, &info).unwrap();
        assert!(f.resolver.lookup_by_uba(&TxnRecord::active(trx(7), addr)).is_slave);
    }

    #[test]
    fn reused_slot_returns_prev_image() {
        let f = fixture(false, false);
        let addr = f.slots.create(1, trx(7)).unwrap();
        f.slots.commit(addr, &SlotCommit::plain(image(2000, 1500))).unwrap();
        f.slots.mark_purged(addr).unwrap();
        f.slots.mark_erased(addr).unwrap();
        f.slots.reuse(addr, trx(42)).unwrap();

        let res = f.resolver.lookup_by_uba(&TxnRecord::active(trx(7), addr));
        assert_eq!(res.result.status, LookupStatus::Reuse);
        assert_eq!(res.result.image, image(2000, 1500));
        assert_eq!(f.stats.snapshot().lost_trx_id_mismatch, 1);
    }

    #[test]
    fn bad_magic_is_corrupted() {
        let f = fixture(false, false);
        let addr = f.slots.create(1, trx(7)).unwrap();
        f.undo.corrupt_magic(addr);
        let res = f.resolver.lookup_by_uba(&TxnRecord::active(trx(7), addr));
        assert_eq!(res.result, TxnLookupResult::CORRUPTED);
        assert_eq!(res.result.image, CommitMark::CORRUPTED);
        assert_eq!(f.stats.snapshot().lost_magic_number_wrong, 1);
    }

    #[test]
    fn safe_mode_rejects_freed_page() {
        let f = fixture(true, false);
        let addr = f.slots.create(1, trx(7)).unwrap();
        f.slots.free(addr);
        let res = f.resolver.lookup_by_uba(&TxnRecord::active(trx(7), addr));
        assert_eq!(res.result, TxnLookupResult::CORRUPTED);
        assert_eq!(f.stats.snapshot().lost_page_miss_when_safe, 1);
    }

    #[test]
    fn missing_header_without_safe_mode_is_corrupted() {
        let f = fixture(false, false);
        let rec = TxnRecord::active(trx(7), SlotAddr::new(1, 999, 96));
        assert_eq!(f.resolver.lookup_by_uba(&rec).result, TxnLookupResult::CORRUPTED);
    }

    #[test]
    fn watermarks_upgrade_status() {
        let f = fixture(false, false);
        let addr = f.slots.create(1, trx(7)).unwrap();
        f.slots.commit(addr, &SlotCommit::plain(image(2000, 1500))).unwrap();
        f.watermarks.advance_purged(Scn::new(2000), Gcn::new(1500));
        let res = f.resolver.lookup_by_uba(&TxnRecord::active(trx(7), addr));
        assert_eq!(res.result.status, LookupStatus::Purged);
    }

    // -----------------------------------------------------------------------
    // Full resolution
    // -----------------------------------------------------------------------

    #[test]
    fn resolve_stamps_and_caches() {
        let f = fixture(false, true);
        let addr = f.slots.create(1, trx(7)).unwrap();
        f.slots.commit(addr, &SlotCommit::plain(image(2000, 1500))).unwrap();

        let original = TxnRecord::active(trx(7), addr);
        let mut first = original;
        let r1 = f.resolver.resolve(&mut first);
        assert_eq!(r1.status, LookupStatus::Committed);
        assert!(first.is_committed());
        assert_eq!(first.scn, Scn::new(2000));

        let mut second = original;
        let r2 = f.resolver.resolve(&mut second);
        assert_eq!(r2.image, r1.image);
        assert_eq!(second, first);
        let snap = f.stats.snapshot();
        assert_eq!(snap.lookup_by_uba, 1);
        assert_eq!(snap.cache_hit, 1);
    }

    #[test]
    fn cached_status_follows_gc_forward() {
        let f = fixture(false, true);
        let addr = f.slots.create(1, trx(7)).unwrap();
        f.slots.commit(addr, &SlotCommit::plain(image(2000, 1500))).unwrap();
        let original = TxnRecord::active(trx(7), addr);

        f.slots.mark_purged(addr).unwrap();
        f.watermarks.advance_purged(Scn::new(2000), Gcn::new(1500));
        let mut rec = original;
        assert_eq!(f.resolver.resolve(&mut rec).status, LookupStatus::Purged);

        f.slots.mark_erased(addr).unwrap();
        f.watermarks.advance_erased(Scn::new(2000), Gcn::new(1500));
        let mut rec = original;
        assert_eq!(f.resolver.resolve(&mut rec).status, LookupStatus::Erased);
        assert_eq!(
            f.resolver.lookup_by_uba(&original).result.status,
            LookupStatus::Erased
        );

        let snap = f.stats.snapshot();
        assert_eq!(snap.cache_hit, 1);
    }

    #[test]
    fn active_and_reused_are_not_stamped() {
        let f = fixture(false, true);
        let addr = f.slots.create(1, trx(7)).unwrap();
        let mut rec = TxnRecord::active(trx(7), addr);
        assert!(f.resolver.resolve(&mut rec).is_active());
        assert!(!rec.is_committed());
    }

    #[test]
    fn stamped_records_use_prechecks() {
        let f = fixture(false, false);
        let addr = SlotAddr::new(1, 3, 96);
        let mut rec = TxnRecord::active(trx(7), addr);
        rec.set_committed(&image(1500, 1200), false);
        assert_eq!(f.resolver.resolve(&mut rec).status, LookupStatus::Committed);

        f.watermarks.advance_purged(Scn::new(1600), Gcn::new(1300));
        assert_eq!(f.resolver.resolve(&mut rec).status, LookupStatus::Purged);
        f.watermarks.advance_erased(Scn::new(1550), Gcn::new(1250));
        assert_eq!(f.resolver.resolve(&mut rec).status, LookupStatus::Erased);
        let snap = f.stats.snapshot();
        assert_eq!(snap.precheck_purged, 1);
        assert_eq!(snap.precheck_erased, 1);
        assert_eq!(snap.lookup_by_uba, 0);
    }

    #[test]
    fn temporary_rows_resolve_without_lookup() {
        let f = fixture(false, false);
        let mut rec = TxnRecord::temporary(trx(9));
        let res = f.resolver.resolve(&mut rec);
        assert_eq!(res.image, CommitMark::TEMPORARY);
        assert_eq!(f.stats.snapshot().lookup_by_uba, 0);
    }
}
