//! Rollback segments.
//!
//! Each segment owns, under one mutex, its history list (committed logs
//! waiting for purge, oldest first), its semi-purge list (purged logs
//! waiting for erase) and its reusable segment lists. Locks are always taken
//! in the order rseg, then a GC heap, never two rsegs at once.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tidemark_error::{Result, TidemarkError};
use tidemark_observability::{RsegStat, TruncMark, TruncStatus};
use tidemark_types::{CommitMark, Gcn, RsegId, Scn, SlotAddr, TrxId, Utc, Xid};

use crate::config::RsegConfig;
use crate::storage::{RECORDS_PER_PAGE, UndoStore};
use crate::txn_slot::TxnSlots;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RsegKind {
    /// Durable undo for regular tables.
    Txn,
    /// Undo for temporary tables; never erased, freed right after purge.
    Temporary,
}

/// A committed undo log as tracked by its segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRef {
    pub addr: SlotAddr,
    pub trx_id: TrxId,
    pub scn: Scn,
    pub gcn: Gcn,
    pub utc: Utc,
}

impl LogRef {
    pub fn from_image(addr: SlotAddr, trx_id: TrxId, image: &CommitMark) -> Self {
        Self {
            addr,
            trx_id,
            scn: image.scn,
            gcn: image.gcn,
            utc: image.utc,
        }
    }

    fn trunc_mark(&self) -> TruncMark {
        TruncMark {
            utc: self.utc,
            scn: self.scn,
            gcn: self.gcn,
        }
    }
}

/// Slot handed to a starting transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatedSlot {
    pub addr: SlotAddr,
    /// Image of the previous owner when an erased slot was reused.
    pub prev_image: Option<CommitMark>,
}

// ---------------------------------------------------------------------------
// RsegInner
// ---------------------------------------------------------------------------

/// State protected by the segment mutex.
#[derive(Debug, Default)]
pub struct RsegInner {
    /// Committed logs in commit order. The first `purge_cursor` entries are
    /// already purged and wait for truncation.
    pub history: VecDeque<LogRef>,
    pub purge_cursor: usize,
    /// Purged logs waiting for erase, in scn order.
    pub semi_purge: VecDeque<LogRef>,
    /// Erased segments available for reuse.
    pub free: Vec<SlotAddr>,
    /// Erased segments kept warm for reuse; preferred over `free`.
    pub cached: Vec<SlotAddr>,
    /// The segment currently has an entry in the purge heap.
    pub purge_queued: bool,
    /// The segment currently has an entry in the erase heap.
    pub erase_queued: bool,
}

impl RsegInner {
    pub fn append_history(&mut self, log: LogRef) {
        debug_assert!(self.history.back().is_none_or(|last| last.scn < log.scn));
        self.history.push_back(log);
    }

    /// Oldest committed log not yet purged.
    pub fn next_unpurged(&self) -> Option<&LogRef> {
        self.history.get(self.purge_cursor)
    }

    pub fn next_purge_scn(&self) -> Option<Scn> {
        self.next_unpurged().map(|log| log.scn)
    }

    pub fn next_erase_scn(&self) -> Option<Scn> {
        self.semi_purge.front().map(|log| log.scn)
    }

    pub fn advance_purge_cursor(&mut self) {
        debug_assert!(self.purge_cursor < self.history.len());
        self.purge_cursor += 1;
    }

    pub fn unpurged_len(&self) -> usize {
        self.history.len() - self.purge_cursor
    }

    /// Remove the purged prefix of the history list.
    pub fn truncate_purged(&mut self) -> Vec<LogRef> {
        let n = self.purge_cursor;
        self.purge_cursor = 0;
        self.history.drain(..n).collect()
    }

    fn take_reusable(&mut self) -> Option<SlotAddr> {
        self.cached.pop().or_else(|| self.free.pop())
    }

    /// Return an erased segment for reuse. Returns whether it was cached.
    pub fn release(&mut self, addr: SlotAddr, cached_max: usize) -> bool {
        if self.cached.len() < cached_max {
            self.cached.push(addr);
            true
        } else {
            self.free.push(addr);
            false
        }
    }
}

// ---------------------------------------------------------------------------
// RollbackSegment
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct RollbackSegment {
    id: RsegId,
    kind: RsegKind,
    inner: Mutex<RsegInner>,
}

impl RollbackSegment {
    pub fn new(id: RsegId, kind: RsegKind) -> Self {
        Self {
            id,
            kind,
            inner: Mutex::new(RsegInner::default()),
        }
    }

    pub fn id(&self) -> RsegId {
        self.id
    }

    pub fn kind(&self) -> RsegKind {
        self.kind
    }

    pub fn lock(&self) -> MutexGuard<'_, RsegInner> {
        self.inner.lock()
    }

    /// Give `trx_id` a TXN slot, reusing an erased one when available.
    pub fn allocate_slot(&self, slots: &TxnSlots, trx_id: TrxId) -> Result<AllocatedSlot> {
        let mut inner = self.inner.lock();
        if let Some(addr) = inner.take_reusable() {
            match slots.reuse(addr, trx_id) {
                Ok(prev) => {
                    return Ok(AllocatedSlot {
                        addr,
                        prev_image: Some(prev),
                    });
                }
                Err(err) => {
                    tracing::error!(rseg_id = self.id, slot = %addr, %err, "reusable slot rejected");
                    inner.free.push(addr);
                    return Err(err);
                }
            }
        }
        drop(inner);
        let addr = slots.create(self.id, trx_id)?;
        Ok(AllocatedSlot {
            addr,
            prev_image: None,
        })
    }

    pub fn stat(&self, undo: &dyn UndoStore) -> RsegStat {
        let inner = self.inner.lock();
        RsegStat {
            rseg_id: self.id,
            history_length: inner.history.len() as u64,
            history_pages: log_pages(undo, inner.history.iter()),
            secondary_length: inner.semi_purge.len() as u64,
            secondary_pages: log_pages(undo, inner.semi_purge.iter()),
            free_length: inner.free.len() as u64,
            cached_length: inner.cached.len() as u64,
        }
    }

    pub fn trunc_status(&self) -> TruncStatus {
        let inner = self.inner.lock();
        TruncStatus {
            rseg_id: self.id,
            oldest_history: inner.history.front().map(LogRef::trunc_mark),
            oldest_semi_purge: inner.semi_purge.front().map(LogRef::trunc_mark),
        }
    }
}

fn log_pages<'a>(undo: &dyn UndoStore, logs: impl Iterator<Item = &'a LogRef>) -> u64 {
    logs.map(|log| (undo.record_count(log.addr) / RECORDS_PER_PAGE + 1) as u64)
        .sum()
}

// ---------------------------------------------------------------------------
// RsegSet
// ---------------------------------------------------------------------------

/// All rollback segments. Transaction segments have ids `1..=txn_rsegs`,
/// temporary ones follow.
#[derive(Debug)]
pub struct RsegSet {
    segments: Vec<Arc<RollbackSegment>>,
    txn_rsegs: u8,
    next_txn: AtomicUsize,
    next_temp: AtomicUsize,
}

impl RsegSet {
    pub fn new(config: &RsegConfig) -> Self {
        let txn = (1..=config.txn_rsegs).map(|id| RollbackSegment::new(id, RsegKind::Txn));
        let temp = (1..=config.temp_rsegs)
            .map(|n| RollbackSegment::new(config.txn_rsegs + n, RsegKind::Temporary));
        Self {
            segments: txn.chain(temp).map(Arc::new).collect(),
            txn_rsegs: config.txn_rsegs,
            next_txn: AtomicUsize::new(0),
            next_temp: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, rseg_id: RsegId) -> Result<&Arc<RollbackSegment>> {
        usize::from(rseg_id)
            .checked_sub(1)
            .and_then(|i| self.segments.get(i))
            .ok_or(TidemarkError::RsegNotFound { rseg_id })
    }

    pub fn all(&self) -> &[Arc<RollbackSegment>] {
        &self.segments
    }

    pub fn txn_segments(&self) -> &[Arc<RollbackSegment>] {
        &self.segments[..usize::from(self.txn_rsegs)]
    }

    pub fn temp_segments(&self) -> &[Arc<RollbackSegment>] {
        &self.segments[usize::from(self.txn_rsegs)..]
    }

    /// Round-robin transaction segment.
    pub fn pick_txn(&self) -> &Arc<RollbackSegment> {
        let txn = self.txn_segments();
        &txn[self.next_txn.fetch_add(1, Ordering::Relaxed) % txn.len()]
    }

    /// Round-robin temporary segment, if any are configured.
    pub fn pick_temp(&self) -> Option<&Arc<RollbackSegment>> {
        let temp = self.temp_segments();
        if temp.is_empty() {
            return None;
        }
        Some(&temp[self.next_temp.fetch_add(1, Ordering::Relaxed) % temp.len()])
    }

    /// Segment that holds every log of `xid`, so a search scans one segment.
    #[allow(clippy::cast_possible_truncation)]
    pub fn for_xid(&self, xid: &Xid) -> &Arc<RollbackSegment> {
        let i = (xid.hash64() % u64::from(self.txn_rsegs)) as usize;
        &self.segments[i]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_types::Csr;

    use crate::mem_store::MemUndoStore;
    use crate::txn_slot::SlotCommit;

    fn trx(n: u64) -> TrxId {
        TrxId::new(n).unwrap()
    }

    fn config(txn: u8, temp: u8) -> RsegConfig {
        RsegConfig {
            txn_rsegs: txn,
            temp_rsegs: temp,
        }
    }

    fn log(addr: SlotAddr, scn: u64) -> LogRef {
        LogRef {
            addr,
            trx_id: trx(scn),
            scn: Scn::new(scn),
            gcn: Gcn::new(scn),
            utc: Utc::from_secs(scn),
        }
    }

    #[test]
    fn ids_and_kinds() {
        let set = RsegSet::new(&config(4, 2));
        assert_eq!(set.all().len(), 6);
        assert!(set.txn_segments().iter().all(|r| r.kind() == RsegKind::Txn));
        let temp_ids: Vec<_> = set.temp_segments().iter().map(|r| r.id()).collect();
        assert_eq!(temp_ids, vec![5, 6]);
        assert_eq!(set.get(3).unwrap().id(), 3);
        assert!(matches!(set.get(0), Err(TidemarkError::RsegNotFound { rseg_id: 0 })));
        assert!(set.get(7).is_err());
    }

    #[test]
    fn round_robin_and_xid_placement() {
        let set = RsegSet::new(&config(3, 0));
        let picked: Vec<_> = (0..6).map(|_| set.pick_txn().id()).collect();
        assert_eq!(picked, vec![1, 2, 3, 1, 2, 3]);
        assert!(set.pick_temp().is_none());

        let xid = Xid::new(1, b"gtrid".to_vec(), b"bq".to_vec()).unwrap();
        let a = set.for_xid(&xid).id();
        assert_eq!(a, set.for_xid(&xid.clone()).id());
        assert_eq!(u64::from(a), 1 + xid.hash64() % 3);
    }

    #[test]
    fn history_cursor_and_truncate() {
        let mut inner = RsegInner::default();
        let addr = SlotAddr::new(1, 1, 96);
        for scn in [2000, 2001, 2002] {
            inner.append_history(log(addr, scn));
        }
        assert_eq!(inner.next_purge_scn(), Some(Scn::new(2000)));
        inner.advance_purge_cursor();
        inner.advance_purge_cursor();
        assert_eq!(inner.next_purge_scn(), Some(Scn::new(2002)));
        assert_eq!(inner.unpurged_len(), 1);
        let truncated = inner.truncate_purged();
        assert_eq!(truncated.len(), 2);
        assert_eq!(inner.history.len(), 1);
        assert_eq!(inner.next_purge_scn(), Some(Scn::new(2002)));
    }

    #[test]
    fn release_prefers_cache_until_full() {
        let mut inner = RsegInner::default();
        assert!(inner.release(SlotAddr::new(1, 1, 96), 1));
        assert!(!inner.release(SlotAddr::new(1, 2, 96), 1));
        assert_eq!(inner.take_reusable(), Some(SlotAddr::new(1, 1, 96)));
        assert_eq!(inner.take_reusable(), Some(SlotAddr::new(1, 2, 96)));
        assert_eq!(inner.take_reusable(), None);
    }

    #[test]
    fn allocate_reuses_erased_slot() {
        let slots = TxnSlots::new(Arc::new(MemUndoStore::new()), None);
        let rseg = RollbackSegment::new(1, RsegKind::Txn);
        let first = rseg.allocate_slot(&slots, trx(1)).unwrap();
        assert!(first.prev_image.is_none());

        let image = CommitMark::new(Scn::new(2000), Utc::from_secs(5), Gcn::new(3000), Csr::Automatic);
        slots.commit(first.addr, &SlotCommit::plain(image)).unwrap();
        slots.mark_purged(first.addr).unwrap();
        slots.mark_erased(first.addr).unwrap();
        rseg.lock().release(first.addr, 4);

        let second = rseg.allocate_slot(&slots, trx(2)).unwrap();
        assert_eq!(second.addr, first.addr);
        assert_eq!(second.prev_image, Some(image));
        assert_eq!(rseg.stat(slots.undo().as_ref()).cached_length, 0);
    }

    #[test]
    fn stat_and_trunc_status() {
        let undo = MemUndoStore::new();
        let rseg = RollbackSegment::new(2, RsegKind::Txn);
        {
            let mut inner = rseg.lock();
            inner.append_history(log(SlotAddr::new(2, 1, 96), 2000));
            inner.append_history(log(SlotAddr::new(2, 2, 96), 2001));
            inner.semi_purge.push_back(log(SlotAddr::new(2, 3, 96), 1500));
        }
        let stat = rseg.stat(&undo);
        assert_eq!(stat.rseg_id, 2);
        assert_eq!(stat.history_length, 2);
        assert_eq!(stat.history_pages, 2);
        assert_eq!(stat.secondary_length, 1);

        let trunc = rseg.trunc_status();
        assert_eq!(trunc.oldest_history.unwrap().scn, Scn::new(2000));
        assert_eq!(trunc.oldest_semi_purge.unwrap().utc, Utc::from_secs(1500));
    }
}
