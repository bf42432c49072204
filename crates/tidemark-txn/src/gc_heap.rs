//! Scn-ordered heap of rollback segments awaiting GC.
//!
//! Each element is keyed by the oldest scn a segment still has to process.
//! Segments never mutate their key in place: the scheduler pops, works, and
//! pushes a fresh key. Segments with an equal key share one element.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tidemark_types::{RsegId, Scn};

/// Segment ids sharing one heap element.
pub type RsegIds = SmallVec<[RsegId; 3]>;

#[derive(Debug, Default)]
pub struct GcHeap {
    inner: Mutex<BTreeMap<Scn, RsegIds>>,
}

impl GcHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, scn: Scn, rseg_id: RsegId) {
        let mut heap = self.inner.lock();
        let ids = heap.entry(scn).or_default();
        if !ids.contains(&rseg_id) {
            ids.push(rseg_id);
        }
    }

    /// Smallest key, if any.
    pub fn top(&self) -> Option<Scn> {
        self.inner.lock().keys().next().copied()
    }

    /// Pop the smallest element when `ready(scn)` holds. Returns `Err` with
    /// the blocking key when the head is not ready, `Ok(None)` when empty.
    pub fn pop_if(&self, ready: impl FnOnce(Scn) -> bool) -> Result<Option<(Scn, RsegIds)>, Scn> {
        let mut heap = self.inner.lock();
        let Some(&scn) = heap.keys().next() else {
            return Ok(None);
        };
        if !ready(scn) {
            return Err(scn);
        }
        Ok(heap.pop_first())
    }

    /// Total segment entries, counting merged ids separately.
    pub fn len(&self) -> usize {
        self.inner.lock().values().map(SmallVec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
