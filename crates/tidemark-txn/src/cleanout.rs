//! Cleanout: write resolved commit images back into rows.
//!
//! Read-path cleanout collects into a small per-read buffer and flushes after
//! the read has released its latches, taking each page's exclusive latch once.
//! Commit-path cleanout collects the rows a transaction modified and flushes
//! right after its commit mark is assigned.
//!
//! A row is only ever stamped for the transaction that wrote it. A row that
//! now belongs to someone else, or whose page is gone, is skipped and counted;
//! there is no retry. Stamping the same image twice leaves the row unchanged.

use std::collections::BTreeMap;

use smallvec::SmallVec;
use tidemark_observability::TxnStats;
use tidemark_types::{CommitMark, PageId, RowPos, TrxId, TxnRecord, Utc};

use crate::config::CleanoutConfig;
use crate::storage::{RowPage, RowStore};

/// Clustered cursors buffered per read.
pub const SCAN_CLUSTERED_MAX: usize = 3;
/// Secondary cursors buffered per read.
pub const SCAN_SECONDARY_MAX: usize = 3;

/// One pending write-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanoutCursor {
    /// Stamp a commit image onto a clustered row.
    Clustered {
        pos: RowPos,
        trx_id: TrxId,
        image: CommitMark,
        is_slave: bool,
    },
    /// Refresh a secondary entry's primary-page hint.
    Secondary { pos: RowPos, hint: PageId },
}

impl CleanoutCursor {
    pub const fn pos(&self) -> RowPos {
        match self {
            Self::Clustered { pos, .. } | Self::Secondary { pos, .. } => *pos,
        }
    }

    /// Apply under the page latch. Returns whether the row was written.
    fn apply(&self, page: &mut dyn RowPage) -> bool {
        match *self {
            Self::Clustered {
                pos,
                trx_id,
                image,
                is_slave,
            } => match page.txn_record(pos.slot) {
                Some(mut cur) if cur.trx_id == trx_id => {
                    cur.set_committed(&image, is_slave);
                    page.set_txn_fields(pos.slot, &cur);
                    true
                }
                _ => false,
            },
            Self::Secondary { pos, hint } => {
                if page.txn_record(pos.slot).is_none() {
                    return false;
                }
                page.set_page_hint(pos.slot, hint);
                true
            }
        }
    }
}

/// Image carried by an already stamped reference.
fn stamped_image(rec: &TxnRecord) -> CommitMark {
    CommitMark::new(rec.scn, Utc::NULL, rec.gcn, rec.undo_ptr.csr())
}

/// Apply `cursors` page by page. Returns `(cleaned, skipped)`.
fn flush_grouped(rows: &dyn RowStore, cursors: impl IntoIterator<Item = CleanoutCursor>) -> (u64, u64) {
    let mut by_page: BTreeMap<PageId, SmallVec<[CleanoutCursor; 4]>> = BTreeMap::new();
    for c in cursors {
        by_page.entry(c.pos().page).or_default().push(c);
    }
    let (mut cleaned, mut skipped) = (0, 0);
    for (page, group) in by_page {
        let found = rows.with_page_exclusive(page, &mut |p| {
            for c in &group {
                if c.apply(p) {
                    cleaned += 1;
                } else {
                    skipped += 1;
                }
            }
        });
        if !found {
            skipped += group.len() as u64;
        }
    }
    (cleaned, skipped)
}

// ---------------------------------------------------------------------------
// ScanCleanout
// ---------------------------------------------------------------------------

/// Read-path cleanout buffer.
#[derive(Debug, Default)]
pub struct ScanCleanout {
    clustered: SmallVec<[CleanoutCursor; SCAN_CLUSTERED_MAX]>,
    secondary: SmallVec<[CleanoutCursor; SCAN_SECONDARY_MAX]>,
    disabled: bool,
    hint_disabled: bool,
}

impl ScanCleanout {
    pub fn new(config: &CleanoutConfig) -> Self {
        Self {
            disabled: config.disabled,
            hint_disabled: config.page_hint_disabled,
            ..Self::default()
        }
    }

    /// Queue a stamped reference for write-back to `pos`.
    pub fn collect_clustered(&mut self, pos: RowPos, rec: &TxnRecord, stats: &TxnStats) -> bool {
        if self.disabled || !rec.is_committed() || rec.undo_ptr.is_no_redo() {
            return false;
        }
        if self.clustered.len() >= SCAN_CLUSTERED_MAX {
            return false;
        }
        self.clustered.push(CleanoutCursor::Clustered {
            pos,
            trx_id: rec.trx_id,
            image: stamped_image(rec),
            is_slave: rec.undo_ptr.is_slave(),
        });
        TxnStats::incr(&stats.cleanout_collect);
        true
    }

    /// Queue a page-hint refresh for the secondary entry at `pos`.
    pub fn collect_secondary(&mut self, pos: RowPos, hint: PageId, stats: &TxnStats) -> bool {
        if self.disabled || self.hint_disabled || self.secondary.len() >= SCAN_SECONDARY_MAX {
            return false;
        }
        self.secondary.push(CleanoutCursor::Secondary { pos, hint });
        TxnStats::incr(&stats.cleanout_collect);
        true
    }

    pub fn len(&self) -> usize {
        self.clustered.len() + self.secondary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write everything back and empty the buffer. Returns rows cleaned.
    pub fn flush(&mut self, rows: &dyn RowStore, stats: &TxnStats) -> u64 {
        if self.is_empty() {
            return 0;
        }
        let pending = self.clustered.drain(..).chain(self.secondary.drain(..));
        let (cleaned, skipped) = flush_grouped(rows, pending);
        TxnStats::add(&stats.cleanout_clean, cleaned);
        TxnStats::add(&stats.cleanout_skip, skipped);
        if skipped > 0 {
            tracing::debug!(cleaned, skipped, "scan cleanout skipped rows");
        }
        cleaned
    }
}

// ---------------------------------------------------------------------------
// CommitCleanout
// ---------------------------------------------------------------------------

/// Commit-path cleanout buffer: rows modified by one transaction.
#[derive(Debug)]
pub struct CommitCleanout {
    rows: SmallVec<[RowPos; 3]>,
    max_rows: usize,
}

impl CommitCleanout {
    pub fn new(max_rows: usize) -> Self {
        Self {
            rows: SmallVec::new(),
            max_rows,
        }
    }

    /// Remember a modified row. Rows past the cap are counted as skipped.
    pub fn push(&mut self, pos: RowPos, stats: &TxnStats) -> bool {
        if self.rows.contains(&pos) {
            return true;
        }
        if self.rows.len() >= self.max_rows {
            TxnStats::incr(&stats.commit_cleanout_skip);
            return false;
        }
        self.rows.push(pos);
        TxnStats::incr(&stats.commit_cleanout_collect);
        true
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    /// Stamp `image` onto every collected row still owned by `trx_id`.
    pub fn flush(
        &mut self,
        rows: &dyn RowStore,
        trx_id: TrxId,
        image: &CommitMark,
        is_slave: bool,
        stats: &TxnStats,
    ) -> u64 {
        if self.rows.is_empty() {
            return 0;
        }
        let pending = self.rows.drain(..).map(|pos| CleanoutCursor::Clustered {
            pos,
            trx_id,
            image: *image,
            is_slave,
        });
        let (cleaned, skipped) = flush_grouped(rows, pending);
        TxnStats::add(&stats.commit_cleanout_clean, cleaned);
        TxnStats::add(&stats.commit_cleanout_skip, skipped);
        cleaned
    }
}
