//! Storage-engine collaborators.
//!
//! The transaction system never touches pages directly. Undo headers and
//! records go through [`UndoStore`]; row transaction references go through
//! [`RowStore`] and, under an exclusive page latch, [`RowPage`].

use tidemark_error::Result;
use tidemark_types::{
    CommitMark, PageId, ProposalMark, RowPos, RsegId, SlotAddr, TableId, TrxId, TxnRecord,
    TxnState, XaAddr, XaBranch, Xid,
};

/// Magic number stamped in every TXN undo log header.
pub const TXN_MAGIC: u32 = 91_118_498;

// Header extension flags.
pub const EXT_ALLOCATED_TAGS: u8 = 0x01;
pub const EXT_AC_PREPARE: u8 = 0x02;
pub const EXT_AC_COMMIT: u8 = 0x04;

// Outcome tags, meaningful only with `EXT_ALLOCATED_TAGS`.
pub const TAG_ROLLBACK: u8 = 0x01;
pub const TAG_AC_ASSIGNED: u8 = 0x02;

/// Undo records that fit on one undo page; used for page statistics.
pub const RECORDS_PER_PAGE: usize = 64;

/// Key of a row inside its table.
pub type RowKey = u64;

// ---------------------------------------------------------------------------
// TxnHeader
// ---------------------------------------------------------------------------

/// The TXN undo log header: one per transaction slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnHeader {
    pub magic: u32,
    pub trx_id: TrxId,
    pub state: TxnState,
    pub image: CommitMark,
    /// Image the slot held before it was reused by `trx_id`.
    pub prev_image: CommitMark,
    pub ext_flags: u8,
    pub tags: u8,
    pub xid: Option<Xid>,
    pub branch: XaBranch,
    pub maddr: XaAddr,
    pub proposal: ProposalMark,
}

impl TxnHeader {
    /// Header of a freshly allocated slot.
    pub fn new_active(trx_id: TrxId) -> Self {
        Self {
            magic: TXN_MAGIC,
            trx_id,
            state: TxnState::Active,
            image: CommitMark::NULL,
            prev_image: CommitMark::NULL,
            ext_flags: EXT_ALLOCATED_TAGS,
            tags: 0,
            xid: None,
            branch: XaBranch::NULL,
            maddr: XaAddr::NULL,
            proposal: ProposalMark::NULL,
        }
    }

    pub const fn has_tags(&self) -> bool {
        self.ext_flags & EXT_ALLOCATED_TAGS != 0
    }

    pub const fn is_rollback(&self) -> bool {
        self.has_tags() && self.tags & TAG_ROLLBACK != 0
    }

    pub const fn magic_ok(&self) -> bool {
        self.magic == TXN_MAGIC
    }
}

// ---------------------------------------------------------------------------
// UndoRecord
// ---------------------------------------------------------------------------

/// Kind of an undo record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UndoRecordKind {
    Insert,
    DelMark,
    UpdExist { ord_change: bool },
    UpdDel,
    /// Reserved space with nothing to undo or purge.
    Placeholder,
}

impl UndoRecordKind {
    /// Records the purge walk steps over.
    pub const fn is_noop(self) -> bool {
        matches!(
            self,
            Self::Placeholder | Self::UpdExist { ord_change: false }
        )
    }

    /// Records whose row is physically removed by purge.
    pub const fn removes_row(self) -> bool {
        matches!(self, Self::DelMark | Self::UpdDel)
    }
}

/// One row modification recorded in a transaction's undo log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoRecord {
    pub undo_no: u64,
    pub kind: UndoRecordKind,
    pub table: TableId,
    pub key: RowKey,
    /// Last known row position; purge tries it before searching by key.
    pub hint: Option<RowPos>,
    /// Row reference before the modification; `None` for inserts.
    pub prev: Option<TxnRecord>,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Undo log pages.
pub trait UndoStore: Send + Sync {
    /// Allocate a brand-new undo segment in `rseg_id` and return the address
    /// of its header.
    fn allocate_segment(&self, rseg_id: RsegId) -> Result<SlotAddr>;

    /// Release a segment's pages back to the file.
    fn free_segment(&self, addr: SlotAddr);

    /// `None` when nothing is allocated at `addr`.
    fn read_header(&self, addr: SlotAddr) -> Option<TxnHeader>;

    fn write_header(&self, addr: SlotAddr, header: &TxnHeader) -> Result<()>;

    fn append_record(&self, addr: SlotAddr, record: UndoRecord) -> Result<()>;

    /// Records of the log at `addr`, oldest first.
    fn records(&self, addr: SlotAddr) -> Vec<UndoRecord>;

    fn record_count(&self, addr: SlotAddr) -> usize {
        self.records(addr).len()
    }

    /// Drop every record but keep the header.
    fn reset_records(&self, addr: SlotAddr);
}

/// A page latched exclusively.
pub trait RowPage {
    fn txn_record(&self, slot: u16) -> Option<TxnRecord>;

    /// Overwrite the row's transaction reference in place.
    fn set_txn_fields(&mut self, slot: u16, rec: &TxnRecord);

    /// Overwrite a secondary entry's primary-page hint.
    fn set_page_hint(&mut self, slot: u16, hint: PageId);
}

/// Rows of every table, addressed by page position or by key.
pub trait RowStore: Send + Sync {
    /// Read a row's transaction reference under a shared latch.
    fn txn_record(&self, pos: RowPos) -> Option<TxnRecord>;

    /// Run `f` under the page's exclusive latch. Returns `false`, without
    /// calling `f`, when the page does not exist.
    fn with_page_exclusive(&self, page: PageId, f: &mut dyn FnMut(&mut dyn RowPage)) -> bool;

    /// Insert or overwrite the row with `key`, returning its position.
    fn write_row(&self, table: TableId, key: RowKey, rec: TxnRecord, delete_marked: bool)
    -> RowPos;

    /// Put back the reference `rec`, or remove the row when `rec` is `None`.
    fn restore_row(&self, pos: RowPos, rec: Option<TxnRecord>);

    fn row_key(&self, pos: RowPos) -> Option<RowKey>;

    fn search(&self, table: TableId, key: RowKey) -> Option<RowPos>;

    /// Search one page only.
    fn search_page(&self, page: PageId, key: RowKey) -> Option<RowPos>;

    /// Primary-page hint stored on a secondary entry.
    fn page_hint(&self, pos: RowPos) -> Option<PageId>;

    /// Store a secondary entry pointing at `key` in `primary`.
    fn write_secondary(&self, table: TableId, key: RowKey, hint: Option<PageId>) -> RowPos;

    /// Physically remove the row if it is still delete-marked by `trx_id`.
    fn purge_row(&self, pos: RowPos, trx_id: TrxId) -> bool;
}
