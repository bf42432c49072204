pub mod commit;
pub mod encoding;
pub mod gcn_event;
pub mod undo_ptr;
pub mod xa;

pub use commit::{
    CommitMark, Csr, FAKE_UTC_BASE, Gcn, InvalidTrxId, LookupStatus, ProposalMark, Scn, TrxId,
    TxnLookupResult, TxnRecord, TxnState, Utc,
};
pub use gcn_event::{
    FLAG_GCN_ASSIGNED, FLAG_GCN_PROPOSAL, FLAG_HAVE_BRANCH_COUNT, FLAG_HAVE_COMMITTED_SEQ,
    FLAG_HAVE_GCN, FLAG_HAVE_SNAPSHOT_SEQ, GcnEvent, GcnEventError,
};
pub use undo_ptr::{
    RSEG_ID_MAX, SLOT_OFFSET_LIMIT, SLOT_OFFSET_NO_REDO, SLOT_PAGE_NO_FAKE, SlotAddr, SlotPtr,
    UndoPtr, UndoPtrParts,
};
pub use xa::{XID_PART_MAX, XaAddr, XaBranch, XaInfo, XaStatus, Xid, XidError};

use std::fmt;

/// Rollback segment identifier. Real segments are `1..=RSEG_ID_MAX`.
pub type RsegId = u8;

/// Identifier of a table or index whose rows carry transaction references.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TableId(u32);

impl TableId {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table#{}", self.0)
    }
}

/// Page of a row store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct PageId {
    pub table: TableId,
    pub page_no: u32,
}

impl PageId {
    #[inline]
    pub const fn new(table: TableId, page_no: u32) -> Self {
        Self { table, page_no }
    }
}

/// Physical position of a row: page plus slot within the page.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct RowPos {
    pub page: PageId,
    pub slot: u16,
}

impl RowPos {
    #[inline]
    pub const fn new(page: PageId, slot: u16) -> Self {
        Self { page, slot }
    }

    #[inline]
    pub const fn table(&self) -> TableId {
        self.page.table
    }
}

impl fmt::Display for RowPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.page.table, self.page.page_no, self.slot)
    }
}
