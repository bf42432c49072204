//! TXN slot lifecycle.
//!
//! ```text
//! ACTIVE -> COMMITTED -> PURGED -> ERASED -> (freed) -> ACTIVE (reuse)
//! ```
//!
//! Every transition reads the header, checks the move is legal, and writes
//! the header back. Only the owning segment's lock is held by callers, never
//! another segment's.

use std::sync::Arc;

use tidemark_error::{Result, TidemarkError};
use tidemark_types::{CommitMark, ProposalMark, SlotAddr, TrxId, TxnState, XaAddr, XaBranch, Xid};

use crate::safe_mode::LiveHeaderSet;
use crate::storage::{
    EXT_AC_COMMIT, EXT_AC_PREPARE, TAG_AC_ASSIGNED, TAG_ROLLBACK, TxnHeader, UndoStore,
};

/// Whether `from -> to` is a legal slot transition. Reuse (`ERASED ->
/// ACTIVE`) goes through [`TxnSlots::reuse`] only.
pub const fn is_legal_transition(from: TxnState, to: TxnState) -> bool {
    matches!(
        (from, to),
        (TxnState::Active, TxnState::Committed)
            | (TxnState::Committed, TxnState::Purged)
            | (TxnState::Purged, TxnState::Erased)
    )
}

fn check(from: TxnState, to: TxnState) -> Result<()> {
    if is_legal_transition(from, to) {
        Ok(())
    } else {
        Err(TidemarkError::InvalidSlotTransition {
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}

/// What a transaction writes into its slot when it finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotCommit {
    pub image: CommitMark,
    pub rollback: bool,
    pub xid: Option<Xid>,
    pub branch: XaBranch,
    pub maddr: XaAddr,
    pub proposal: ProposalMark,
    pub ac_prepare: bool,
    pub ac_commit: bool,
}

impl SlotCommit {
    pub fn plain(image: CommitMark) -> Self {
        Self {
            image,
            rollback: false,
            xid: None,
            branch: XaBranch::NULL,
            maddr: XaAddr::NULL,
            proposal: ProposalMark::NULL,
            ac_prepare: false,
            ac_commit: false,
        }
    }
}

/// Drives slot headers through their lifecycle.
pub struct TxnSlots {
    undo: Arc<dyn UndoStore>,
    live: Option<Arc<LiveHeaderSet>>,
}

impl TxnSlots {
    pub fn new(undo: Arc<dyn UndoStore>, live: Option<Arc<LiveHeaderSet>>) -> Self {
        Self { undo, live }
    }

    pub fn undo(&self) -> &Arc<dyn UndoStore> {
        &self.undo
    }

    fn read(&self, addr: SlotAddr) -> Result<TxnHeader> {
        self.undo
            .read_header(addr)
            .ok_or_else(|| TidemarkError::internal(format!("no TXN header at {addr}")))
    }

    /// Allocate a new segment and stamp an ACTIVE header.
    pub fn create(&self, rseg_id: u8, trx_id: TrxId) -> Result<SlotAddr> {
        let addr = self.undo.allocate_segment(rseg_id)?;
        if let Some(live) = &self.live {
            live.register(addr);
        }
        self.undo.write_header(addr, &TxnHeader::new_active(trx_id))?;
        Ok(addr)
    }

    /// Take over an erased slot, archiving its image as `prev_image`.
    pub fn reuse(&self, addr: SlotAddr, trx_id: TrxId) -> Result<CommitMark> {
        let old = self.read(addr)?;
        if old.state != TxnState::Erased {
            return Err(TidemarkError::InvalidSlotTransition {
                from: old.state.as_str(),
                to: "REUSE",
            });
        }
        let mut header = TxnHeader::new_active(trx_id);
        header.prev_image = old.image;
        self.undo.reset_records(addr);
        self.undo.write_header(addr, &header)?;
        tracing::debug!(
            slot = %addr,
            trx_id = trx_id.get(),
            prev_trx_id = old.trx_id.get(),
            prev_scn = old.image.scn.get(),
            "TXN slot reused"
        );
        Ok(old.image)
    }

    /// Record the XID on an active slot.
    pub fn attach_xid(&self, addr: SlotAddr, xid: &Xid) -> Result<()> {
        let mut header = self.read(addr)?;
        if header.state != TxnState::Active {
            return Err(TidemarkError::TxnNotActive {
                trx_id: header.trx_id.get(),
            });
        }
        header.xid = Some(xid.clone());
        self.undo.write_header(addr, &header)
    }

    /// Record the prepare-time proposal on an active slot.
    pub fn set_proposal(&self, addr: SlotAddr, proposal: ProposalMark, ac: bool) -> Result<()> {
        let mut header = self.read(addr)?;
        header.proposal = proposal;
        if ac {
            header.ext_flags |= EXT_AC_PREPARE;
        }
        self.undo.write_header(addr, &header)
    }

    pub fn commit(&self, addr: SlotAddr, info: &SlotCommit) -> Result<TxnHeader> {
        let mut header = self.read(addr)?;
        check(header.state, TxnState::Committed)?;
        debug_assert!(info.image.is_allocated());
        header.state = TxnState::Committed;
        header.image = info.image;
        if info.rollback {
            header.tags |= TAG_ROLLBACK;
        }
        if info.proposal.csr.is_assigned() {
            header.tags |= TAG_AC_ASSIGNED;
        }
        if info.ac_prepare {
            header.ext_flags |= EXT_AC_PREPARE;
        }
        if info.ac_commit {
            header.ext_flags |= EXT_AC_COMMIT;
        }
        if let Some(xid) = &info.xid {
            header.xid = Some(xid.clone());
        }
        header.branch = info.branch;
        header.maddr = info.maddr;
        if !info.proposal.is_null() {
            header.proposal = info.proposal;
        }
        self.undo.write_header(addr, &header)?;
        Ok(header)
    }

    pub fn mark_purged(&self, addr: SlotAddr) -> Result<TxnHeader> {
        self.advance(addr, TxnState::Purged)
    }

    pub fn mark_erased(&self, addr: SlotAddr) -> Result<TxnHeader> {
        self.advance(addr, TxnState::Erased)
    }

    fn advance(&self, addr: SlotAddr, to: TxnState) -> Result<TxnHeader> {
        let mut header = self.read(addr)?;
        check(header.state, to)?;
        header.state = to;
        self.undo.write_header(addr, &header)?;
        Ok(header)
    }

    /// Release the segment's pages.
    pub fn free(&self, addr: SlotAddr) {
        if let Some(live) = &self.live {
            live.deregister(addr);
        }
        self.undo.free_segment(addr);
    }
}
