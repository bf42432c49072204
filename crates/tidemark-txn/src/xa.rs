//! XA branch registry and transaction search by XID.
//!
//! Live branches are tracked in [`XaRegistry`] from `XA START` until the
//! branch finishes. Finished branches are found through their TXN headers in
//! the segment the XID hashes to, for as long as the slot is not erased.

use std::collections::HashMap;

use parking_lot::Mutex;
use tidemark_error::{Result, TidemarkError};
use tidemark_types::{
    ProposalMark, SlotAddr, TrxId, TxnState, XaAddr, XaBranch, XaInfo, XaStatus, Xid,
};

use crate::rseg::{LogRef, RsegSet};
use crate::storage::UndoStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XaPhase {
    /// Still executing statements.
    Attached,
    /// Prepared and detached from its session.
    Prepared,
}

/// A branch that has not finished yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveXa {
    pub trx_id: TrxId,
    pub slot: SlotAddr,
    pub phase: XaPhase,
    pub proposal: ProposalMark,
    pub branch: XaBranch,
}

impl LiveXa {
    fn info(&self) -> XaInfo {
        let mut info = XaInfo::with_status(match self.phase {
            XaPhase::Attached => XaStatus::Attached,
            XaPhase::Prepared => XaStatus::DetachedPrepare,
        });
        info.slot = XaAddr::new(self.trx_id, self.slot.encode());
        info.branch = self.branch;
        if self.phase == XaPhase::Prepared {
            info.gcn = self.proposal.gcn;
            info.csr = self.proposal.csr;
        }
        info
    }
}

#[derive(Debug, Default)]
pub struct XaRegistry {
    live: Mutex<HashMap<Xid, LiveXa>>,
}

impl XaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `xid` to a transaction. A second transaction may not take an XID
    /// that is still live.
    pub fn attach(&self, xid: Xid, trx_id: TrxId, slot: SlotAddr) -> Result<()> {
        let mut live = self.live.lock();
        if let Some(existing) = live.get(&xid) {
            if existing.trx_id != trx_id {
                return Err(TidemarkError::xid_mismatch(format!(
                    "{xid} is held by trx {}",
                    existing.trx_id
                )));
            }
            return Ok(());
        }
        live.insert(
            xid,
            LiveXa {
                trx_id,
                slot,
                phase: XaPhase::Attached,
                proposal: ProposalMark::NULL,
                branch: XaBranch::NULL,
            },
        );
        Ok(())
    }

    pub fn mark_prepared(
        &self,
        xid: &Xid,
        trx_id: TrxId,
        proposal: ProposalMark,
        branch: XaBranch,
    ) -> Result<()> {
        let mut live = self.live.lock();
        match live.get_mut(xid) {
            Some(entry) if entry.trx_id == trx_id => {
                entry.phase = XaPhase::Prepared;
                entry.proposal = proposal;
                entry.branch = branch;
                Ok(())
            }
            Some(entry) => Err(TidemarkError::xid_mismatch(format!(
                "{xid} is held by trx {}, not {trx_id}",
                entry.trx_id
            ))),
            None => Err(TidemarkError::xid_mismatch(format!("{xid} is not attached"))),
        }
    }

    /// Drop the branch once it commits or rolls back.
    pub fn finish(&self, xid: &Xid, trx_id: TrxId) -> Option<LiveXa> {
        let mut live = self.live.lock();
        if live.get(xid).is_some_and(|e| e.trx_id == trx_id) {
            live.remove(xid)
        } else {
            None
        }
    }

    pub fn get(&self, xid: &Xid) -> Option<LiveXa> {
        self.live.lock().get(xid).cloned()
    }

    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.lock().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

/// Look a transaction up by XID.
///
/// Live branches answer first. Otherwise the history and semi-purge lists of
/// the segment the XID maps to are scanned newest first; erased slots are
/// forgotten.
pub fn search_transaction_info(
    registry: &XaRegistry,
    rsegs: &RsegSet,
    undo: &dyn UndoStore,
    xid: &Xid,
) -> XaInfo {
    if let Some(live) = registry.get(xid) {
        return live.info();
    }

    let rseg = rsegs.for_xid(xid);
    let logs: Vec<LogRef> = {
        let inner = rseg.lock();
        inner
            .history
            .iter()
            .rev()
            .chain(inner.semi_purge.iter().rev())
            .copied()
            .collect()
    };

    for log in logs {
        let Some(header) = undo.read_header(log.addr) else {
            continue;
        };
        if !header.magic_ok() || header.trx_id != log.trx_id {
            continue;
        }
        if header.xid.as_ref() != Some(xid) || header.state == TxnState::Active {
            continue;
        }
        let status = if !header.has_tags() {
            XaStatus::NotSupport
        } else if header.is_rollback() {
            XaStatus::Rollback
        } else {
            XaStatus::Commit
        };
        tracing::debug!(
            %xid,
            rseg_id = rseg.id(),
            trx_id = log.trx_id.get(),
            status = status.as_str(),
            "xa transaction found in history"
        );
        return XaInfo {
            status,
            gcn: header.image.gcn,
            csr: header.image.csr,
            slot: XaAddr::new(log.trx_id, log.addr.encode()),
            branch: header.branch,
            maddr: header.maddr,
        };
    }
    XaInfo::with_status(XaStatus::NotStartOrForget)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tidemark_types::{CommitMark, Csr, Gcn, Scn, Utc};

    use crate::config::RsegConfig;
    use crate::mem_store::MemUndoStore;
    use crate::storage::{EXT_ALLOCATED_TAGS, TxnHeader};
    use crate::txn_slot::{SlotCommit, TxnSlots};

    fn trx(n: u64) -> TrxId {
        TrxId::new(n).unwrap()
    }

    fn xid(g: &str) -> Xid {
        Xid::new(1, g.as_bytes().to_vec(), b"b1".to_vec()).unwrap()
    }

    struct Fixture {
        registry: XaRegistry,
        rsegs: RsegSet,
        slots: TxnSlots,
    }

    fn fixture() -> Fixture {
        Fixture {
            registry: XaRegistry::new(),
            rsegs: RsegSet::new(&RsegConfig {
                txn_rsegs: 4,
                temp_rsegs: 0,
            }),
            slots: TxnSlots::new(Arc::new(MemUndoStore::new()), None),
        }
    }

    impl Fixture {
        fn search(&self, xid: &Xid) -> XaInfo {
            search_transaction_info(&self.registry, &self.rsegs, self.slots.undo().as_ref(), xid)
        }

        /// Commit an XA transaction into its XID's segment history.
        fn finish(&self, xid: &Xid, trx_id: TrxId, scn: u64, rollback: bool) -> SlotAddr {
            let rseg = self.rsegs.for_xid(xid);
            let addr = rseg.allocate_slot(&self.slots, trx_id).unwrap().addr;
            let image = CommitMark::new(Scn::new(scn), Utc::from_secs(5), Gcn::new(3000), Csr::Assigned);
            let mut info = SlotCommit::plain(image);
            info.xid = Some(xid.clone());
            info.rollback = rollback;
            info.branch = XaBranch::new(3, 1);
            self.slots.commit(addr, &info).unwrap();
            rseg.lock().append_history(LogRef::from_image(addr, trx_id, &image));
            addr
        }
    }

    // -----------------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------------

    #[test]
    fn attach_rejects_foreign_owner() {
        let registry = XaRegistry::new();
        let slot = SlotAddr::new(1, 1, 96);
        registry.attach(xid("g"), trx(1), slot).unwrap();
        registry.attach(xid("g"), trx(1), slot).unwrap();
        let err = registry.attach(xid("g"), trx(2), slot).unwrap_err();
        assert!(matches!(err, TidemarkError::XidMismatch { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn prepare_requires_owner() {
        let registry = XaRegistry::new();
        let slot = SlotAddr::new(1, 1, 96);
        let proposal = ProposalMark::new(Gcn::new(2000), Csr::Automatic);
        assert!(
            registry
                .mark_prepared(&xid("g"), trx(1), proposal, XaBranch::new(2, 1))
                .is_err()
        );
        registry.attach(xid("g"), trx(1), slot).unwrap();
        assert!(
            registry
                .mark_prepared(&xid("g"), trx(2), proposal, XaBranch::new(2, 1))
                .is_err()
        );
        registry
            .mark_prepared(&xid("g"), trx(1), proposal, XaBranch::new(2, 1))
            .unwrap();
        assert_eq!(registry.get(&xid("g")).unwrap().phase, XaPhase::Prepared);

        assert!(registry.finish(&xid("g"), trx(2)).is_none());
        assert!(registry.finish(&xid("g"), trx(1)).is_some());
        assert!(registry.is_empty());
    }

    // -----------------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------------

    #[test]
    fn unknown_xid_is_forgotten() {
        let f = fixture();
        assert_eq!(f.search(&xid("nope")).status, XaStatus::NotStartOrForget);
    }

    #[test]
    fn live_branches_answer_first() {
        let f = fixture();
        let slot = SlotAddr::new(1, 1, 96);
        f.registry.attach(xid("g"), trx(5), slot).unwrap();
        let info = f.search(&xid("g"));
        assert_eq!(info.status, XaStatus::Attached);
        assert_eq!(info.slot, XaAddr::new(trx(5), slot.encode()));
        assert!(info.gcn.is_null());

        let proposal = ProposalMark::new(Gcn::new(2400), Csr::Assigned);
        f.registry
            .mark_prepared(&xid("g"), trx(5), proposal, XaBranch::new(2, 2))
            .unwrap();
        let info = f.search(&xid("g"));
        assert_eq!(info.status, XaStatus::DetachedPrepare);
        assert_eq!(info.proposal(), proposal);
        assert_eq!(info.branch, XaBranch::new(2, 2));
    }

    #[test]
    fn finished_branches_report_outcome() {
        let f = fixture();
        let committed = f.finish(&xid("c"), trx(7), 2000, false);
        f.finish(&xid("r"), trx(8), 2001, true);

        let info = f.search(&xid("c"));
        assert_eq!(info.status, XaStatus::Commit);
        assert_eq!(info.gcn, Gcn::new(3000));
        assert_eq!(info.csr, Csr::Assigned);
        assert_eq!(info.slot, XaAddr::new(trx(7), committed.encode()));
        assert_eq!(info.branch, XaBranch::new(3, 1));
        assert_eq!(f.search(&xid("r")).status, XaStatus::Rollback);
    }

    #[test]
    fn newest_branch_wins_and_semi_purge_is_searched() {
        let f = fixture();
        let x = xid("again");
        f.finish(&x, trx(7), 2000, true);
        {
            // Move the first attempt to semi-purge.
            let mut inner = f.rsegs.for_xid(&x).lock();
            inner.advance_purge_cursor();
            let purged = inner.truncate_purged();
            inner.semi_purge.extend(purged);
        }
        assert_eq!(f.search(&x).status, XaStatus::Rollback);
        f.finish(&x, trx(9), 2002, false);
        let info = f.search(&x);
        assert_eq!(info.status, XaStatus::Commit);
        assert_eq!(info.slot.tid, Some(trx(9)));
    }

    #[test]
    fn untagged_slot_is_not_supported() {
        let f = fixture();
        let x = xid("old");
        let addr = f.finish(&x, trx(7), 2000, false);
        let undo = f.slots.undo();
        let mut header: TxnHeader = undo.read_header(addr).unwrap();
        header.ext_flags &= !EXT_ALLOCATED_TAGS;
        undo.write_header(addr, &header).unwrap();
        assert_eq!(f.search(&x).status, XaStatus::NotSupport);
    }
}
