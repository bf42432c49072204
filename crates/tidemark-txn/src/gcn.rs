//! GCN decision at prepare and commit.
//!
//! A transaction's [`GcnDecision`] is filled in once: at prepare for the
//! async-commit path (a proposal), otherwise at commit. Deciding also pushes
//! the system GCN up to the decided value, so a commit that follows in the
//! same commit group always proposes at or above its predecessor:
//!
//! ```text
//! P1, C1, P2, C2  =>  C1.gcn <= P2.proposal <= C2.gcn
//! ```

use std::sync::Arc;

use tidemark_error::{Result, TidemarkError};
use tidemark_types::{Csr, Gcn, GcnEvent, ProposalMark, TrxId, XaAddr, XaBranch};

use crate::clock::TransactionClock;

// ---------------------------------------------------------------------------
// GcnDecision
// ---------------------------------------------------------------------------

/// Per-transaction GCN decision state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcnDecision {
    mark: ProposalMark,
    is_proposal: bool,
    decided: bool,
    pushed_up: bool,
}

impl Default for GcnDecision {
    fn default() -> Self {
        Self::UNDECIDED
    }
}

impl GcnDecision {
    pub const UNDECIDED: Self = Self {
        mark: ProposalMark::NULL,
        is_proposal: false,
        decided: false,
        pushed_up: false,
    };

    /// External GCN handed in at async-commit prepare.
    pub const fn assign_from_ac_prepare(gcn: Gcn) -> Self {
        Self {
            mark: ProposalMark::new(gcn, Csr::Assigned),
            is_proposal: true,
            decided: false,
            pushed_up: false,
        }
    }

    /// External GCN handed in at async-commit commit.
    pub const fn assign_from_ac_commit(gcn: Gcn) -> Self {
        Self {
            mark: ProposalMark::new(gcn, Csr::Assigned),
            is_proposal: false,
            decided: false,
            pushed_up: false,
        }
    }

    /// External GCN set on a plain XA commit; final as given.
    pub const fn assign_from_var(gcn: Gcn) -> Self {
        Self {
            mark: ProposalMark::new(gcn, Csr::Assigned),
            is_proposal: false,
            decided: true,
            pushed_up: false,
        }
    }

    /// GCN carried by a replicated event; final as given.
    pub const fn assign_from_event(mark: ProposalMark, is_proposal: bool) -> Self {
        Self {
            mark,
            is_proposal,
            decided: true,
            pushed_up: false,
        }
    }

    pub const fn mark(&self) -> ProposalMark {
        self.mark
    }

    pub const fn gcn(&self) -> Gcn {
        self.mark.gcn
    }

    pub const fn csr(&self) -> Csr {
        self.mark.csr
    }

    pub const fn is_proposal(&self) -> bool {
        self.is_proposal
    }

    pub const fn is_decided(&self) -> bool {
        self.decided
    }

    pub const fn is_pushed_up(&self) -> bool {
        self.pushed_up
    }

    pub const fn is_null(&self) -> bool {
        self.mark.is_null()
    }

    /// Replication event describing this decision.
    pub fn to_event(&self, branch: XaBranch) -> GcnEvent {
        GcnEvent::new(self.mark.gcn, self.mark.csr, self.is_proposal, branch)
    }

    fn decide_if_null(&mut self, sys: Gcn) {
        self.mark = ProposalMark::new(sys, Csr::Automatic);
        self.is_proposal = false;
        self.decided = true;
        self.pushed_up = true;
    }

    fn decide_if_ac_prepare(&mut self, mark: ProposalMark) {
        self.mark = mark;
        self.is_proposal = true;
        self.decided = true;
        self.pushed_up = false;
    }

    fn decide_if_ac_commit(&mut self, gcn: Gcn, csr: Csr) {
        self.mark = ProposalMark::new(gcn, csr);
        self.is_proposal = false;
        self.decided = true;
        self.pushed_up = false;
    }
}

// ---------------------------------------------------------------------------
// GcnAuthority
// ---------------------------------------------------------------------------

/// Decides GCNs and owns the rules for external commit numbers.
#[derive(Debug)]
pub struct GcnAuthority {
    clock: Arc<TransactionClock>,
}

impl GcnAuthority {
    pub fn new(clock: Arc<TransactionClock>) -> Self {
        Self { clock }
    }

    pub fn clock(&self) -> &Arc<TransactionClock> {
        &self.clock
    }

    /// Reject null or pre-initial external GCNs.
    pub fn validate_gcn(gcn: Gcn) -> Result<Gcn> {
        if gcn.is_valid_external() {
            Ok(gcn)
        } else {
            Err(TidemarkError::InvalidGcn {
                gcn: gcn.get(),
                min: Gcn::INITIAL.get(),
                max: Gcn::MAX.get(),
            })
        }
    }

    /// Check participant counts: `0 < n_local <= n_global <= u16::MAX`.
    pub fn validate_branch(n_global: u64, n_local: u64) -> Result<XaBranch> {
        let max = u64::from(u16::MAX);
        if n_global > max || n_local > max {
            return Err(TidemarkError::TooManyParticipants {
                requested: n_global.max(n_local),
                max,
            });
        }
        if n_global == 0 || n_local == 0 || n_local > n_global {
            return Err(TidemarkError::InvalidBranch { n_global, n_local });
        }
        #[allow(clippy::cast_possible_truncation)]
        Ok(XaBranch::new(n_global as u16, n_local as u16))
    }

    /// Raise the system GCN to the decided value, once per transaction.
    pub fn push_up(&self, decision: &mut GcnDecision) {
        if decision.pushed_up || decision.is_null() {
            return;
        }
        let prev = self.clock.push_up_gcn(decision.gcn());
        decision.pushed_up = true;
        if prev < decision.gcn() {
            tracing::debug!(
                from = prev.get(),
                to = decision.gcn().get(),
                "system gcn pushed up"
            );
        }
    }

    /// Decide the proposal at prepare.
    ///
    /// Without an external GCN the proposal is the system GCN (AUTOMATIC).
    /// With one, the larger of the two wins; the source is ASSIGNED only if
    /// the external value won.
    pub fn decide_at_prepare(
        &self,
        decision: &mut GcnDecision,
        external: Option<Gcn>,
    ) -> Result<ProposalMark> {
        if let Some(gcn) = external {
            Self::validate_gcn(gcn)?;
        }
        if decision.decided {
            self.push_up(decision);
            return Ok(decision.mark);
        }
        let sys = self.clock.load_gcn();
        let mark = match external {
            Some(ext) if ext >= sys => ProposalMark::new(ext, Csr::Assigned),
            _ => ProposalMark::new(sys, Csr::Automatic),
        };
        decision.decide_if_ac_prepare(mark);
        self.push_up(decision);
        tracing::debug!(
            gcn = mark.gcn.get(),
            csr = ?mark.csr,
            external = external.map(Gcn::get),
            "gcn proposal decided"
        );
        Ok(mark)
    }

    /// Decide the final commit GCN.
    ///
    /// Without an external GCN: the system GCN (AUTOMATIC). With one and no
    /// proposal: the external value as given (ASSIGNED). With both: the
    /// external value, AUTOMATIC when it exceeds the proposal, otherwise
    /// keeping the proposal's source.
    pub fn decide_at_commit(
        &self,
        decision: &mut GcnDecision,
        external: Option<Gcn>,
    ) -> Result<ProposalMark> {
        if let Some(gcn) = external {
            Self::validate_gcn(gcn)?;
        }
        if decision.decided && !decision.is_proposal {
            self.push_up(decision);
            return Ok(decision.mark);
        }

        let Some(ext) = external else {
            // The system GCN is at or above any proposal, since prepare
            // pushed it up.
            decision.decide_if_null(self.clock.load_gcn());
            return Ok(decision.mark);
        };

        if !decision.is_proposal {
            *decision = GcnDecision::assign_from_var(ext);
            self.push_up(decision);
            return Ok(decision.mark);
        }

        let proposal = decision.mark;
        if ext < proposal.gcn {
            tracing::warn!(
                external = ext.get(),
                proposal = proposal.gcn.get(),
                "commit gcn below its prepare proposal"
            );
        }
        let csr = if ext > proposal.gcn {
            Csr::Automatic
        } else {
            proposal.csr
        };
        decision.decide_if_ac_commit(ext, csr);
        self.push_up(decision);
        Ok(decision.mark)
    }

    /// Apply a GCN replicated from the source.
    pub fn decide_from_event(&self, event: &GcnEvent) -> Result<GcnDecision> {
        let mut decision = if event.has_gcn() {
            Self::validate_gcn(event.gcn())?;
            GcnDecision::assign_from_event(event.mark(), event.is_proposal())
        } else {
            let mut d = GcnDecision::UNDECIDED;
            d.decide_if_null(self.clock.load_gcn());
            d
        };
        self.push_up(&mut decision);
        Ok(decision)
    }

    /// Advance the system GCN without a transaction.
    pub fn advance_gcn_no_flush(&self, gcn: Gcn) -> Result<()> {
        Self::validate_gcn(gcn)?;
        let prev = self.clock.push_up_gcn(gcn);
        tracing::info!(
            from = prev.get(),
            requested = gcn.get(),
            "system gcn advanced without flush"
        );
        Ok(())
    }

    /// Resolve the XA master address at commit. Dropped when there is no
    /// local transaction or when it points at the transaction itself.
    pub fn decide_master_addr(trx: Option<TrxId>, maddr: XaAddr) -> XaAddr {
        if maddr.is_null() {
            return maddr;
        }
        match trx {
            None => XaAddr::NULL,
            Some(id) if maddr.tid == Some(id) => XaAddr::NULL,
            Some(_) => maddr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_types::{SlotAddr, Utc};

    use crate::clock::ManualClock;

    fn authority(sys: u64) -> GcnAuthority {
        let wall = Arc::new(ManualClock::new(Utc::from_secs(1)));
        let clock = Arc::new(TransactionClock::new(wall));
        clock.push_up_gcn(Gcn::new(sys));
        GcnAuthority::new(clock)
    }

    fn sys(a: &GcnAuthority) -> u64 {
        a.clock().load_gcn().get()
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    #[test]
    fn gcn_validation() {
        assert!(GcnAuthority::validate_gcn(Gcn::INITIAL).is_ok());
        for bad in [Gcn::NULL, Gcn::new(0), Gcn::new(1023)] {
            assert!(matches!(
                GcnAuthority::validate_gcn(bad),
                Err(TidemarkError::InvalidGcn { .. })
            ));
        }
    }

    #[test]
    fn branch_validation() {
        assert_eq!(
            GcnAuthority::validate_branch(3, 2).unwrap(),
            XaBranch::new(3, 2)
        );
        assert_eq!(
            GcnAuthority::validate_branch(65_535, 65_535).unwrap(),
            XaBranch::new(65_535, 65_535)
        );
        assert!(matches!(
            GcnAuthority::validate_branch(65_536, 1),
            Err(TidemarkError::TooManyParticipants {
                requested: 65_536,
                ..
            })
        ));
        for (g, l) in [(0, 0), (0, 1), (3, 0), (2, 3)] {
            assert!(matches!(
                GcnAuthority::validate_branch(g, l),
                Err(TidemarkError::InvalidBranch { .. })
            ));
        }
    }

    // -----------------------------------------------------------------------
    // Prepare
    // -----------------------------------------------------------------------

    #[test]
    fn prepare_without_external_is_automatic() {
        let a = authority(2000);
        let mut d = GcnDecision::default();
        let mark = a.decide_at_prepare(&mut d, None).unwrap();
        assert_eq!(mark, ProposalMark::new(Gcn::new(2000), Csr::Automatic));
        assert!(d.is_proposal() && d.is_decided() && d.is_pushed_up());
    }

    #[test]
    fn prepare_system_wins() {
        let a = authority(1090);
        let mut d = GcnDecision::default();
        let mark = a.decide_at_prepare(&mut d, Some(Gcn::new(1085))).unwrap();
        assert_eq!(mark, ProposalMark::new(Gcn::new(1090), Csr::Automatic));
        assert_eq!(sys(&a), 1090);
    }

    #[test]
    fn prepare_external_wins_and_pushes_up() {
        let a = authority(1090);
        let mut d = GcnDecision::default();
        let mark = a.decide_at_prepare(&mut d, Some(Gcn::new(1500))).unwrap();
        assert_eq!(mark, ProposalMark::new(Gcn::new(1500), Csr::Assigned));
        assert_eq!(sys(&a), 1500);
    }

    #[test]
    fn prepare_is_idempotent() {
        let a = authority(2000);
        let mut d = GcnDecision::default();
        let first = a.decide_at_prepare(&mut d, Some(Gcn::new(2500))).unwrap();
        let again = a.decide_at_prepare(&mut d, Some(Gcn::new(9000))).unwrap();
        assert_eq!(first, again);
        assert_eq!(sys(&a), 2500);
    }

    // -----------------------------------------------------------------------
    // Commit
    // -----------------------------------------------------------------------

    #[test]
    fn commit_without_external_loads_system() {
        let a = authority(3000);
        let mut d = GcnDecision::default();
        let mark = a.decide_at_commit(&mut d, None).unwrap();
        assert_eq!(mark, ProposalMark::new(Gcn::new(3000), Csr::Automatic));
        assert!(!d.is_proposal());
    }

    #[test]
    fn plain_xa_commit_takes_external_as_assigned() {
        let a = authority(3000);
        let mut d = GcnDecision::default();
        let mark = a.decide_at_commit(&mut d, Some(Gcn::new(2500))).unwrap();
        assert_eq!(mark, ProposalMark::new(Gcn::new(2500), Csr::Assigned));
        assert_eq!(sys(&a), 3000);
        let mark = a.decide_at_commit(&mut d, Some(Gcn::new(4000))).unwrap();
        assert_eq!(mark.gcn, Gcn::new(2500), "decided once");
    }

    #[test]
    fn async_commit_scenario_keeps_order() {
        let a = authority(1090);
        let mut d = GcnDecision::default();
        let proposal = a.decide_at_prepare(&mut d, Some(Gcn::new(1085))).unwrap();
        assert_eq!(proposal, ProposalMark::new(Gcn::new(1090), Csr::Automatic));

        // An unrelated commit bumps the system gcn.
        let mut other = GcnDecision::default();
        a.decide_at_commit(&mut other, Some(Gcn::new(1100))).unwrap();
        assert_eq!(sys(&a), 1100);

        let commit = a.decide_at_commit(&mut d, Some(Gcn::new(1100))).unwrap();
        assert_eq!(commit, ProposalMark::new(Gcn::new(1100), Csr::Automatic));
        assert!(proposal.gcn <= commit.gcn);
    }

    #[test]
    fn async_commit_equal_keeps_proposal_source() {
        let a = authority(1090);
        let mut d = GcnDecision::default();
        a.decide_at_prepare(&mut d, Some(Gcn::new(1500))).unwrap();
        let commit = a.decide_at_commit(&mut d, Some(Gcn::new(1500))).unwrap();
        assert_eq!(commit, ProposalMark::new(Gcn::new(1500), Csr::Assigned));
    }

    #[test]
    fn prepared_commit_without_external_loads_system() {
        let a = authority(1090);
        let mut d = GcnDecision::default();
        let proposal = a.decide_at_prepare(&mut d, Some(Gcn::new(1500))).unwrap();
        let commit = a.decide_at_commit(&mut d, None).unwrap();
        assert_eq!(commit, ProposalMark::new(Gcn::new(1500), Csr::Automatic));
        assert_eq!(commit.gcn, proposal.gcn);
        assert!(!d.is_proposal());
    }

    #[test]
    fn later_commit_never_takes_stale_proposal() {
        let a = authority(1024);
        let mut slow = GcnDecision::default();
        let proposal = a.decide_at_prepare(&mut slow, None).unwrap();
        assert_eq!(proposal.gcn, Gcn::new(1024));

        let mut fast = GcnDecision::default();
        let c1 = a.decide_at_commit(&mut fast, Some(Gcn::new(1500))).unwrap();
        let c2 = a.decide_at_commit(&mut slow, None).unwrap();
        assert_eq!(c2, ProposalMark::new(Gcn::new(1500), Csr::Automatic));
        assert!(c1.gcn <= c2.gcn);
    }

    #[test]
    fn causal_order_across_transactions() {
        let a = authority(2000);
        let mut t1 = GcnDecision::default();
        let mut t2 = GcnDecision::default();
        a.decide_at_prepare(&mut t1, Some(Gcn::new(2100))).unwrap();
        let c1 = a.decide_at_commit(&mut t1, Some(Gcn::new(2200))).unwrap();
        let p2 = a.decide_at_prepare(&mut t2, None).unwrap();
        let c2 = a.decide_at_commit(&mut t2, None).unwrap();
        assert!(c1.gcn <= p2.gcn);
        assert!(p2.gcn <= c2.gcn);
    }

    #[test]
    fn invalid_external_rejected_before_state_change() {
        let a = authority(2000);
        let mut d = GcnDecision::default();
        assert!(a.decide_at_commit(&mut d, Some(Gcn::new(5))).is_err());
        assert!(!d.is_decided());
        assert!(a.advance_gcn_no_flush(Gcn::NULL).is_err());
        a.advance_gcn_no_flush(Gcn::new(5000)).unwrap();
        assert_eq!(sys(&a), 5000);
    }

    // -----------------------------------------------------------------------
    // Events and master address
    // -----------------------------------------------------------------------

    #[test]
    fn event_decision_is_final() {
        let a = authority(2000);
        let ev = GcnEvent::new(Gcn::new(2600), Csr::Assigned, false, XaBranch::NULL);
        let d = a.decide_from_event(&ev).unwrap();
        assert!(d.is_decided() && d.is_pushed_up());
        assert_eq!(d.mark(), ProposalMark::new(Gcn::new(2600), Csr::Assigned));
        assert_eq!(sys(&a), 2600);
        assert_eq!(d.to_event(XaBranch::NULL), ev);

        let empty = a.decide_from_event(&GcnEvent::EMPTY).unwrap();
        assert_eq!(empty.csr(), Csr::Automatic);
        assert_eq!(empty.gcn(), Gcn::new(2600));
    }

    #[test]
    fn master_addr_resolution() {
        let me = TrxId::new(5).unwrap();
        let other = TrxId::new(6).unwrap();
        let slot = SlotAddr::new(1, 2, 96).encode();
        let theirs = XaAddr::new(other, slot);
        let mine = XaAddr::new(me, slot);
        assert_eq!(GcnAuthority::decide_master_addr(Some(me), theirs), theirs);
        assert!(GcnAuthority::decide_master_addr(Some(me), mine).is_null());
        assert!(GcnAuthority::decide_master_addr(None, theirs).is_null());
        assert!(GcnAuthority::decide_master_addr(Some(me), XaAddr::NULL).is_null());
    }
}
