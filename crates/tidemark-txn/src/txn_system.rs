//! The transaction system: the surface a storage engine drives.
//!
//! [`TxnSystem`] owns the clock, the rollback segments, the resolver and the
//! two GC schedulers. Foreground calls (`begin`, `write_row`, `commit`,
//! `read_row`, ...) never wait for GC; the background worker drains purge
//! and erase in scn order and is cancellable between segments.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tidemark_error::{Result, TidemarkError};
use tidemark_observability::{
    GcObserver, NoOpObserver, PurgeStatus, RsegStat, TruncStatus, TxnStats, TxnStatsSnapshot,
};
use tidemark_types::{
    CommitMark, Csr, Gcn, GcnEvent, LookupStatus, ProposalMark, RowPos, RsegId, Scn, SlotAddr,
    TableId, TrxId, TxnLookupResult, TxnRecord, XaAddr, XaBranch, XaInfo, Xid,
};

use crate::cleanout::{CommitCleanout, ScanCleanout};
use crate::clock::{TransactionClock, WallClock};
use crate::commit_cache::{CacheEntry, CommitCache, InsertOrigin};
use crate::config::{CacheLevel, TxnConfig};
use crate::erase::{EraseBatchResult, EraseScheduler};
use crate::gc_heap::GcHeap;
use crate::gcn::{GcnAuthority, GcnDecision};
use crate::heartbeat::HeartbeatFreezer;
use crate::mem_store::{MemRowStore, MemUndoStore};
use crate::purge::{GcContext, PurgeBatchResult, PurgeScheduler};
use crate::resolver::TxnResolver;
use crate::rseg::{LogRef, RsegSet};
use crate::safe_mode::LiveHeaderSet;
use crate::storage::{RowKey, RowStore, UndoRecord, UndoRecordKind, UndoStore};
use crate::txn_slot::{SlotCommit, TxnSlots};
use crate::vision::{ReadView, ViewRegistry};
use crate::watermark::GcWatermarks;
use crate::xa::{XaRegistry, search_transaction_info};

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnPhase {
    Active,
    Prepared,
    Committed,
    RolledBack,
}

/// A transaction handle, owned by the session that began it.
///
/// The TXN slot is allocated lazily: on the first write, on XA attach, or at
/// prepare/commit of an XA branch. A transaction that never needs one
/// commits without touching any segment.
#[derive(Debug)]
pub struct Transaction {
    trx_id: TrxId,
    phase: TxnPhase,
    slot: Option<(RsegId, SlotAddr)>,
    temp_slot: Option<(RsegId, SlotAddr)>,
    /// Image the slot held before this transaction reused it.
    reused_image: Option<CommitMark>,
    undo_no: u64,
    xid: Option<Xid>,
    decision: GcnDecision,
    proposal: ProposalMark,
    branch: XaBranch,
    ac_prepare: bool,
    cleanout: CommitCleanout,
}

impl Transaction {
    fn new(trx_id: TrxId, commit_max_rows: usize) -> Self {
        Self {
            trx_id,
            phase: TxnPhase::Active,
            slot: None,
            temp_slot: None,
            reused_image: None,
            undo_no: 0,
            xid: None,
            decision: GcnDecision::UNDECIDED,
            proposal: ProposalMark::NULL,
            branch: XaBranch::NULL,
            ac_prepare: false,
            cleanout: CommitCleanout::new(commit_max_rows),
        }
    }

    pub fn trx_id(&self) -> TrxId {
        self.trx_id
    }

    pub fn phase(&self) -> TxnPhase {
        self.phase
    }

    pub fn slot(&self) -> Option<SlotAddr> {
        self.slot.map(|(_, addr)| addr)
    }

    pub fn rseg_id(&self) -> Option<RsegId> {
        self.slot.map(|(id, _)| id)
    }

    pub fn reused_image(&self) -> Option<CommitMark> {
        self.reused_image
    }

    pub fn xid(&self) -> Option<&Xid> {
        self.xid.as_ref()
    }

    pub fn decision(&self) -> &GcnDecision {
        &self.decision
    }

    pub fn branch(&self) -> XaBranch {
        self.branch
    }

    fn ensure_active(&self) -> Result<()> {
        if self.phase == TxnPhase::Active {
            Ok(())
        } else {
            Err(TidemarkError::TxnNotActive {
                trx_id: self.trx_id.get(),
            })
        }
    }

    /// Active or prepared.
    fn ensure_open(&self) -> Result<()> {
        if matches!(self.phase, TxnPhase::Active | TxnPhase::Prepared) {
            Ok(())
        } else {
            Err(TidemarkError::TxnNotActive {
                trx_id: self.trx_id.get(),
            })
        }
    }

    fn next_undo_no(&mut self) -> u64 {
        let n = self.undo_no;
        self.undo_no += 1;
        n
    }
}

/// Row modification kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOp {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrepareArgs {
    /// GCN supplied by the coordinator.
    pub gcn: Option<Gcn>,
    /// `(n_global, n_local)` participant counts.
    pub branch: Option<(u64, u64)>,
    pub async_commit: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitArgs {
    pub gcn: Option<Gcn>,
    pub branch: Option<(u64, u64)>,
    /// Slot of the master branch, for slave branches.
    pub maddr: XaAddr,
    pub async_commit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    /// `CommitMark::NULL` for a transaction that wrote nothing.
    pub image: CommitMark,
    pub is_slave: bool,
    pub rows_cleaned: u64,
    /// Event to replicate alongside the commit.
    pub event: Option<GcnEvent>,
}

impl CommitOutcome {
    const READ_ONLY: Self = Self {
        image: CommitMark::NULL,
        is_slave: false,
        rows_cleaned: 0,
        event: None,
    };
}

/// A row as seen through a read view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowVersion {
    pub pos: RowPos,
    /// The row's reference, stamped when resolution finished it.
    pub rec: TxnRecord,
    pub lookup: TxnLookupResult,
    pub visible: bool,
}

// ---------------------------------------------------------------------------
// GC worker
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct WorkerSignal {
    wake: Mutex<bool>,
    cv: Condvar,
}

impl WorkerSignal {
    fn notify(&self) {
        *self.wake.lock() = true;
        self.cv.notify_one();
    }

    fn wait(&self, timeout: Duration) {
        let mut wake = self.wake.lock();
        if !*wake {
            let _ = self.cv.wait_for(&mut wake, timeout);
        }
        *wake = false;
    }
}

fn gc_loop(
    purge: &PurgeScheduler,
    erase: &EraseScheduler,
    cancel: &AtomicBool,
    signal: &WorkerSignal,
    interval: Duration,
) {
    tracing::info!(interval_ms = interval.as_millis(), "gc worker started");
    while !cancel.load(Ordering::Acquire) {
        let purged = purge.run_batch(cancel);
        let erased = erase.run_batch(cancel);
        let idle = purged.logs_purged == 0 && erased.logs_erased == 0;
        if idle || purged.stalled || purged.frozen {
            signal.wait(interval);
        }
    }
    tracing::info!("gc worker stopped");
}

// ---------------------------------------------------------------------------
// TxnSystem
// ---------------------------------------------------------------------------

pub struct TxnSystem {
    config: TxnConfig,
    clock: Arc<TransactionClock>,
    authority: GcnAuthority,
    freezer: Arc<HeartbeatFreezer>,
    rows: Arc<dyn RowStore>,
    slots: Arc<TxnSlots>,
    rsegs: Arc<RsegSet>,
    views: Arc<ViewRegistry>,
    watermarks: Arc<GcWatermarks>,
    stats: Arc<TxnStats>,
    cache: Option<Arc<CommitCache>>,
    resolver: TxnResolver,
    purge: Arc<PurgeScheduler>,
    erase: Arc<EraseScheduler>,
    xa: XaRegistry,
    next_trx_id: AtomicU64,
    cancel: Arc<AtomicBool>,
    signal: Arc<WorkerSignal>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TxnSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnSystem")
            .field("clock", &self.clock)
            .field("rsegs", &self.rsegs.all().len())
            .field("safe_mode", &self.resolver.is_safe_mode())
            .finish_non_exhaustive()
    }
}

impl TxnSystem {
    pub fn new(
        config: TxnConfig,
        undo: Arc<dyn UndoStore>,
        rows: Arc<dyn RowStore>,
        wall: Arc<dyn WallClock>,
    ) -> Result<Self> {
        Self::with_observer(config, undo, rows, wall, Arc::new(NoOpObserver))
    }

    /// In-memory stores, for tests and tools.
    pub fn in_memory(config: TxnConfig, wall: Arc<dyn WallClock>) -> Result<Self> {
        Self::new(
            config,
            Arc::new(MemUndoStore::new()),
            Arc::new(MemRowStore::default()),
            wall,
        )
    }

    pub fn with_observer(
        config: TxnConfig,
        undo: Arc<dyn UndoStore>,
        rows: Arc<dyn RowStore>,
        wall: Arc<dyn WallClock>,
        observer: Arc<dyn GcObserver>,
    ) -> Result<Self> {
        config.validate()?;
        let clock = Arc::new(TransactionClock::new(Arc::clone(&wall)));
        let stats = Arc::new(TxnStats::new());
        let live = config
            .cleanout
            .safe_mode
            .then(|| Arc::new(LiveHeaderSet::new()));
        let slots = Arc::new(TxnSlots::new(Arc::clone(&undo), live.clone()));
        let rsegs = Arc::new(RsegSet::new(&config.rollback_segments));
        let views = Arc::new(ViewRegistry::new(Arc::clone(&clock)));
        let watermarks = Arc::new(GcWatermarks::new());
        let cache = (config.commit_cache.level != CacheLevel::None)
            .then(|| Arc::new(CommitCache::new(&config.commit_cache, Arc::clone(&stats))));
        let resolver = TxnResolver::new(
            undo,
            live,
            Arc::clone(&watermarks),
            cache.clone(),
            Arc::clone(&stats),
        );
        let freezer = Arc::new(HeartbeatFreezer::new(
            config.heartbeat.freeze_enabled,
            config.heartbeat.timeout(),
            wall,
        ));
        let ctx = GcContext {
            rsegs: Arc::clone(&rsegs),
            slots: Arc::clone(&slots),
            views: Arc::clone(&views),
            watermarks: Arc::clone(&watermarks),
            stats: Arc::clone(&stats),
            observer,
        };
        let erase_heap = Arc::new(GcHeap::new());
        let purge = Arc::new(PurgeScheduler::new(
            ctx.clone(),
            Arc::clone(&erase_heap),
            Arc::clone(&rows),
            Arc::clone(&freezer),
            config.gc.clone(),
        ));
        let erase = Arc::new(EraseScheduler::new(
            ctx,
            erase_heap,
            Arc::clone(&clock),
            config.retention(),
            config.gc.clone(),
        ));
        clock.start();
        tracing::info!(
            txn_rsegs = config.rollback_segments.txn_rsegs,
            temp_rsegs = config.rollback_segments.temp_rsegs,
            cache = ?config.commit_cache.level,
            safe_mode = config.cleanout.safe_mode,
            retention_secs = config.retention_secs,
            "transaction system opened"
        );
        Ok(Self {
            authority: GcnAuthority::new(Arc::clone(&clock)),
            config,
            clock,
            freezer,
            rows,
            slots,
            rsegs,
            views,
            watermarks,
            stats,
            cache,
            resolver,
            purge,
            erase,
            xa: XaRegistry::new(),
            next_trx_id: AtomicU64::new(1),
            cancel: Arc::new(AtomicBool::new(false)),
            signal: Arc::new(WorkerSignal::default()),
            worker: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &TxnConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<TransactionClock> {
        &self.clock
    }

    pub fn authority(&self) -> &GcnAuthority {
        &self.authority
    }

    pub fn resolver(&self) -> &TxnResolver {
        &self.resolver
    }

    pub fn commit_cache(&self) -> Option<&Arc<CommitCache>> {
        self.cache.as_ref()
    }

    pub fn rows(&self) -> &Arc<dyn RowStore> {
        &self.rows
    }

    pub fn undo(&self) -> &Arc<dyn UndoStore> {
        self.slots.undo()
    }

    pub fn rsegs(&self) -> &RsegSet {
        &self.rsegs
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    pub fn begin(&self) -> Result<Transaction> {
        self.clock.ensure_running()?;
        let raw = self.next_trx_id.fetch_add(1, Ordering::Relaxed);
        let trx_id = TrxId::new(raw).ok_or_else(|| {
            TidemarkError::internal(format!("transaction id space exhausted at {raw}"))
        })?;
        tracing::trace!(trx_id = raw, "transaction begun");
        Ok(Transaction::new(trx_id, self.config.cleanout.commit_max_rows))
    }

    fn check_dml(&self) -> Result<()> {
        self.freezer.check_dml().inspect_err(|_| {
            TxnStats::incr(&self.stats.heartbeat_freeze_rejects);
        })
    }

    fn ensure_slot(&self, txn: &mut Transaction) -> Result<SlotAddr> {
        if let Some((_, addr)) = txn.slot {
            return Ok(addr);
        }
        let rseg = match &txn.xid {
            Some(xid) => self.rsegs.for_xid(xid),
            None => self.rsegs.pick_txn(),
        };
        let allocated = rseg.allocate_slot(&self.slots, txn.trx_id)?;
        txn.slot = Some((rseg.id(), allocated.addr));
        txn.reused_image = allocated.prev_image;
        Ok(allocated.addr)
    }

    fn ensure_temp_slot(&self, txn: &mut Transaction) -> Result<Option<SlotAddr>> {
        if let Some((_, addr)) = txn.temp_slot {
            return Ok(Some(addr));
        }
        let Some(rseg) = self.rsegs.pick_temp() else {
            return Ok(None);
        };
        let allocated = rseg.allocate_slot(&self.slots, txn.trx_id)?;
        txn.temp_slot = Some((rseg.id(), allocated.addr));
        Ok(Some(allocated.addr))
    }

    /// Bind an XID to the transaction. Its slot lives in the segment the XID
    /// maps to, so attach must come before the first write.
    pub fn xa_attach(&self, txn: &mut Transaction, xid: Xid) -> Result<()> {
        txn.ensure_active()?;
        if let Some(current) = &txn.xid {
            if *current == xid {
                return Ok(());
            }
            return Err(TidemarkError::xid_mismatch(format!(
                "trx {} is already attached to {current}",
                txn.trx_id
            )));
        }
        if let Some(live) = self.xa.get(&xid) {
            if live.trx_id != txn.trx_id {
                return Err(TidemarkError::xid_mismatch(format!(
                    "{xid} is held by trx {}",
                    live.trx_id
                )));
            }
        }
        let home = self.rsegs.for_xid(&xid).id();
        if let Some((rseg_id, _)) = txn.slot {
            if rseg_id != home {
                return Err(TidemarkError::xid_mismatch(format!(
                    "trx {} already writes to segment {rseg_id}, {xid} belongs to {home}",
                    txn.trx_id
                )));
            }
        }
        txn.xid = Some(xid.clone());
        let addr = match self.ensure_slot(txn) {
            Ok(addr) => addr,
            Err(err) => {
                txn.xid = None;
                return Err(err);
            }
        };
        if let Err(err) = self.xa.attach(xid.clone(), txn.trx_id, addr) {
            txn.xid = None;
            return Err(err);
        }
        self.slots.attach_xid(addr, &xid)?;
        tracing::debug!(trx_id = txn.trx_id.get(), %xid, rseg_id = home, "xa branch attached");
        Ok(())
    }

    pub fn write_row(
        &self,
        txn: &mut Transaction,
        table: TableId,
        key: RowKey,
        op: RowOp,
    ) -> Result<RowPos> {
        self.clock.ensure_running()?;
        txn.ensure_active()?;
        self.check_dml()?;
        let addr = self.ensure_slot(txn)?;
        let prev = self
            .rows
            .search(table, key)
            .and_then(|pos| self.rows.txn_record(pos));
        let kind = match (op, prev) {
            (RowOp::Delete, None) => {
                return Err(TidemarkError::internal(format!(
                    "delete of missing row {table}/{key}"
                )));
            }
            (RowOp::Delete, Some(_)) => UndoRecordKind::DelMark,
            (_, None) => UndoRecordKind::Insert,
            (_, Some(_)) => UndoRecordKind::UpdExist { ord_change: false },
        };
        let pos = self.rows.write_row(
            table,
            key,
            TxnRecord::active(txn.trx_id, addr),
            op == RowOp::Delete,
        );
        let undo_no = txn.next_undo_no();
        self.slots.undo().append_record(
            addr,
            UndoRecord {
                undo_no,
                kind,
                table,
                key,
                hint: Some(pos),
                prev,
            },
        )?;
        txn.cleanout.push(pos, &self.stats);
        Ok(pos)
    }

    /// Write a temporary-table row. It is stamped finished right away and
    /// its undo goes to a temporary segment, if any are configured.
    pub fn write_temp_row(&self, txn: &mut Transaction, table: TableId, key: RowKey) -> Result<RowPos> {
        self.clock.ensure_running()?;
        txn.ensure_active()?;
        self.check_dml()?;
        let prev = self
            .rows
            .search(table, key)
            .and_then(|pos| self.rows.txn_record(pos));
        let pos = self
            .rows
            .write_row(table, key, TxnRecord::temporary(txn.trx_id), false);
        if let Some(addr) = self.ensure_temp_slot(txn)? {
            let undo_no = txn.next_undo_no();
            self.slots.undo().append_record(
                addr,
                UndoRecord {
                    undo_no,
                    kind: if prev.is_some() {
                        UndoRecordKind::UpdExist { ord_change: false }
                    } else {
                        UndoRecordKind::Insert
                    },
                    table,
                    key,
                    hint: Some(pos),
                    prev,
                },
            )?;
        }
        Ok(pos)
    }

    /// First phase of two-phase commit: decide and record the GCN proposal.
    pub fn prepare(&self, txn: &mut Transaction, args: &PrepareArgs) -> Result<ProposalMark> {
        self.clock.ensure_running()?;
        txn.ensure_active()?;
        if let Some((n_global, n_local)) = args.branch {
            txn.branch = GcnAuthority::validate_branch(n_global, n_local)?;
        }
        let addr = self.ensure_slot(txn)?;
        let proposal = self.authority.decide_at_prepare(&mut txn.decision, args.gcn)?;
        self.slots.set_proposal(addr, proposal, args.async_commit)?;
        txn.proposal = proposal;
        txn.ac_prepare = args.async_commit;
        if let Some(xid) = &txn.xid {
            self.xa
                .mark_prepared(xid, txn.trx_id, proposal, txn.branch)?;
        }
        txn.phase = TxnPhase::Prepared;
        tracing::debug!(
            trx_id = txn.trx_id.get(),
            gcn = proposal.gcn.get(),
            csr = ?proposal.csr,
            "transaction prepared"
        );
        Ok(proposal)
    }

    /// Adopt the GCN carried by a replicated commit event. Waits while the
    /// coordinator heartbeat is missing.
    pub fn apply_gcn_event(&self, txn: &mut Transaction, event: &GcnEvent) -> Result<()> {
        txn.ensure_open()?;
        self.freezer.wait_while_frozen_for_apply(&self.cancel)?;
        txn.decision = self.authority.decide_from_event(event)?;
        if event.has_branch() {
            let branch = event.branch();
            txn.branch = GcnAuthority::validate_branch(
                u64::from(branch.n_global),
                u64::from(branch.n_local),
            )?;
        }
        Ok(())
    }

    /// Decode a GCN event from the replication log and adopt it. Returns the
    /// number of bytes consumed.
    pub fn apply_gcn_event_bytes(&self, txn: &mut Transaction, data: &[u8]) -> Result<usize> {
        let (event, used) = GcnEvent::from_bytes(data).inspect_err(|err| {
            tracing::warn!(trx_id = txn.trx_id.get(), %err, "malformed GCN event");
        })?;
        self.apply_gcn_event(txn, &event)?;
        Ok(used)
    }

    pub fn commit(&self, txn: &mut Transaction, args: &CommitArgs) -> Result<CommitOutcome> {
        self.clock.ensure_running()?;
        txn.ensure_open()?;
        if let Some(gcn) = args.gcn {
            GcnAuthority::validate_gcn(gcn)?;
        }
        let branch = match args.branch {
            Some((n_global, n_local)) => GcnAuthority::validate_branch(n_global, n_local)?,
            None => txn.branch,
        };
        if txn.slot.is_none() && txn.temp_slot.is_none() && txn.xid.is_none() {
            txn.phase = TxnPhase::Committed;
            return Ok(CommitOutcome::READ_ONLY);
        }

        let addr = self.ensure_slot(txn)?;
        let mark = self.authority.decide_at_commit(&mut txn.decision, args.gcn)?;
        let maddr = GcnAuthority::decide_master_addr(Some(txn.trx_id), args.maddr);
        let is_slave = maddr.is_valid();
        let info = SlotCommit {
            image: CommitMark::NULL,
            rollback: false,
            xid: txn.xid.clone(),
            branch,
            maddr,
            proposal: txn.proposal,
            ac_prepare: txn.ac_prepare,
            ac_commit: args.async_commit,
        };
        let (rseg_id, image) = self.commit_slot(txn, addr, mark, info)?;
        self.commit_temp(txn, false)?;

        let rows_cleaned = if self.config.cleanout.disabled {
            txn.cleanout.clear();
            0
        } else {
            txn.cleanout
                .flush(self.rows.as_ref(), txn.trx_id, &image, is_slave, &self.stats)
        };
        if let Some(cache) = &self.cache {
            cache.insert(
                CacheEntry::new(txn.trx_id, &image, is_slave, LookupStatus::Committed),
                InsertOrigin::Commit,
            );
        }
        if let Some(xid) = &txn.xid {
            self.xa.finish(xid, txn.trx_id);
        }
        txn.branch = branch;
        txn.phase = TxnPhase::Committed;
        tracing::debug!(
            trx_id = txn.trx_id.get(),
            rseg_id,
            scn = image.scn.get(),
            gcn = image.gcn.get(),
            csr = ?image.csr,
            is_slave,
            rows_cleaned,
            "transaction committed"
        );
        Ok(CommitOutcome {
            image,
            is_slave,
            rows_cleaned,
            event: Some(txn.decision.to_event(branch)),
        })
    }

    /// Stamp the commit image under the segment lock and publish the log.
    /// The scn is allocated under the same lock, so each history list stays
    /// in scn order.
    fn commit_slot(
        &self,
        txn: &Transaction,
        addr: SlotAddr,
        mark: ProposalMark,
        mut info: SlotCommit,
    ) -> Result<(RsegId, CommitMark)> {
        let rseg_id = txn
            .rseg_id()
            .ok_or_else(|| TidemarkError::internal("committing without a slot"))?;
        let rseg = self.rsegs.get(rseg_id)?;
        let mut inner = rseg.lock();
        let scn = self.clock.next_scn();
        info.image = CommitMark::new(scn, self.clock.now(), mark.gcn, mark.csr);
        self.slots.commit(addr, &info)?;
        inner.append_history(LogRef::from_image(addr, txn.trx_id, &info.image));
        self.purge.enqueue(rseg_id, &mut inner, scn);
        Ok((rseg_id, info.image))
    }

    /// Temporary undo is ordered by its own scn; temporary rows never
    /// resolve through it.
    fn commit_temp(&self, txn: &Transaction, rollback: bool) -> Result<()> {
        let Some((rseg_id, addr)) = txn.temp_slot else {
            return Ok(());
        };
        let rseg = self.rsegs.get(rseg_id)?;
        let mut inner = rseg.lock();
        let scn = self.clock.next_scn();
        let image = CommitMark::new(scn, self.clock.now(), self.clock.load_gcn(), Csr::Automatic);
        let mut info = SlotCommit::plain(image);
        info.rollback = rollback;
        self.slots.commit(addr, &info)?;
        inner.append_history(LogRef::from_image(addr, txn.trx_id, &image));
        self.purge.enqueue(rseg_id, &mut inner, scn);
        Ok(())
    }

    /// Undo every change, then finish the slot with the rollback tag so an
    /// XA search can still report the outcome.
    pub fn rollback(&self, txn: &mut Transaction) -> Result<()> {
        self.clock.ensure_running()?;
        txn.ensure_open()?;
        for (_, addr) in txn.slot.iter().chain(txn.temp_slot.iter()) {
            self.undo_rows(*addr);
        }
        if let Some((_, addr)) = txn.slot {
            let mut decision = GcnDecision::UNDECIDED;
            let mark = self.authority.decide_at_commit(&mut decision, None)?;
            let mut info = SlotCommit::plain(CommitMark::NULL);
            info.rollback = true;
            info.xid = txn.xid.clone();
            info.branch = txn.branch;
            self.commit_slot(txn, addr, mark, info)?;
        }
        self.commit_temp(txn, true)?;
        if let Some(xid) = &txn.xid {
            self.xa.finish(xid, txn.trx_id);
        }
        txn.cleanout.clear();
        txn.phase = TxnPhase::RolledBack;
        tracing::debug!(trx_id = txn.trx_id.get(), "transaction rolled back");
        Ok(())
    }

    fn undo_rows(&self, addr: SlotAddr) {
        let undo = self.slots.undo();
        for rec in undo.records(addr).iter().rev() {
            if rec.kind == UndoRecordKind::Placeholder {
                continue;
            }
            let pos = rec
                .hint
                .filter(|pos| pos.table() == rec.table && self.rows.row_key(*pos) == Some(rec.key))
                .or_else(|| self.rows.search(rec.table, rec.key));
            if let Some(pos) = pos {
                self.rows.restore_row(pos, rec.prev);
            }
        }
        undo.reset_records(addr);
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn open_view(&self, txn: Option<&Transaction>) -> ReadView {
        self.views.open(txn.map(Transaction::trx_id))
    }

    pub fn close_view(&self, view: &ReadView) {
        self.views.close(view);
    }

    /// Read a row by key, resolving its reference and cleaning it out.
    pub fn read_row(&self, view: &ReadView, table: TableId, key: RowKey) -> Option<RowVersion> {
        let pos = self.rows.search(table, key)?;
        let mut scan = ScanCleanout::new(&self.config.cleanout);
        let version = self.read_at(view, pos, &mut scan);
        scan.flush(self.rows.as_ref(), &self.stats);
        version
    }

    /// Read a row through a secondary entry, trying its page hint first and
    /// refreshing a stale hint.
    pub fn read_via_secondary(
        &self,
        view: &ReadView,
        primary: TableId,
        secondary: RowPos,
    ) -> Option<RowVersion> {
        let key = self.rows.row_key(secondary)?;
        let mut scan = ScanCleanout::new(&self.config.cleanout);
        let hinted = self
            .rows
            .page_hint(secondary)
            .and_then(|page| self.rows.search_page(page, key));
        let pos = if let Some(pos) = hinted {
            TxnStats::incr(&self.stats.page_hint_hit);
            pos
        } else {
            TxnStats::incr(&self.stats.page_hint_miss);
            let pos = self.rows.search(primary, key)?;
            scan.collect_secondary(secondary, pos.page, &self.stats);
            pos
        };
        let version = self.read_at(view, pos, &mut scan);
        scan.flush(self.rows.as_ref(), &self.stats);
        version
    }

    fn read_at(&self, view: &ReadView, pos: RowPos, scan: &mut ScanCleanout) -> Option<RowVersion> {
        let stored = self.rows.txn_record(pos)?;
        let mut rec = stored;
        let lookup = self.resolver.resolve(&mut rec);
        if !stored.is_committed() && rec.is_committed() {
            scan.collect_clustered(pos, &rec, &self.stats);
        }
        Some(RowVersion {
            pos,
            rec,
            lookup,
            visible: view.sees(&rec, &lookup),
        })
    }

    // -----------------------------------------------------------------------
    // GC
    // -----------------------------------------------------------------------

    pub fn run_purge(&self) -> PurgeBatchResult {
        self.purge.run_batch(&self.cancel)
    }

    pub fn run_erase(&self) -> EraseBatchResult {
        self.erase.run_batch(&self.cancel)
    }

    /// Start the background GC thread. Idempotent.
    pub fn spawn_gc_worker(&self) -> Result<()> {
        self.clock.ensure_running()?;
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        let purge = Arc::clone(&self.purge);
        let erase = Arc::clone(&self.erase);
        let cancel = Arc::clone(&self.cancel);
        let signal = Arc::clone(&self.signal);
        let interval = self.config.gc.worker_interval();
        let handle = thread::Builder::new()
            .name("tidemark-gc".to_owned())
            .spawn(move || gc_loop(&purge, &erase, &cancel, &signal, interval))?;
        *worker = Some(handle);
        Ok(())
    }

    /// Wake the GC worker early.
    pub fn wake_gc_worker(&self) {
        self.signal.notify();
    }

    /// Stop the GC worker and the clock. Further transactional calls fail
    /// with `ShuttingDown`.
    pub fn shutdown(&self) {
        self.cancel.store(true, Ordering::Release);
        self.signal.notify();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!("gc worker panicked");
            }
        }
        self.clock.shutdown();
    }

    /// Re-derive the purged watermark from the GC heaps after a restart.
    pub fn reload_purged_scn(&self) {
        self.watermarks.reload(
            self.purge.heap().top(),
            self.erase.heap().top(),
            self.clock.load_scn(),
        );
    }

    /// Re-derive the erased watermark. Shares the reload with the purged
    /// watermark since `erased <= purged` must hold afterwards.
    pub fn reload_erased_scn(&self) {
        self.reload_purged_scn();
    }

    /// Whether a flashback read as of `as_of` still has all undo it needs.
    pub fn flashback_available(&self, as_of: Scn) -> bool {
        as_of >= self.watermarks.erased_scn()
    }

    // -----------------------------------------------------------------------
    // GCN and heartbeat
    // -----------------------------------------------------------------------

    pub fn send_heartbeat(&self) {
        self.freezer.send_heartbeat();
    }

    pub fn set_heartbeat_freeze(&self, enabled: bool) {
        self.freezer.set_enabled(enabled);
    }

    pub fn is_frozen(&self) -> bool {
        self.freezer.determine_freeze()
    }

    pub fn advance_gcn_no_flush(&self, gcn: Gcn) -> Result<()> {
        self.authority.advance_gcn_no_flush(gcn)
    }

    pub fn search_transaction_info(&self, xid: &Xid) -> XaInfo {
        search_transaction_info(&self.xa, &self.rsegs, self.slots.undo().as_ref(), xid)
    }

    // -----------------------------------------------------------------------
    // Observability
    // -----------------------------------------------------------------------

    pub fn purge_status(&self) -> PurgeStatus {
        let history_length = self
            .rsegs
            .all()
            .iter()
            .map(|rseg| rseg.lock().history.len() as u64)
            .sum();
        PurgeStatus {
            history_length,
            current_scn: self.clock.load_scn(),
            current_gcn: self.clock.load_gcn(),
            purged_scn: self.watermarks.purged_scn(),
            purged_gcn: self.watermarks.purged_gcn(),
            erased_scn: self.watermarks.erased_scn(),
            erased_gcn: self.watermarks.erased_gcn(),
        }
    }

    pub fn rseg_stats(&self) -> Vec<RsegStat> {
        let undo = self.slots.undo();
        self.rsegs
            .all()
            .iter()
            .map(|rseg| rseg.stat(undo.as_ref()))
            .collect()
    }

    pub fn trunc_status(&self) -> Vec<TruncStatus> {
        self.rsegs
            .all()
            .iter()
            .map(|rseg| rseg.trunc_status())
            .collect()
    }

    pub fn stats(&self) -> TxnStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for TxnSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}
