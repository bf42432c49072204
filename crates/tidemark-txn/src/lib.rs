//! Transaction status management for a multi-version row store.
//!
//! Rows carry a small transaction reference (trx id, scn, undo pointer,
//! gcn). Commits stamp TXN slots in rollback segments with an SCN/GCN image;
//! readers resolve unfinished references through the commit cache and the
//! TXN header, writing the answer back onto the row (cleanout). Committed
//! undo is garbage-collected in two phases: purge removes delete-marked rows
//! once no snapshot needs them, erase recycles the TXN slot once the
//! flashback retention window has passed.
//!
//! [`TxnSystem`] ties the pieces together.

pub mod cleanout;
pub mod clock;
pub mod commit_cache;
pub mod config;
pub mod erase;
pub mod gc_heap;
pub mod gcn;
pub mod heartbeat;
pub mod mem_store;
pub mod purge;
pub mod resolver;
pub mod rseg;
pub mod safe_mode;
pub mod storage;
pub mod txn_slot;
pub mod txn_system;
pub mod vision;
pub mod watermark;
pub mod xa;

pub use cleanout::{CommitCleanout, ScanCleanout};
pub use clock::{ManualClock, SystemWallClock, TransactionClock, WallClock};
pub use commit_cache::{CacheEntry, CommitCache, InsertOrigin};
pub use config::{
    CacheLevel, CachePolicy, CleanoutConfig, CommitCacheConfig, GcConfig, HeartbeatConfig,
    RsegConfig, TxnConfig,
};
pub use erase::{EraseBatchResult, EraseScheduler, retention_satisfied};
pub use gc_heap::GcHeap;
pub use gcn::{GcnAuthority, GcnDecision};
pub use heartbeat::HeartbeatFreezer;
pub use mem_store::{MemRowStore, MemUndoStore};
pub use purge::{GcContext, PurgeBatchResult, PurgeScheduler};
pub use resolver::TxnResolver;
pub use rseg::{LogRef, RollbackSegment, RsegKind, RsegSet};
pub use safe_mode::LiveHeaderSet;
pub use storage::{
    RowKey, RowPage, RowStore, TxnHeader, UndoRecord, UndoRecordKind, UndoStore,
};
pub use txn_slot::{SlotCommit, TxnSlots};
pub use txn_system::{
    CommitArgs, CommitOutcome, PrepareArgs, RowOp, RowVersion, Transaction, TxnPhase, TxnSystem,
};
pub use vision::{ReadView, ViewRegistry};
pub use watermark::GcWatermarks;
pub use xa::{LiveXa, XaPhase, XaRegistry, search_transaction_info};
