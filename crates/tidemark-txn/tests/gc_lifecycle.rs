//! Purge/erase lifecycle through the transaction system.

use std::sync::Arc;
use std::time::Duration;

use tidemark_txn::{CommitArgs, ManualClock, RowOp, RsegConfig, TxnConfig, TxnSystem};
use tidemark_types::{Scn, TableId, Utc, XaStatus, Xid};

const ACCOUNTS: TableId = TableId::new(3);

fn system(retention_secs: u64) -> (Arc<ManualClock>, TxnSystem) {
    let wall = Arc::new(ManualClock::new(Utc::from_secs(10_000)));
    let config = TxnConfig {
        retention_secs,
        rollback_segments: RsegConfig {
            txn_rsegs: 4,
            temp_rsegs: 1,
        },
        ..TxnConfig::default()
    };
    let sys = TxnSystem::in_memory(config, wall.clone()).unwrap();
    (wall, sys)
}

/// Commit one transaction per key, each with a temporary row too. Returns
/// the scn of the last transaction log.
fn churn(sys: &TxnSystem, keys: std::ops::Range<u64>) -> Scn {
    let mut last = Scn::NULL;
    for key in keys {
        let mut txn = sys.begin().unwrap();
        sys.write_row(&mut txn, ACCOUNTS, key, RowOp::Insert).unwrap();
        sys.write_temp_row(&mut txn, TableId::new(99), key).unwrap();
        last = sys.commit(&mut txn, &CommitArgs::default()).unwrap().image.scn;
    }
    last
}

#[test]
fn watermarks_are_monotonic_and_ordered() {
    let (wall, sys) = system(5);
    let mut last = sys.purge_status();
    let mut last_txn_scn = Scn::NULL;
    for round in 0..5_u64 {
        last_txn_scn = churn(&sys, round * 10..round * 10 + 10);
        sys.run_purge();
        wall.advance(Duration::from_secs(3));
        sys.run_erase();

        let status = sys.purge_status();
        assert!(status.purged_scn >= last.purged_scn, "purged went backwards");
        assert!(status.erased_scn >= last.erased_scn, "erased went backwards");
        assert!(status.erased_scn <= status.purged_scn);
        assert!(status.purged_scn <= status.current_scn);
        last = status;
    }

    wall.advance(Duration::from_secs(10));
    while sys.run_purge().logs_purged > 0 {}
    while sys.run_erase().logs_erased > 0 {}
    let status = sys.purge_status();
    assert_eq!(status.purged_scn, status.current_scn);
    assert_eq!(status.erased_scn, last_txn_scn);
    assert_eq!(status.history_length, 0);
    assert_eq!(sys.stats().purge_logs, 100, "50 txn logs plus 50 temporary logs");
}

#[test]
fn open_snapshot_holds_back_both_phases() {
    let (wall, sys) = system(0);
    churn(&sys, 0..3);
    let view = sys.open_view(None);
    let last_txn_scn = churn(&sys, 3..6);

    while sys.run_purge().logs_purged > 0 {}
    let status = sys.purge_status();
    assert!(status.purged_scn <= view.snapshot_scn);
    assert!(status.history_length > 0);

    wall.advance(Duration::from_secs(1));
    while sys.run_erase().logs_erased > 0 {}
    assert!(sys.purge_status().erased_scn < view.snapshot_scn);

    sys.close_view(&view);
    while sys.run_purge().logs_purged > 0 {}
    while sys.run_erase().logs_erased > 0 {}
    let status = sys.purge_status();
    assert_eq!(status.purged_scn, status.current_scn);
    assert_eq!(status.erased_scn, last_txn_scn);
}

#[test]
fn segment_stats_track_history() {
    let (wall, sys) = system(0);
    churn(&sys, 0..8);
    let history: u64 = sys.rseg_stats().iter().map(|s| s.history_length).sum();
    assert_eq!(history, 16);

    while sys.run_purge().logs_purged > 0 {}
    wall.advance(Duration::from_secs(1));
    while sys.run_erase().logs_erased > 0 {}
    let stats = sys.rseg_stats();
    assert_eq!(stats.iter().map(|s| s.history_length).sum::<u64>(), 0);
    assert_eq!(stats.iter().map(|s| s.secondary_length).sum::<u64>(), 0);
    assert_eq!(
        stats.iter().map(|s| s.cached_length + s.free_length).sum::<u64>(),
        8,
        "erased txn slots are kept for reuse"
    );
    assert_eq!(sys.trunc_status().len(), 5);
}

#[test]
fn xa_outcome_is_forgotten_after_erase() {
    let (wall, sys) = system(0);
    let xid = Xid::new(1, b"order-17".to_vec(), b"db2".to_vec()).unwrap();
    let mut txn = sys.begin().unwrap();
    sys.xa_attach(&mut txn, xid.clone()).unwrap();
    sys.write_row(&mut txn, ACCOUNTS, 17, RowOp::Insert).unwrap();
    sys.commit(&mut txn, &CommitArgs::default()).unwrap();
    assert_eq!(sys.search_transaction_info(&xid).status, XaStatus::Commit);

    while sys.run_purge().logs_purged > 0 {}
    assert_eq!(
        sys.search_transaction_info(&xid).status,
        XaStatus::Commit,
        "semi-purged logs stay searchable"
    );
    wall.advance(Duration::from_secs(1));
    while sys.run_erase().logs_erased > 0 {}
    assert_eq!(
        sys.search_transaction_info(&xid).status,
        XaStatus::NotStartOrForget
    );
}

#[test]
fn background_worker_drains_history() {
    let wall = Arc::new(ManualClock::new(Utc::from_secs(10_000)));
    let mut config = TxnConfig::default();
    config.gc.worker_interval_ms = 2;
    let sys = TxnSystem::in_memory(config, wall).unwrap();
    sys.spawn_gc_worker().unwrap();
    churn(&sys, 0..20);
    sys.wake_gc_worker();

    for _ in 0..1_000 {
        if sys.purge_status().history_length == 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(sys.purge_status().history_length, 0);
    sys.shutdown();
    sys.shutdown();
}
