//! Causal ordering of SCN and GCN across interleaved commits.

use std::sync::Arc;

use proptest::prelude::*;
use tidemark_txn::{CommitArgs, ManualClock, PrepareArgs, RowOp, TxnConfig, TxnSystem};
use tidemark_types::{Gcn, GcnEvent, Scn, TableId, Utc};

#[derive(Debug, Clone)]
enum Step {
    /// Plain commit, optionally with a coordinator GCN.
    Commit(Option<u64>),
    /// Prepare with an optional GCN, then commit with an optional GCN.
    TwoPhase(Option<u64>, Option<u64>),
    /// Raise the system GCN without a transaction.
    Advance(u64),
}

fn config() -> TxnConfig {
    let mut config = TxnConfig::default();
    config.commit_cache.capacity = 1_024;
    config
}

fn gcn_value() -> impl Strategy<Value = u64> {
    1_024_u64..5_000
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        proptest::option::of(gcn_value()).prop_map(Step::Commit),
        (proptest::option::of(gcn_value()), proptest::option::of(gcn_value()))
            .prop_map(|(p, c)| Step::TwoPhase(p, c)),
        gcn_value().prop_map(Step::Advance),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_system_gcn_is_running_max(steps in proptest::collection::vec(step(), 1..40)) {
        let wall = Arc::new(ManualClock::new(Utc::from_secs(1)));
        let sys = TxnSystem::in_memory(config(), wall).unwrap();
        let mut max_gcn = sys.clock().load_gcn();
        let mut last_scn = sys.clock().load_scn();

        for (key, step) in (0_u64..).zip(steps) {
            let observed = match step {
                Step::Advance(g) => {
                    sys.advance_gcn_no_flush(Gcn::new(g)).unwrap();
                    Gcn::new(g)
                }
                Step::Commit(ext) => {
                    let mut txn = sys.begin().unwrap();
                    sys.write_row(&mut txn, TableId::new(1), key, RowOp::Insert).unwrap();
                    let before = sys.clock().load_gcn();
                    let out = sys
                        .commit(&mut txn, &CommitArgs { gcn: ext.map(Gcn::new), ..CommitArgs::default() })
                        .unwrap();
                    if ext.is_none() {
                        prop_assert_eq!(out.image.gcn, before);
                    }
                    prop_assert!(out.image.scn > last_scn);
                    last_scn = out.image.scn;
                    out.image.gcn
                }
                Step::TwoPhase(prep, commit) => {
                    let mut txn = sys.begin().unwrap();
                    sys.write_row(&mut txn, TableId::new(1), key, RowOp::Insert).unwrap();
                    let proposal = sys
                        .prepare(&mut txn, &PrepareArgs { gcn: prep.map(Gcn::new), ..PrepareArgs::default() })
                        .unwrap();
                    prop_assert!(proposal.gcn >= max_gcn.max(prep.map_or(Gcn::INITIAL, Gcn::new)));
                    max_gcn = max_gcn.max(proposal.gcn);
                    let out = sys
                        .commit(&mut txn, &CommitArgs { gcn: commit.map(Gcn::new), ..CommitArgs::default() })
                        .unwrap();
                    if commit.is_none_or(|c| Gcn::new(c) >= proposal.gcn) {
                        prop_assert!(out.image.gcn >= proposal.gcn);
                    }
                    prop_assert!(out.image.scn > last_scn);
                    last_scn = out.image.scn;
                    out.image.gcn
                }
            };
            max_gcn = max_gcn.max(observed);
            prop_assert_eq!(sys.clock().load_gcn(), max_gcn);
        }
    }
}

#[test]
fn replicated_event_carries_commit_gcn() {
    let wall = Arc::new(ManualClock::new(Utc::from_secs(1)));
    let source = TxnSystem::in_memory(config(), wall.clone()).unwrap();
    let replica = TxnSystem::in_memory(config(), wall).unwrap();

    let mut txn = source.begin().unwrap();
    source.write_row(&mut txn, TableId::new(1), 1, RowOp::Insert).unwrap();
    let out = source
        .commit(
            &mut txn,
            &CommitArgs {
                gcn: Some(Gcn::new(3_000)),
                branch: Some((2, 1)),
                ..CommitArgs::default()
            },
        )
        .unwrap();
    let bytes = out.event.unwrap().to_bytes();

    let (event, used) = GcnEvent::from_bytes(&bytes).unwrap();
    assert_eq!(used, bytes.len());
    let mut applied = replica.begin().unwrap();
    replica.write_row(&mut applied, TableId::new(1), 1, RowOp::Insert).unwrap();
    replica.apply_gcn_event(&mut applied, &event).unwrap();
    let replayed = replica.commit(&mut applied, &CommitArgs::default()).unwrap();

    assert_eq!(replayed.image.gcn, out.image.gcn);
    assert_eq!(replayed.image.csr, out.image.csr);
    assert_eq!(applied.branch(), txn.branch());
    assert_eq!(replica.clock().load_gcn(), Gcn::new(3_000));
    assert!(replayed.image.scn > Scn::RESERVED_MAX);
}
