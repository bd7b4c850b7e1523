//! Divergent participants, as seen by the caller and in the metrics.

use crate::common::*;
use std::time::Duration;
use txcoord::{HeuristicOutcome, TransactionSettings, TransactionState, TxError, XaError};

#[test]
fn test_all_branches_rolled_back_heuristically() {
    let w = World::new();
    let service = w.boot(TransactionSettings::for_testing());
    let (a, b) = (w.rm("a"), w.rm("b"));
    a.script_commit(Err(XaError::HeurRb));
    b.script_commit(Err(XaError::HeurRb));

    let tx = service.begin().unwrap();
    enlist(&tx, &a);
    enlist(&tx, &b);
    let err = service.commit(tx.xid()).unwrap_err();

    assert!(matches!(err, TxError::HeuristicRollback(_)));
    assert_eq!(tx.outcome(), Some(TransactionState::HeuristicOnCommit));
    assert_eq!(w.journal.forgets(), vec!["a", "b"]);
    let metrics = service.metrics();
    assert_eq!(metrics.total_heuristic, 1);
    assert_eq!(metrics.total_committed, 0);
}

#[test]
fn test_divergent_branches_are_mixed() {
    let w = World::new();
    let service = w.boot(TransactionSettings::for_testing());
    let (a, b) = (w.rm("a"), w.rm("b"));
    a.script_commit(Err(XaError::HeurRb));

    let tx = service.begin().unwrap();
    enlist(&tx, &a);
    enlist(&tx, &b);
    let err = service.commit(tx.xid()).unwrap_err();

    assert!(matches!(err, TxError::HeuristicMixed(_)));
    assert_eq!(tx.status().heuristic, HeuristicOutcome::Mixed);
    assert_eq!(w.journal.forgets(), vec!["a"]);
}

#[test]
fn test_exhausted_retries_abandon_as_mixed() {
    let w = World::new();
    let service = w.boot(TransactionSettings::for_testing().with_retry_limit(1));
    let (a, b) = (w.rm("a"), w.rm("b"));
    a.script_commit(Err(XaError::RmFail));
    a.script_commit(Err(XaError::RmFail));

    let tx = service.begin().unwrap();
    enlist(&tx, &a);
    enlist(&tx, &b);
    service.commit(tx.xid()).unwrap();

    assert!(wait_until(Duration::from_secs(5), || service
        .lookup(tx.xid())
        .is_none()));
    assert_eq!(tx.outcome(), Some(TransactionState::HeuristicOnCommit));
    assert_eq!(tx.status().heuristic, HeuristicOutcome::Mixed);
    assert_eq!(service.metrics().total_heuristic, 1);
}
