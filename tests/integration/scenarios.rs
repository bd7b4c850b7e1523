//! Protocol paths through a logged service.

use crate::common::*;
use txcoord::testing::FakeOnePhase;
use txcoord::{
    HeuristicOutcome, RollbackReason, TransactionSettings, TransactionState, Vote, XaError,
};

#[test]
fn test_two_participants_commit_in_two_phases() {
    let w = World::new();
    let service = w.boot(TransactionSettings::for_testing());
    let (a, b) = (w.rm("a"), w.rm("b"));

    let tx = service.begin().unwrap();
    enlist(&tx, &a);
    enlist(&tx, &b);
    service.commit(tx.xid()).unwrap();

    assert_eq!(w.journal.prepares(), vec!["b", "a"]);
    assert_eq!(w.journal.commits(), vec!["a", "b"]);
    assert_eq!(tx.outcome(), Some(TransactionState::Committed));
    assert_eq!(tx.status().heuristic, HeuristicOutcome::None);
    assert!(a.in_doubt().is_empty() && b.in_doubt().is_empty());
}

#[test]
fn test_read_only_voter_is_not_committed() {
    let w = World::new();
    let service = w.boot(TransactionSettings::for_testing());
    service.wait_for_recovery_complete().unwrap();
    let (a, b) = (w.rm("a"), w.rm("b"));
    a.script_prepare(Ok(Vote::ReadOnly));
    let records = w.tran.durable_records().len();

    let tx = service.begin().unwrap();
    enlist(&tx, &a);
    enlist(&tx, &b);
    service.commit(tx.xid()).unwrap();

    assert_eq!(w.journal.commits(), vec!["b"]);
    assert_eq!(tx.outcome(), Some(TransactionState::Committed));
    assert_eq!(w.tran.durable_records().len(), records);
}

#[test]
fn test_last_agent_decides_the_outcome() {
    let w = World::new();
    let service = w.boot(TransactionSettings::for_testing());
    let a = w.rm("a");
    let lps = FakeOnePhase::new("lps", w.journal.clone());
    lps.script_commit(Err(XaError::Rollback(RollbackReason::Integrity)));

    let tx = service.begin().unwrap();
    enlist(&tx, &a);
    tx.enlist_one_phase(lps.as_resource()).unwrap();
    let err = service.commit(tx.xid()).unwrap_err();

    assert!(err.is_rollback());
    assert_eq!(w.journal.prepares(), vec!["a"]);
    assert_eq!(w.journal.rollbacks(), vec!["a"]);
    assert_eq!(service.metrics().total_rolled_back, 1);
}

#[test]
fn test_single_one_phase_participant_never_logs() {
    let w = World::new();
    let service = w.boot(TransactionSettings::for_testing());
    service.wait_for_recovery_complete().unwrap();
    let lps = FakeOnePhase::new("lps", w.journal.clone());
    let records = w.tran.durable_records().len();

    let tx = service.begin().unwrap();
    tx.enlist_one_phase(lps.as_resource()).unwrap();
    service.commit(tx.xid()).unwrap();

    assert_eq!(tx.outcome(), Some(TransactionState::Committed));
    assert_eq!(w.tran.durable_records().len(), records);
}

#[test]
fn test_rollback_only_commit_rolls_back() {
    let w = World::new();
    let service = w.boot(TransactionSettings::for_testing());
    let (a, b) = (w.rm("a"), w.rm("b"));

    let tx = service.begin().unwrap();
    enlist(&tx, &a);
    tx.set_rollback_only().unwrap();
    assert!(tx
        .enlist(
            b.as_rm(),
            &txcoord::EnlistOptions::new(txcoord::PartnerDescriptor::new("b", b"b".to_vec()))
        )
        .is_err());

    let err = service.commit(tx.xid()).unwrap_err();

    assert!(err.is_rollback());
    assert_eq!(w.journal.rollbacks(), vec!["a"]);
    assert!(w.journal.commits().is_empty());
}
