//! Crashes between protocol steps, and what the next run does about them.

use crate::common::*;
use std::time::Duration;
use txcoord::{RecoveryPhase, ServerState, TransactionSettings, TransactionState, XaError};

#[test]
fn test_logged_decision_and_log_early_branch_resolved_after_crash() {
    let w = World::new();
    let (a, b, c) = (w.rm("a"), w.rm("b"), w.rm("c"));
    a.script_commit(Err(XaError::RmFail));

    let (decided, undecided) = {
        let service = w.boot(TransactionSettings::for_testing());

        // X: commit decided and logged, delivery to a failed
        let x = service.begin().unwrap();
        enlist(&x, &a);
        enlist(&x, &b);
        service.commit(x.xid()).unwrap();
        assert_eq!(x.state(), TransactionState::Committing);

        // Y: c prepared on its own, no transaction record yet
        let y = service.begin().unwrap();
        enlist(&y, &c);
        let branch = w.branch_of("c", y.xid());
        c.add_in_doubt(branch.clone());

        (x.xid().clone(), branch)
    };
    w.crash();
    w.journal.clear();

    let service = w.boot(TransactionSettings::for_testing());
    service.wait_for_recovery_complete().unwrap();

    assert_eq!(w.journal.commits(), vec!["a"]);
    assert_eq!(w.journal.rollbacks(), vec!["c"]);
    assert!(a.in_doubt().is_empty());
    assert!(!c.in_doubt().contains(&undecided));
    assert!(service.lookup(&decided).is_none());

    let stats = service.recovery(SERVER).unwrap().stats();
    assert_eq!(stats.transactions_recovered, 1);
    assert_eq!(stats.transactions_completed, 1);
    assert_eq!(stats.orphans_rolled_back, 1);
}

#[test]
fn test_recovery_waits_for_unreachable_partner_then_finishes() {
    let w = World::new();
    let (a, b) = (w.rm("a"), w.rm("b"));
    b.script_commit(Err(XaError::RmFail));
    {
        let service = w.boot(TransactionSettings::for_testing());
        let tx = service.begin().unwrap();
        enlist(&tx, &a);
        enlist(&tx, &b);
        service.commit(tx.xid()).unwrap();
    }
    w.crash();
    w.factory.remove("b");

    let service = w.boot(TransactionSettings::for_testing());
    let recovery = service.recovery(SERVER).unwrap();
    assert!(!recovery
        .wait_for_recovery_complete_timeout(Duration::from_millis(100))
        .unwrap());
    assert_eq!(recovery.phase(), RecoveryPhase::Reconciling);

    // New work is not held up by recovery still in progress
    let tx = service.begin().unwrap();
    service.commit(tx.xid()).unwrap();

    w.factory.add(b.clone());
    recovery.wake();
    recovery.wait_for_recovery_complete().unwrap();
    assert!(b.in_doubt().is_empty());
}

#[test]
fn test_clean_restart_finds_stopped_marker() {
    let w = World::new();
    {
        let service = w.boot(TransactionSettings::for_testing());
        service.wait_for_recovery_complete().unwrap();
        service.shutdown(false).unwrap();
    }
    w.crash();

    let partner_log = txcoord_durability::PartnerLog::new(w.partner.clone());
    assert_eq!(
        partner_log.replay().unwrap().state,
        Some(ServerState::Stopped)
    );

    let service = w.boot(TransactionSettings::for_testing());
    service.wait_for_recovery_complete().unwrap();
    let stats = service.recovery(SERVER).unwrap().stats();
    assert_eq!(stats.recovered_epoch, 1);
    assert_eq!(stats.epoch, 2);
}
