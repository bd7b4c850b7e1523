//! Operator-facing log lines.

use crate::common::*;
use std::sync::Arc;
use txcoord::{RecoveryCoordinator, ServiceData, ServerState, TransactionSettings, XaError, Xid};
use txcoord_durability::{PartnerLog, TransactionLog};
use uuid::Uuid;

#[test]
fn test_orphan_rollback_is_logged_under_recovery_target() {
    let w = World::new();
    let c = w.rm("c");
    let tran_log = Arc::new(TransactionLog::new(w.tran.clone()));
    let partner_log = Arc::new(PartnerLog::new(w.partner.clone()));
    let appl = Uuid::new_v4();
    let data = ServiceData {
        server_name: SERVER.to_string(),
        appl_id: appl,
        epoch: 1,
    };
    tran_log.write_service_data(&data).unwrap();
    partner_log
        .write_service_data(&data, ServerState::Starting)
        .unwrap();
    let id = partner_log
        .log_partner(&txcoord::PartnerDescriptor::new("c", b"c".to_vec()))
        .unwrap();
    c.add_in_doubt(Xid::global(appl, 1, 3).branch(id, 1));

    let recovery = RecoveryCoordinator::new(
        SERVER,
        SERVER,
        TransactionSettings::for_testing(),
        tran_log,
        partner_log,
    )
    .with_factory(Arc::new(w.factory.clone()));

    let (logs, done) = with_tracing(|| {
        recovery.replay().unwrap();
        recovery.reconcile_pass().unwrap()
    });

    assert!(done);
    assert!(logs.contains("txcoord::recovery"));
    assert!(logs.contains("Replay complete"));
    assert!(logs.contains("Orphaned branch rolled back"));
}

#[test]
fn test_heuristic_outcome_is_warned() {
    let w = World::new();
    let service = w.boot(TransactionSettings::for_testing());
    service.wait_for_replay_complete().unwrap();
    let (a, b) = (w.rm("a"), w.rm("b"));
    a.script_commit(Err(XaError::HeurCom));
    b.script_commit(Err(XaError::HeurRb));

    let (logs, result) = with_tracing(|| {
        let tx = service.begin().unwrap();
        enlist(&tx, &a);
        enlist(&tx, &b);
        service.commit(tx.xid())
    });

    assert!(result.unwrap_err().is_heuristic());
    assert!(logs.contains("WARN"));
    assert!(logs.contains("txcoord::txn"));
    assert!(logs.contains("Heuristic outcome"));
}

#[test]
fn test_refused_resource_timeout_is_warned() {
    let w = World::new();
    let service = w.boot(TransactionSettings::for_testing().with_transaction_timeout_secs(30));
    service.wait_for_replay_complete().unwrap();
    let a = w.rm("a");
    a.script_timeout(Err(XaError::RmFail));

    let (logs, result) = with_tracing(|| {
        let tx = service.begin().unwrap();
        enlist(&tx, &a);
        service.commit(tx.xid())
    });

    result.unwrap();
    assert_eq!(a.timeouts().len(), 1);
    assert!(logs.contains("txcoord::registry"));
    assert!(logs.contains("Cannot set transaction timeout"));
}
