//! Service Tests for txcoord-engine
//!
//! End-to-end runs of the transaction service:
//!
//! 1. **Unlogged** - no local logs, no recovery
//! 2. **Logged** - local recovery first, then work in the new epoch
//! 3. **Background** - timeouts and delivery retries on the scheduler
//! 4. **Recovery lifecycle** - local and peer domains, shutdown markers,
//!    restart from file-backed logs

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use txcoord_concurrency::testing::{FakeFactory, FakeResource, Journal};
use txcoord_concurrency::TransactionCoordinator;
use txcoord_core::{
    EnlistOptions, PartnerDescriptor, ResourceManager, TransactionSettings, TransactionState,
    TxError, Vote, XaError, Xid,
};
use txcoord_durability::{
    BranchEntry, MemoryLog, PartnerLog, ServerState, ServiceData, TransactionHeader,
    TransactionLog,
};
use txcoord_engine::{RecoveryPhase, SchedulerConfig, TransactionService, TxConfig};
use uuid::Uuid;

// ============================================================================
// Test Helpers
// ============================================================================

struct Harness {
    tran: Arc<MemoryLog>,
    partner: Arc<MemoryLog>,
    journal: Journal,
    factory: FakeFactory,
}

impl Harness {
    fn new() -> Self {
        Harness {
            tran: Arc::new(MemoryLog::new("tranlog")),
            partner: Arc::new(MemoryLog::new("partnerlog")),
            journal: Journal::new(),
            factory: FakeFactory::new(),
        }
    }

    fn config(settings: TransactionSettings) -> TxConfig {
        TxConfig::new("server1").with_transaction(settings)
    }

    fn unlogged(&self, settings: TransactionSettings) -> TransactionService {
        TransactionService::builder(Self::config(settings))
            .factory(Arc::new(self.factory.clone()))
            .build()
            .unwrap()
    }

    fn logged(&self, settings: TransactionSettings) -> TransactionService {
        TransactionService::builder(Self::config(settings))
            .local_logs(self.tran.clone(), self.partner.clone())
            .factory(Arc::new(self.factory.clone()))
            .build()
            .unwrap()
    }

    /// A logged service with local recovery initiated.
    fn started(&self, settings: TransactionSettings) -> TransactionService {
        let service = self.logged(settings);
        service.initiate_recovery("server1").unwrap();
        service
    }

    fn rm(&self, name: &str) -> FakeResource {
        let rm = FakeResource::new(name, self.journal.clone());
        self.factory.add(rm.clone());
        rm
    }

    fn server_state(&self) -> Option<ServerState> {
        PartnerLog::new(self.partner.clone()).replay().unwrap().state
    }

    fn logged_transactions(&self) -> usize {
        TransactionLog::new(self.tran.clone())
            .replay()
            .unwrap()
            .transactions
            .len()
    }

    fn crash(&self) {
        self.tran.restart();
        self.partner.restart();
    }
}

fn enlist(tx: &TransactionCoordinator, rm: &FakeResource) {
    let name = ResourceManager::name(rm).to_string();
    tx.enlist(
        rm.as_rm(),
        &EnlistOptions::new(PartnerDescriptor::new(name.clone(), name.into_bytes())),
    )
    .unwrap();
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

// ============================================================================
// SECTION 1: Unlogged service
// ============================================================================

mod unlogged {
    use super::*;

    #[test]
    fn test_begin_and_commit_updates_metrics() {
        let h = Harness::new();
        let service = h.unlogged(TransactionSettings::for_testing());
        let a = h.rm("a");

        let tx = service.begin().unwrap();
        enlist(&tx, &a);
        assert_eq!(service.active_count(), 1);
        assert_eq!(tx.xid().epoch(), Some(0));

        service.commit(tx.xid()).unwrap();

        assert_eq!(h.journal.commits(), vec!["a"]);
        let metrics = service.metrics();
        assert_eq!(metrics.total_started, 1);
        assert_eq!(metrics.total_committed, 1);
        assert_eq!(metrics.active_count, 0);
        assert!(service.lookup(tx.xid()).is_none());
    }

    #[test]
    fn test_rollback_by_xid() {
        let h = Harness::new();
        let service = h.unlogged(TransactionSettings::for_testing());
        let a = h.rm("a");
        let tx = service.begin().unwrap();
        enlist(&tx, &a);

        service.rollback(tx.xid()).unwrap();

        assert_eq!(h.journal.rollbacks(), vec!["a"]);
        assert_eq!(service.metrics().total_rolled_back, 1);
    }

    #[test]
    fn test_direct_completion_is_counted() {
        let h = Harness::new();
        let service = h.unlogged(TransactionSettings::for_testing());

        let tx = service.begin().unwrap();
        tx.commit().unwrap();

        assert_eq!(service.active_count(), 0);
        assert_eq!(service.metrics().total_committed, 1);
        assert!(service.wait_for_idle(Duration::from_millis(10)));
    }

    #[test]
    fn test_second_participant_is_refused() {
        let h = Harness::new();
        let service = h.unlogged(TransactionSettings::for_testing());
        let (a, b) = (h.rm("a"), h.rm("b"));
        let tx = service.begin().unwrap();
        enlist(&tx, &a);

        let second = tx.enlist(
            b.as_rm(),
            &EnlistOptions::new(PartnerDescriptor::new("b", b"b".to_vec())),
        );

        assert!(matches!(second, Err(TxError::IllegalState(_))));
        service.rollback(tx.xid()).unwrap();
    }

    #[test]
    fn test_xids_are_unique() {
        let h = Harness::new();
        let service = h.unlogged(TransactionSettings::for_testing());
        let a = service.begin().unwrap();
        let b = service.begin().unwrap();
        assert_ne!(a.xid(), b.xid());
        assert_eq!(a.xid().appl_id(), b.xid().appl_id());
    }

    #[test]
    fn test_unknown_xid_is_illegal_state() {
        let h = Harness::new();
        let service = h.unlogged(TransactionSettings::for_testing());
        let xid = Xid::global(Uuid::new_v4(), 1, 1);

        assert!(matches!(service.commit(&xid), Err(TxError::IllegalState(_))));
        assert!(matches!(
            service.complete_manually(&xid, true),
            Err(TxError::IllegalState(_))
        ));
    }

    #[test]
    fn test_local_recovery_needs_logs() {
        let h = Harness::new();
        let service = h.unlogged(TransactionSettings::for_testing());

        assert!(matches!(
            service.initiate_recovery("server1"),
            Err(TxError::IllegalState(_))
        ));
        assert!(matches!(
            service.initiate_recovery("elsewhere"),
            Err(TxError::IllegalState(_))
        ));
        service.wait_for_recovery_complete().unwrap();
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = TxConfig::new("server1").with_scheduler(SchedulerConfig {
            worker_threads: 0,
            max_queue_depth: 8,
        });
        assert!(matches!(
            TransactionService::builder(config).build(),
            Err(TxError::Config(_))
        ));
    }
}

// ============================================================================
// SECTION 2: Logged service
// ============================================================================

mod logged {
    use super::*;

    #[test]
    fn test_work_runs_in_recovered_epoch() {
        let h = Harness::new();
        let service = h.started(TransactionSettings::for_testing());
        service.wait_for_recovery_complete().unwrap();
        let (a, b) = (h.rm("a"), h.rm("b"));

        let tx = service.begin().unwrap();
        let recovery = service.recovery("server1").unwrap();
        let data = recovery.service_data().unwrap();
        assert_eq!(tx.xid().epoch(), Some(data.epoch));
        assert_eq!(tx.xid().appl_id(), Some(data.appl_id));

        enlist(&tx, &a);
        enlist(&tx, &b);
        service.commit(tx.xid()).unwrap();

        assert_eq!(h.journal.prepares().len(), 2);
        assert_eq!(h.journal.commits().len(), 2);
        assert_eq!(h.logged_transactions(), 0);
        assert_eq!(service.metrics().total_committed, 1);
    }

    #[test]
    fn test_begin_before_recovery_does_not_pin_unlogged_identity() {
        let h = Harness::new();
        let service = h.logged(TransactionSettings::for_testing());

        assert!(matches!(service.begin(), Err(TxError::IllegalState(_))));
        assert!(matches!(
            service.import(&Xid::global(Uuid::new_v4(), 1, 1), None),
            Err(TxError::IllegalState(_))
        ));
        assert_eq!(service.metrics().total_started, 0);

        service.initiate_recovery("server1").unwrap();
        service.wait_for_recovery_complete().unwrap();
        let (a, b) = (h.rm("a"), h.rm("b"));

        let tx = service.begin().unwrap();
        assert!(tx.xid().epoch().unwrap() >= 1);
        enlist(&tx, &a);
        enlist(&tx, &b);
        service.commit(tx.xid()).unwrap();

        assert_eq!(h.journal.prepares().len(), 2);
        assert_eq!(h.journal.commits().len(), 2);
        assert_eq!(tx.outcome(), Some(TransactionState::Committed));
    }

    #[test]
    fn test_import_returns_existing_subordinate() {
        let h = Harness::new();
        let service = h.started(TransactionSettings::for_testing());
        let superior = Xid::global(Uuid::new_v4(), 3, 7);

        let first = service.import(&superior, None).unwrap();
        let again = service.import(&superior, None).unwrap();

        assert_eq!(first.xid(), again.xid());
        assert_eq!(first.superior(), Some(&superior));
        assert_eq!(service.metrics().total_started, 1);
    }

    #[test]
    fn test_subordinate_prepares_then_commits() {
        let h = Harness::new();
        let service = h.started(TransactionSettings::for_testing());
        let a = h.rm("a");
        let superior = Xid::global(Uuid::new_v4(), 1, 1);
        let tx = service.import(&superior, Some("adapter".to_string())).unwrap();
        enlist(&tx, &a);
        let xid = tx.xid().clone();
        drop(tx);

        assert_eq!(service.prepare(&xid).unwrap(), Vote::Ok);
        assert_eq!(service.lookup(&xid).unwrap().state(), TransactionState::Prepared);
        assert_eq!(h.logged_transactions(), 1);

        service.commit(&xid).unwrap();
        assert_eq!(h.journal.commits(), vec!["a"]);
        assert_eq!(h.logged_transactions(), 0);
        assert!(service.lookup(&xid).is_none());
    }

    #[test]
    fn test_empty_subordinate_votes_read_only() {
        let h = Harness::new();
        let service = h.started(TransactionSettings::for_testing());
        let tx = service
            .import(&Xid::global(Uuid::new_v4(), 1, 1), None)
            .unwrap();

        assert_eq!(service.prepare(tx.xid()).unwrap(), Vote::ReadOnly);
        assert_eq!(service.active_count(), 0);
    }

    #[test]
    fn test_corrupted_logs_fail_begin() {
        let h = Harness::new();
        TransactionLog::new(h.tran.clone())
            .write_service_data(&ServiceData {
                server_name: "server1".to_string(),
                appl_id: Uuid::new_v4(),
                epoch: 1,
            })
            .unwrap();
        let service = h.started(TransactionSettings::for_testing());

        assert!(matches!(service.begin(), Err(TxError::Corrupted { .. })));
        assert!(matches!(
            service.wait_for_replay_complete(),
            Err(TxError::Corrupted { .. })
        ));
        assert_eq!(
            service.recovery("server1").unwrap().phase(),
            RecoveryPhase::Failed
        );
    }

    #[test]
    fn test_local_recovery_runs_once() {
        let h = Harness::new();
        let service = h.started(TransactionSettings::for_testing());
        assert!(matches!(
            service.initiate_recovery("server1"),
            Err(TxError::IllegalState(_))
        ));
    }
}

// ============================================================================
// SECTION 3: Background work
// ============================================================================

mod background {
    use super::*;

    #[test]
    fn test_timeout_rolls_back_active_transaction() {
        let h = Harness::new();
        let service = h.started(
            TransactionSettings::for_testing().with_transaction_timeout_secs(1),
        );
        let a = h.rm("a");
        let tx = service.begin().unwrap();
        enlist(&tx, &a);
        assert!(tx.deadline().is_some());

        assert!(wait_until(Duration::from_secs(5), || service
            .lookup(tx.xid())
            .is_none()));

        assert_eq!(h.journal.rollbacks(), vec!["a"]);
        assert!(h.journal.commits().is_empty());
        assert!(tx.status().rollback_only);
        assert_eq!(service.metrics().total_rolled_back, 1);
    }

    #[test]
    fn test_timeout_after_commit_is_harmless() {
        let h = Harness::new();
        let service = h.started(
            TransactionSettings::for_testing().with_transaction_timeout_secs(1),
        );
        let tx = service.begin().unwrap();
        service.commit(tx.xid()).unwrap();

        thread::sleep(Duration::from_millis(1200));

        let metrics = service.metrics();
        assert_eq!(metrics.total_committed, 1);
        assert_eq!(metrics.total_rolled_back, 0);
    }

    #[test]
    fn test_direct_completion_cancels_timeout() {
        let h = Harness::new();
        let service = h.started(
            TransactionSettings::for_testing().with_transaction_timeout_secs(30),
        );
        service.wait_for_recovery_complete().unwrap();
        let tx = service.begin().unwrap();
        assert_eq!(service.scheduler_stats().delayed_tasks, 1);

        tx.commit().unwrap();

        assert!(service.lookup(tx.xid()).is_none());
        assert_eq!(service.scheduler_stats().delayed_tasks, 0);
        assert_eq!(service.active_count(), 0);
        assert_eq!(service.metrics().total_committed, 1);
    }

    #[test]
    fn test_rollback_cancels_timeout() {
        let h = Harness::new();
        let service = h.started(
            TransactionSettings::for_testing().with_transaction_timeout_secs(30),
        );
        service.wait_for_recovery_complete().unwrap();
        let a = h.rm("a");
        let tx = service.begin().unwrap();
        enlist(&tx, &a);

        tx.rollback().unwrap();

        assert!(service.lookup(tx.xid()).is_none());
        assert_eq!(service.scheduler_stats().delayed_tasks, 0);
        assert_eq!(service.metrics().total_rolled_back, 1);
    }

    #[test]
    fn test_failed_delivery_is_retried() {
        let h = Harness::new();
        let service = h.started(TransactionSettings::for_testing());
        let (a, b) = (h.rm("a"), h.rm("b"));
        a.script_commit(Err(XaError::RmFail));

        let tx = service.begin().unwrap();
        enlist(&tx, &a);
        enlist(&tx, &b);
        service.commit(tx.xid()).unwrap();
        assert_eq!(tx.state(), TransactionState::Committing);
        assert_eq!(h.logged_transactions(), 1);

        assert!(wait_until(Duration::from_secs(5), || service
            .lookup(tx.xid())
            .is_none()));

        assert!(a.in_doubt().is_empty());
        assert_eq!(h.journal.commits().iter().filter(|n| *n == "a").count(), 2);
        assert_eq!(h.logged_transactions(), 0);
        assert_eq!(service.metrics().total_committed, 1);
    }
}

// ============================================================================
// SECTION 4: Recovery lifecycle
// ============================================================================

mod lifecycle {
    use super::*;

    #[test]
    fn test_clean_shutdown_marks_logs_stopped() {
        let h = Harness::new();
        let service = h.started(TransactionSettings::for_testing());
        service.wait_for_recovery_complete().unwrap();
        assert_eq!(h.server_state(), Some(ServerState::Recovered));

        service.shutdown(false).unwrap();

        assert_eq!(h.server_state(), Some(ServerState::Stopped));
        assert!(service.is_shutting_down());
        assert!(matches!(service.begin(), Err(TxError::ShuttingDown)));
        // Second call is a no-op
        service.shutdown(false).unwrap();
    }

    #[test]
    fn test_shutdown_with_work_in_flight_leaves_marker() {
        let h = Harness::new();
        let service = h.started(TransactionSettings::for_testing());
        service.wait_for_recovery_complete().unwrap();
        let _tx = service.begin().unwrap();

        service.shutdown(true).unwrap();

        assert_eq!(h.server_state(), Some(ServerState::Recovered));
    }

    #[test]
    fn test_prepare_for_shutdown_lets_live_work_finish() {
        let h = Harness::new();
        let service = h.started(TransactionSettings::for_testing());
        let tx = service.begin().unwrap();

        service.prepare_for_shutdown();

        assert!(matches!(service.begin(), Err(TxError::ShuttingDown)));
        service.commit(tx.xid()).unwrap();
        service.shutdown(false).unwrap();
        assert_eq!(h.server_state(), Some(ServerState::Stopped));
    }

    #[test]
    fn test_crash_after_commit_decision_completes_on_restart() {
        let h = Harness::new();
        let (a, b) = (h.rm("a"), h.rm("b"));
        a.script_commit(Err(XaError::RmFail));
        {
            let service = h.started(TransactionSettings::for_testing());
            let tx = service.begin().unwrap();
            enlist(&tx, &a);
            enlist(&tx, &b);
            service.commit(tx.xid()).unwrap();
            assert_eq!(tx.state(), TransactionState::Committing);
            // Dropped before the retry runs
        }
        h.crash();
        assert_eq!(h.logged_transactions(), 1);
        assert_eq!(a.in_doubt().len(), 1);

        let service = h.started(TransactionSettings::for_testing());
        service.wait_for_recovery_complete().unwrap();

        assert!(a.in_doubt().is_empty());
        assert_eq!(h.logged_transactions(), 0);
        let stats = service.recovery("server1").unwrap().stats();
        assert_eq!(stats.recovered_epoch, 1);
        assert_eq!(stats.epoch, 2);
        assert_eq!(stats.transactions_completed, 1);
        service.shutdown(false).unwrap();
    }

    #[test]
    fn test_peer_domain_recovery() {
        let h = Harness::new();
        let a = h.rm("a");
        let peer_tran = Arc::new(MemoryLog::new("peer-tranlog"));
        let peer_partner = Arc::new(MemoryLog::new("peer-partnerlog"));
        let appl = Uuid::new_v4();
        {
            let tran_log = TransactionLog::new(peer_tran.clone());
            let partner_log = PartnerLog::new(peer_partner.clone());
            let data = ServiceData {
                server_name: "server2".to_string(),
                appl_id: appl,
                epoch: 4,
            };
            tran_log.write_service_data(&data).unwrap();
            partner_log
                .write_service_data(&data, ServerState::Starting)
                .unwrap();
            let id = partner_log
                .log_partner(&PartnerDescriptor::new("a", b"a".to_vec()))
                .unwrap();
            let xid = Xid::global(appl, 4, 1);
            let branch = xid.branch(id, 1);
            a.add_in_doubt(branch.clone());
            let record = tran_log
                .create_transaction(&TransactionHeader {
                    xid,
                    subordinate: false,
                    superior: None,
                    owner: None,
                })
                .unwrap();
            tran_log
                .add_branch(
                    record,
                    &BranchEntry {
                        recovery_id: id,
                        xid: branch,
                        priority: 0,
                    },
                )
                .unwrap();
            tran_log
                .set_state(record, TransactionState::RollingBack)
                .unwrap();
        }

        let service = TransactionService::builder(Harness::config(
            TransactionSettings::for_testing(),
        ))
        .peer_domain("server2", peer_tran.clone(), peer_partner.clone())
        .factory(Arc::new(h.factory.clone()))
        .build()
        .unwrap();

        service.initiate_recovery("server2").unwrap();
        let recovery = service.recovery("server2").unwrap();
        recovery.wait_for_recovery_complete().unwrap();

        assert_eq!(h.journal.rollbacks(), vec!["a"]);
        assert_eq!(recovery.service_data().unwrap().epoch, 5);
        assert_eq!(recovery.service_data().unwrap().server_name, "server2");

        service.terminate_recovery("server2").unwrap();
        assert!(matches!(
            service.terminate_recovery("server3"),
            Err(TxError::IllegalState(_))
        ));
    }

    #[test]
    fn test_file_logs_survive_restart() {
        let dir = TempDir::new().unwrap();
        let h = Harness::new();
        let (a, b) = (h.rm("a"), h.rm("b"));

        let first_epoch = {
            let service = TransactionService::builder(Harness::config(
                TransactionSettings::for_testing(),
            ))
            .log_dir(dir.path())
            .unwrap()
            .factory(Arc::new(h.factory.clone()))
            .build()
            .unwrap();
            service.initiate_recovery("server1").unwrap();
            service.wait_for_recovery_complete().unwrap();

            let tx = service.begin().unwrap();
            enlist(&tx, &a);
            enlist(&tx, &b);
            service.commit(tx.xid()).unwrap();
            service.shutdown(false).unwrap();
            tx.xid().epoch().unwrap()
        };

        let service = TransactionService::builder(Harness::config(
            TransactionSettings::for_testing(),
        ))
        .log_dir(dir.path())
        .unwrap()
        .factory(Arc::new(h.factory.clone()))
        .build()
        .unwrap();
        service.initiate_recovery("server1").unwrap();
        service.wait_for_recovery_complete().unwrap();

        let stats = service.recovery("server1").unwrap().stats();
        assert_eq!(stats.recovered_epoch, first_epoch);
        assert_eq!(stats.epoch, first_epoch + 1);
        assert_eq!(stats.transactions_recovered, 0);
        assert_eq!(service.begin().unwrap().xid().epoch(), Some(first_epoch + 1));
    }
}
