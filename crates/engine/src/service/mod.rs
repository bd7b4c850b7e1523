//! Transaction service
//!
//! Process-level entry point: begins and imports transactions, keeps the
//! table of live transactions, dispatches timeouts and delivery retries on
//! the background scheduler, and drives recovery of the local failure
//! domain and of any peer domains handed to it.
//!
//! With local logs, `begin` refuses work until local recovery has been
//! initiated and then waits for its replay, so new work always runs in the
//! new epoch. Without local logs, transactions run unlogged and two-phase
//! commit is disabled.
//!
//! Coordinators report back through a [`CompletionListener`]: the table
//! entry and the pending timeout go away as soon as a transaction is
//! forgotten, however it was completed.

mod builder;
mod metrics;

pub use builder::{ServiceBuilder, PARTNER_LOG_FILE, TRAN_LOG_FILE};
pub use metrics::TransactionMetrics;

use crate::background::{BackgroundScheduler, SchedulerStats, TaskId, TaskPriority};
use crate::config::TxConfig;
use crate::recovery::{RecoveryCoordinator, RecoveryPhase};
use dashmap::DashMap;
use metrics::MetricsRecorder;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use txcoord_concurrency::{
    CompletionListener, PartnerTable, RetryScheduler, RetryStatus, RetryTask,
    TransactionCoordinator, TxEnvironment,
};
use txcoord_core::{
    HeuristicOutcome, ProviderDirectory, ResourceFactory, TransactionState, TxError, TxResult,
    Vote, Xid,
};
use txcoord_durability::{PartnerLog, ServerState, TransactionLog};
use uuid::Uuid;

/// Time a graceful `shutdown` waits for live transactions to finish.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// The two logs of one failure domain.
#[derive(Clone)]
pub(crate) struct DomainLogs {
    pub tran_log: Arc<TransactionLog>,
    pub partner_log: Arc<PartnerLog>,
}

/// Identity and environment used for new work.
#[derive(Clone)]
struct LiveIdentity {
    appl_id: Uuid,
    epoch: u32,
    env: TxEnvironment,
}

pub(crate) struct ServiceShared {
    config: TxConfig,
    scheduler: BackgroundScheduler,
    factory: Option<Arc<dyn ResourceFactory>>,
    providers: Option<Arc<dyn ProviderDirectory>>,
    local_logs: Option<DomainLogs>,
    peer_logs: DashMap<String, DomainLogs>,
    recoveries: DashMap<String, Arc<RecoveryCoordinator>>,
    live: RwLock<Option<LiveIdentity>>,
    begin_lock: Mutex<()>,
    sequence: AtomicU64,
    transactions: DashMap<Xid, Arc<TransactionCoordinator>>,
    timers: DashMap<Xid, TaskId>,
    metrics: MetricsRecorder,
    accepting: AtomicBool,
    stopped: AtomicBool,
}

/// Hands coordinator retry tasks to the background scheduler.
struct ServiceRetryScheduler {
    shared: Weak<ServiceShared>,
}

impl RetryScheduler for ServiceRetryScheduler {
    fn schedule(&self, task: RetryTask) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let weak = self.shared.clone();
        let xid = task.xid.clone();
        let submitted = shared
            .scheduler
            .submit_after(task.delay, TaskPriority::Normal, move || {
                if let Some(shared) = weak.upgrade() {
                    shared.run_retry(&xid);
                }
            });
        match submitted {
            Ok(_) => {
                debug!(target: "txcoord::service", xid = %task.xid, attempt = task.attempt, delay_ms = task.delay.as_millis() as u64, "Retry scheduled");
            }
            Err(e) => {
                warn!(target: "txcoord::service", xid = %task.xid, error = %e, "Retry not scheduled; left for recovery");
            }
        }
    }
}

/// Removes finished transactions from the live table as their
/// coordinators forget them.
struct ServiceListener {
    shared: Weak<ServiceShared>,
}

impl CompletionListener for ServiceListener {
    fn timeout_disarmed(&self, xid: &Xid) {
        if let Some(shared) = self.shared.upgrade() {
            shared.cancel_timeout(xid);
        }
    }

    fn completed(&self, xid: &Xid, outcome: TransactionState, heuristic: HeuristicOutcome) {
        if let Some(shared) = self.shared.upgrade() {
            shared.finish(xid, outcome, heuristic);
        }
    }
}

impl ServiceShared {
    fn find(&self, xid: &Xid) -> Option<Arc<TransactionCoordinator>> {
        self.transactions.get(xid).map(|e| e.value().clone())
    }

    fn cancel_timeout(&self, xid: &Xid) {
        if let Some((_, id)) = self.timers.remove(xid) {
            if self.scheduler.cancel(id) {
                debug!(target: "txcoord::service", xid = %xid, "Timeout cancelled");
            }
        }
    }

    /// Drop a forgotten transaction from the table and count its outcome.
    fn finish(&self, xid: &Xid, outcome: TransactionState, heuristic: HeuristicOutcome) {
        self.cancel_timeout(xid);
        if self.transactions.remove(xid).is_none() {
            return;
        }
        self.metrics
            .record_finish(Some(outcome), heuristic.is_heuristic());
        debug!(target: "txcoord::service", xid = %xid, %outcome, "Transaction finished");
    }

    fn run_retry(&self, xid: &Xid) {
        let Some(tx) = self.find(xid) else {
            return;
        };
        let status = tx.retry_completion();
        debug!(target: "txcoord::service", xid = %xid, ?status, "Retry ran");
    }

    fn run_timeout(&self, xid: &Xid) {
        self.timers.remove(xid);
        let Some(tx) = self.find(xid) else {
            return;
        };
        if let Err(e) = tx.timeout_rollback() {
            warn!(target: "txcoord::service", xid = %xid, error = %e, "Timeout rollback failed");
        }
    }
}

/// Transaction service for one process.
///
/// Dropping the service stops its scheduler and any running recovery
/// without writing a clean-shutdown marker.
pub struct TransactionService {
    shared: Arc<ServiceShared>,
}

impl TransactionService {
    /// Start building a service.
    pub fn builder(config: TxConfig) -> ServiceBuilder {
        ServiceBuilder::new(config)
    }

    pub(crate) fn from_parts(
        config: TxConfig,
        factory: Option<Arc<dyn ResourceFactory>>,
        providers: Option<Arc<dyn ProviderDirectory>>,
        local_logs: Option<DomainLogs>,
        peer_logs: Vec<(String, DomainLogs)>,
    ) -> TxResult<Self> {
        config.validate()?;
        let scheduler = BackgroundScheduler::new(
            config.scheduler.worker_threads,
            config.scheduler.max_queue_depth,
        )
        .map_err(|e| TxError::system(format!("cannot start background scheduler: {}", e)))?;

        let shared = Arc::new(ServiceShared {
            config,
            scheduler,
            factory,
            providers,
            local_logs,
            peer_logs: peer_logs.into_iter().collect(),
            recoveries: DashMap::new(),
            live: RwLock::new(None),
            begin_lock: Mutex::new(()),
            sequence: AtomicU64::new(1),
            transactions: DashMap::new(),
            timers: DashMap::new(),
            metrics: MetricsRecorder::default(),
            accepting: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        });
        info!(
            target: "txcoord::service",
            server = %shared.config.server_name,
            logging = shared.local_logs.is_some(),
            workers = shared.config.scheduler.worker_threads,
            "Transaction service created"
        );
        Ok(TransactionService { shared })
    }

    /// Configuration in use.
    pub fn config(&self) -> &TxConfig {
        &self.shared.config
    }

    /// Name of the local failure domain.
    pub fn local_domain(&self) -> &str {
        &self.shared.config.server_name
    }

    /// True once `prepare_for_shutdown` or `shutdown` has been called.
    pub fn is_shutting_down(&self) -> bool {
        !self.shared.accepting.load(Ordering::SeqCst)
    }

    // === Begin and import ===

    /// Begin a transaction.
    ///
    /// With local logs, waits for local replay.
    ///
    /// # Errors
    /// `ShuttingDown` once shutdown has begun; `IllegalState` when local
    /// logs are configured but local recovery has not been initiated; the
    /// replay error when local replay failed.
    pub fn begin(&self) -> TxResult<Arc<TransactionCoordinator>> {
        let live = self.live_identity()?;
        let xid = self.next_xid(&live);
        let tx = Arc::new(TransactionCoordinator::new(live.env, xid));
        self.track(tx.clone());
        debug!(target: "txcoord::service", xid = %tx.xid(), "Transaction begun");
        Ok(tx)
    }

    /// Import a transaction from a foreign superior, or return the one
    /// already imported for it.
    ///
    /// # Errors
    /// As for `begin`.
    pub fn import(
        &self,
        superior: &Xid,
        owner: Option<String>,
    ) -> TxResult<Arc<TransactionCoordinator>> {
        let live = self.live_identity()?;
        if let Some(existing) = self.find_subordinate(superior) {
            return Ok(existing);
        }
        let xid = self.next_xid(&live);
        let tx = Arc::new(TransactionCoordinator::new_subordinate(
            live.env,
            xid,
            superior.clone(),
            owner,
        ));
        self.track(tx.clone());
        debug!(target: "txcoord::service", xid = %tx.xid(), superior = %superior, "Transaction imported");
        Ok(tx)
    }

    fn find_subordinate(&self, superior: &Xid) -> Option<Arc<TransactionCoordinator>> {
        self.shared
            .transactions
            .iter()
            .find(|e| e.value().superior() == Some(superior))
            .map(|e| e.value().clone())
    }

    fn next_xid(&self, live: &LiveIdentity) -> Xid {
        let sequence = self.shared.sequence.fetch_add(1, Ordering::SeqCst);
        Xid::global(live.appl_id, live.epoch, sequence)
    }

    fn track(&self, tx: Arc<TransactionCoordinator>) {
        self.shared.metrics.record_start();
        self.shared.transactions.insert(tx.xid().clone(), tx.clone());
        if let Some(deadline) = tx.deadline() {
            let delay = deadline.saturating_duration_since(Instant::now());
            let weak = Arc::downgrade(&self.shared);
            let xid = tx.xid().clone();
            let submitted = self
                .shared
                .scheduler
                .submit_after(delay, TaskPriority::High, move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.run_timeout(&xid);
                    }
                });
            match submitted {
                Ok(id) => {
                    self.shared.timers.insert(tx.xid().clone(), id);
                    // Expired and finished before the id was stored
                    if !self.shared.transactions.contains_key(tx.xid()) {
                        self.shared.timers.remove(tx.xid());
                    }
                }
                Err(e) => {
                    warn!(target: "txcoord::service", xid = %tx.xid(), error = %e, "Timeout not scheduled");
                }
            }
        }
    }

    fn live_identity(&self) -> TxResult<LiveIdentity> {
        if !self.shared.accepting.load(Ordering::SeqCst) {
            return Err(TxError::ShuttingDown);
        }
        if let Some(live) = self.shared.live.read().as_ref() {
            return Ok(live.clone());
        }

        let local = self.local_recovery();
        match &local {
            Some(recovery) => recovery.wait_for_replay_complete()?,
            None if self.shared.local_logs.is_some() => {
                return Err(TxError::illegal_state(format!(
                    "local recovery of {} has not been initiated",
                    self.local_domain()
                )));
            }
            None => {}
        }

        let _guard = self.shared.begin_lock.lock();
        if let Some(live) = self.shared.live.read().as_ref() {
            return Ok(live.clone());
        }
        let retry: Arc<dyn RetryScheduler> = Arc::new(ServiceRetryScheduler {
            shared: Arc::downgrade(&self.shared),
        });
        let listener: Arc<dyn CompletionListener> = Arc::new(ServiceListener {
            shared: Arc::downgrade(&self.shared),
        });
        let settings = self.shared.config.transaction.clone();

        let live = match local {
            Some(recovery) => {
                let (Some(service), Some(env)) = (recovery.service_data(), recovery.environment())
                else {
                    return Err(TxError::system("local replay finished without service data"));
                };
                LiveIdentity {
                    appl_id: service.appl_id,
                    epoch: service.epoch,
                    env: env.with_retry_scheduler(retry).with_listener(listener),
                }
            }
            None => {
                let mut partners = PartnerTable::unlogged();
                if let Some(factory) = &self.shared.factory {
                    partners = partners.with_factory(factory.clone());
                }
                let mut env = TxEnvironment::new(settings)
                    .with_partners(Arc::new(partners))
                    .with_retry_scheduler(retry)
                    .with_listener(listener);
                if let Some(providers) = &self.shared.providers {
                    env = env.with_providers(providers.clone());
                }
                warn!(target: "txcoord::service", "No local recovery: transactions run unlogged with two-phase commit disabled");
                LiveIdentity {
                    appl_id: Uuid::new_v4(),
                    epoch: 0,
                    env,
                }
            }
        };
        *self.shared.live.write() = Some(live.clone());
        Ok(live)
    }

    // === Lookup and completion ===

    /// A live transaction, or one being recovered in the local domain.
    pub fn lookup(&self, xid: &Xid) -> Option<Arc<TransactionCoordinator>> {
        self.shared.find(xid).or_else(|| {
            self.local_recovery()
                .and_then(|r| r.transactions().into_iter().find(|tx| tx.xid() == xid))
        })
    }

    fn require(&self, xid: &Xid) -> TxResult<Arc<TransactionCoordinator>> {
        self.lookup(xid)
            .ok_or_else(|| TxError::illegal_state(format!("unknown transaction {}", xid)))
    }

    /// Commit a transaction by xid.
    ///
    /// # Errors
    /// `IllegalState` for an unknown xid; otherwise as
    /// [`TransactionCoordinator::commit`].
    pub fn commit(&self, xid: &Xid) -> TxResult<()> {
        let tx = self.require(xid)?;
        tx.commit()
    }

    /// Roll a transaction back by xid.
    ///
    /// # Errors
    /// As [`TransactionCoordinator::rollback`].
    pub fn rollback(&self, xid: &Xid) -> TxResult<()> {
        let tx = self.require(xid)?;
        tx.rollback()
    }

    /// Ask an imported transaction for its vote.
    ///
    /// # Errors
    /// As [`TransactionCoordinator::prepare`].
    pub fn prepare(&self, xid: &Xid) -> TxResult<Vote> {
        let tx = self.require(xid)?;
        tx.prepare()
    }

    /// Commit an imported transaction in one phase.
    ///
    /// # Errors
    /// As [`TransactionCoordinator::commit_one_phase`].
    pub fn commit_one_phase(&self, xid: &Xid) -> TxResult<()> {
        let tx = self.require(xid)?;
        tx.commit_one_phase()
    }

    /// Operator resolution of a transaction awaiting manual completion,
    /// live or being recovered in any domain.
    ///
    /// # Errors
    /// `IllegalState` when no such transaction awaits manual completion.
    pub fn complete_manually(&self, xid: &Xid, commit: bool) -> TxResult<RetryStatus> {
        if let Some(tx) = self.shared.find(xid) {
            return tx.complete_manually(commit);
        }
        let recovery = self
            .shared
            .recoveries
            .iter()
            .map(|e| e.value().clone())
            .find(|r| r.transactions().iter().any(|tx| tx.xid() == xid))
            .ok_or_else(|| {
                TxError::illegal_state(format!("{} does not await manual completion", xid))
            })?;
        recovery.complete_manually(xid, commit)
    }

    // === Metrics ===

    /// Snapshot of the transaction counters.
    pub fn metrics(&self) -> TransactionMetrics {
        self.shared.metrics.snapshot()
    }

    /// Queue depths of the background scheduler, including pending
    /// timeouts and retries.
    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.shared.scheduler.stats()
    }

    /// Live transactions begun or imported through this service.
    pub fn active_count(&self) -> u64 {
        self.shared.metrics.active_count()
    }

    /// Wait until no live transaction is left.
    ///
    /// Returns false if `timeout` expired first.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        let sleep_duration = Duration::from_millis(1);

        loop {
            if self.shared.transactions.is_empty() {
                return true;
            }
            if start.elapsed() > timeout {
                return false;
            }
            std::thread::sleep(sleep_duration);
        }
    }

    // === Recovery lifecycle ===

    /// Start recovery of a failure domain: the local one (named after the
    /// server) or a peer domain registered with the builder.
    ///
    /// # Errors
    /// `IllegalState` for an unknown domain or one already being
    /// recovered; `ShuttingDown` after shutdown.
    pub fn initiate_recovery(&self, domain: &str) -> TxResult<()> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(TxError::ShuttingDown);
        }
        let is_local = domain == self.local_domain();
        let logs = if is_local {
            self.shared.local_logs.clone()
        } else {
            self.shared.peer_logs.get(domain).map(|e| e.value().clone())
        }
        .ok_or_else(|| TxError::illegal_state(format!("no logs for failure domain {}", domain)))?;

        if let Some(existing) = self.shared.recoveries.get(domain).map(|e| e.value().clone()) {
            // A stopped peer recovery may be started again; local recovery runs once
            if is_local || !existing.phase().is_final() {
                return Err(TxError::illegal_state(format!(
                    "recovery of {} already initiated",
                    domain
                )));
            }
        }

        let mut recovery = RecoveryCoordinator::new(
            domain,
            self.shared.config.server_name.clone(),
            self.shared.config.transaction.clone(),
            logs.tran_log,
            logs.partner_log,
        );
        if let Some(factory) = &self.shared.factory {
            recovery = recovery.with_factory(factory.clone());
        }
        if let Some(providers) = &self.shared.providers {
            recovery = recovery.with_providers(providers.clone());
        }
        let recovery = Arc::new(recovery);
        recovery.start()?;
        self.shared
            .recoveries
            .insert(domain.to_string(), recovery);
        info!(target: "txcoord::service", domain, local = is_local, "Recovery initiated");
        Ok(())
    }

    /// Stop recovery of a failure domain, leaving its logs for the next run.
    ///
    /// # Errors
    /// `IllegalState` when the domain is not being recovered.
    pub fn terminate_recovery(&self, domain: &str) -> TxResult<()> {
        let recovery = self
            .recovery(domain)
            .ok_or_else(|| TxError::illegal_state(format!("{} is not being recovered", domain)))?;
        recovery.terminate();
        info!(target: "txcoord::service", domain, phase = ?recovery.phase(), "Recovery terminated");
        Ok(())
    }

    /// Recovery of a failure domain, if initiated.
    pub fn recovery(&self, domain: &str) -> Option<Arc<RecoveryCoordinator>> {
        self.shared.recoveries.get(domain).map(|e| e.value().clone())
    }

    fn local_recovery(&self) -> Option<Arc<RecoveryCoordinator>> {
        self.recovery(self.local_domain())
    }

    /// Block until local replay has finished. Returns at once when local
    /// recovery was never initiated.
    ///
    /// # Errors
    /// The replay failure.
    pub fn wait_for_replay_complete(&self) -> TxResult<()> {
        match self.local_recovery() {
            Some(recovery) => recovery.wait_for_replay_complete(),
            None => Ok(()),
        }
    }

    /// Block until local reconciliation has finished. Returns at once when
    /// local recovery was never initiated.
    ///
    /// # Errors
    /// The recovery failure, or `ShuttingDown` when it was terminated.
    pub fn wait_for_recovery_complete(&self) -> TxResult<()> {
        match self.local_recovery() {
            Some(recovery) => recovery.wait_for_recovery_complete(),
            None => Ok(()),
        }
    }

    // === Shutdown ===

    /// Stop accepting new transactions. Live transactions may finish.
    pub fn prepare_for_shutdown(&self) {
        if self.shared.accepting.swap(false, Ordering::SeqCst) {
            info!(target: "txcoord::service", active = self.shared.transactions.len(), "Preparing for shutdown");
        }
    }

    /// Shut the service down.
    ///
    /// Stops every recovery worker. Unless `immediate`, first waits up to
    /// [`SHUTDOWN_GRACE`] for live transactions to finish. When local
    /// recovery had completed and nothing is left in flight, the local logs
    /// are compacted and marked `Stopped` so the next start knows the
    /// previous run ended cleanly.
    ///
    /// # Errors
    /// `Log` when the clean-shutdown marker cannot be written.
    pub fn shutdown(&self, immediate: bool) -> TxResult<()> {
        self.prepare_for_shutdown();
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if !immediate && !self.wait_for_idle(SHUTDOWN_GRACE) {
            warn!(target: "txcoord::service", active = self.shared.transactions.len(), "Transactions still in flight at shutdown");
        }

        for entry in self.shared.recoveries.iter() {
            entry.value().terminate();
        }
        self.shared.scheduler.shutdown();

        let in_flight = self.shared.transactions.len();
        let local = self.local_recovery();
        let clean = in_flight == 0
            && local
                .as_ref()
                .map_or(false, |r| r.phase() == RecoveryPhase::Recovered);

        if let (true, Some(recovery), Some(logs)) = (clean, &local, &self.shared.local_logs) {
            if let Some(service) = recovery.service_data() {
                logs.tran_log.keypoint()?;
                logs.partner_log.keypoint()?;
                logs.partner_log
                    .write_service_data(&service, ServerState::Stopped)?;
            }
        }

        if immediate || !clean {
            info!(target: "txcoord::service", immediate, in_flight, "Transaction service stopped");
        } else {
            info!(target: "txcoord::service", "Transaction service stopped cleanly");
        }
        Ok(())
    }
}

impl Drop for TransactionService {
    fn drop(&mut self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.accepting.store(false, Ordering::SeqCst);
        for entry in self.shared.recoveries.iter() {
            entry.value().terminate();
        }
        self.shared.scheduler.shutdown();
        if !self.shared.transactions.is_empty() {
            error!(target: "txcoord::service", in_flight = self.shared.transactions.len(), "Service dropped with transactions in flight");
        }
    }
}

impl std::fmt::Debug for TransactionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionService")
            .field("server", &self.shared.config.server_name)
            .field("live", &self.shared.transactions.len())
            .field("metrics", &self.metrics())
            .finish()
    }
}
