//! Recovery of one failure domain
//!
//! A failure domain is the pair of logs (transaction and partner) written
//! by one server. Recovery of a domain runs in two stages:
//!
//! 1. **Replay** (`replay`): read both logs, check their service data,
//!    restore the partner table, rebuild every logged transaction, drop
//!    records of finished work and write the service data back with the
//!    next epoch and `Starting`.
//! 2. **Reconciliation** (`reconcile_pass`, repeated by `start`'s worker
//!    thread with backoff): ask every restored partner for its in-doubt
//!    branches, mark branches that are no longer in doubt, roll back
//!    orphans that no record claims, then drive each rebuilt transaction
//!    with `recover()`. When nothing is left, unused partners are cleared,
//!    both logs are compacted and `Recovered` is written.
//!
//! The worker stops early on `terminate`, leaving the logs as they are for
//! the next run.

mod replay;
mod stats;

pub(crate) use replay::replay_error;
pub use replay::{replay_domain, ReplayedDomain};
pub use stats::RecoveryStats;

use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use txcoord_concurrency::{
    PartnerEntry, PartnerTable, RetryPolicy, RetryStatus, TransactionCoordinator, TxEnvironment,
};
use txcoord_core::{
    ProviderDirectory, ResourceFactory, TransactionSettings, TxError, TxResult, XaError, Xid,
};
use txcoord_durability::{PartnerLog, ServerState, ServiceData, TransactionLog};

/// Progress of a domain's recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryPhase {
    /// Nothing has run yet.
    NotStarted,
    /// Logs are being read.
    Replaying,
    /// Replay finished; reconciliation passes are running.
    Reconciling,
    /// Nothing left in doubt; `Recovered` has been written.
    Recovered,
    /// Stopped by `terminate` before finishing.
    Terminated,
    /// Replay or the final log update failed.
    Failed,
}

impl RecoveryPhase {
    /// True once replay has finished, successfully or not.
    pub fn replay_done(self) -> bool {
        !matches!(self, RecoveryPhase::NotStarted | RecoveryPhase::Replaying)
    }

    /// True once recovery will make no further progress.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            RecoveryPhase::Recovered | RecoveryPhase::Terminated | RecoveryPhase::Failed
        )
    }
}

/// Why recovery stopped, kept so every waiter gets the same error.
#[derive(Debug, Clone)]
enum Failure {
    Corrupted { log: String, reason: String },
    Other(String),
}

impl Failure {
    fn from_error(e: &TxError) -> Self {
        match e {
            TxError::Corrupted { log, reason } => Failure::Corrupted {
                log: log.clone(),
                reason: reason.clone(),
            },
            other => Failure::Other(other.to_string()),
        }
    }

    fn to_error(&self, domain: &str) -> TxError {
        match self {
            Failure::Corrupted { log, reason } => TxError::corrupted(log.clone(), reason.clone()),
            Failure::Other(msg) => {
                TxError::system(format!("recovery of {} failed: {}", domain, msg))
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Milestone {
    Replayed,
    Recovered,
}

impl Milestone {
    fn reached(self, phase: RecoveryPhase) -> bool {
        match self {
            Milestone::Replayed => phase.replay_done(),
            Milestone::Recovered => phase.is_final(),
        }
    }
}

struct RecoveryState {
    phase: RecoveryPhase,
    failure: Option<Failure>,
    service: Option<ServiceData>,
    recovered_epoch: u32,
    env: Option<TxEnvironment>,
    restored: Vec<u64>,
}

/// Replays and reconciles the logs of one failure domain.
pub struct RecoveryCoordinator {
    domain: String,
    server_name: String,
    settings: TransactionSettings,
    policy: RetryPolicy,
    tran_log: Arc<TransactionLog>,
    partner_log: Arc<PartnerLog>,
    partners: Arc<PartnerTable>,
    providers: Option<Arc<dyn ProviderDirectory>>,
    state: Mutex<RecoveryState>,
    changed: Condvar,
    transactions: Mutex<Vec<Arc<TransactionCoordinator>>>,
    contacted: Mutex<HashSet<u64>>,
    stats: Mutex<RecoveryStats>,
    shutdown: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RecoveryCoordinator {
    /// Recovery for the domain whose logs are given.
    ///
    /// `server_name` is used for the service data of fresh logs.
    pub fn new(
        domain: impl Into<String>,
        server_name: impl Into<String>,
        settings: TransactionSettings,
        tran_log: Arc<TransactionLog>,
        partner_log: Arc<PartnerLog>,
    ) -> Self {
        let partners = Arc::new(PartnerTable::new(partner_log.clone(), None));
        RecoveryCoordinator {
            domain: domain.into(),
            server_name: server_name.into(),
            policy: RetryPolicy::from_settings(&settings),
            settings,
            tran_log,
            partner_log,
            partners,
            providers: None,
            state: Mutex::new(RecoveryState {
                phase: RecoveryPhase::NotStarted,
                failure: None,
                service: None,
                recovered_epoch: 0,
                env: None,
                restored: Vec::new(),
            }),
            changed: Condvar::new(),
            transactions: Mutex::new(Vec::new()),
            contacted: Mutex::new(HashSet::new()),
            stats: Mutex::new(RecoveryStats::default()),
            shutdown: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    /// Reconnect to partners through `factory` (builder pattern).
    pub fn with_factory(mut self, factory: Arc<dyn ResourceFactory>) -> Self {
        self.partners = Arc::new(PartnerTable::new(self.partner_log.clone(), Some(factory)));
        self
    }

    /// Ask `providers` whether subordinate owners are installed (builder pattern).
    pub fn with_providers(mut self, providers: Arc<dyn ProviderDirectory>) -> Self {
        self.providers = Some(providers);
        self
    }

    // === Accessors ===

    /// Name of the failure domain.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Current phase.
    pub fn phase(&self) -> RecoveryPhase {
        self.state.lock().phase
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> RecoveryStats {
        self.stats.lock().clone()
    }

    /// Service data written for this run, once replay has finished.
    pub fn service_data(&self) -> Option<ServiceData> {
        self.state.lock().service.clone()
    }

    /// Highest epoch found in the logs, once replay has finished.
    pub fn recovered_epoch(&self) -> u32 {
        self.state.lock().recovered_epoch
    }

    /// Partner table restored from the partner log.
    pub fn partners(&self) -> &Arc<PartnerTable> {
        &self.partners
    }

    /// Transaction log of the domain.
    pub fn tran_log(&self) -> &Arc<TransactionLog> {
        &self.tran_log
    }

    /// Partner log of the domain.
    pub fn partner_log(&self) -> &Arc<PartnerLog> {
        &self.partner_log
    }

    /// Environment shared by the rebuilt transactions, once replay has
    /// finished. New work in the same domain uses it too.
    pub fn environment(&self) -> Option<TxEnvironment> {
        self.state.lock().env.clone()
    }

    /// Rebuilt transactions not yet completed.
    pub fn transactions(&self) -> Vec<Arc<TransactionCoordinator>> {
        self.transactions.lock().clone()
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn set_phase(&self, phase: RecoveryPhase) {
        let mut state = self.state.lock();
        state.phase = phase;
        self.changed.notify_all();
    }

    fn fail(&self, e: &TxError) {
        let mut state = self.state.lock();
        state.phase = RecoveryPhase::Failed;
        state.failure = Some(Failure::from_error(e));
        self.changed.notify_all();
    }

    // === Replay ===

    /// Replay the domain's logs and rebuild its transactions.
    ///
    /// # Errors
    /// `Corrupted` for inconsistent log data (recovery of the domain stops
    /// and the logs are left untouched); `Log` or `System` when the logs
    /// cannot be read or updated.
    pub fn replay(&self) -> TxResult<()> {
        self.set_phase(RecoveryPhase::Replaying);
        match self.replay_logs() {
            Ok(()) => {
                self.set_phase(RecoveryPhase::Reconciling);
                Ok(())
            }
            Err(e) => {
                error!(target: "txcoord::recovery", domain = %self.domain, error = %e, "Replay failed");
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn replay_logs(&self) -> TxResult<()> {
        let replayed = replay_domain(&self.server_name, &self.tran_log, &self.partner_log)?;

        let mut restored = Vec::with_capacity(replayed.partners.len());
        for record in replayed.partners {
            restored.push(self.partners.restore(record).recovery_id());
        }

        let mut env = TxEnvironment::new(self.settings.clone())
            .with_tran_log(self.tran_log.clone())
            .with_partners(self.partners.clone());
        if let Some(providers) = &self.providers {
            env = env.with_providers(providers.clone());
        }

        let mut rebuilt = Vec::with_capacity(replayed.transactions.len());
        for logged in &replayed.transactions {
            rebuilt.push(Arc::new(TransactionCoordinator::reconstruct(
                env.clone(),
                logged,
            )?));
        }

        for record in &replayed.discarded {
            self.tran_log
                .remove(*record)
                .map_err(|e| replay::replay_error(self.tran_log.name(), e))?;
        }

        // Log the new epoch before any work of this run can use it
        self.tran_log
            .write_service_data(&replayed.service)
            .map_err(|e| replay::replay_error(self.tran_log.name(), e))?;
        self.partner_log
            .write_service_data(&replayed.service, ServerState::Starting)
            .map_err(|e| replay::replay_error(self.partner_log.name(), e))?;

        {
            let mut stats = self.stats.lock();
            stats.recovered_epoch = replayed.recovered_epoch;
            stats.epoch = replayed.service.epoch;
            stats.transactions_recovered = rebuilt.len();
            stats.records_discarded = replayed.discarded.len();
            stats.partners_recovered = restored.len();
            stats.partners_ignored = replayed.ignored_partners;
        }

        info!(
            target: "txcoord::recovery",
            domain = %self.domain,
            epoch = replayed.service.epoch,
            transactions = rebuilt.len(),
            partners = restored.len(),
            discarded = replayed.discarded.len(),
            previous_state = ?replayed.previous_state,
            "Replay complete"
        );

        *self.transactions.lock() = rebuilt;
        let mut state = self.state.lock();
        state.service = Some(replayed.service);
        state.recovered_epoch = replayed.recovered_epoch;
        state.env = Some(env);
        state.restored = restored;
        Ok(())
    }

    // === Reconciliation ===

    /// Make one reconciliation pass.
    ///
    /// Returns `Ok(true)` once every restored partner has been contacted
    /// and every rebuilt transaction has completed.
    ///
    /// # Errors
    /// `IllegalState` before replay has finished.
    pub fn reconcile_pass(&self) -> TxResult<bool> {
        let (service, recovered_epoch, restored) = {
            let state = self.state.lock();
            match &state.service {
                Some(service) if state.phase == RecoveryPhase::Reconciling => {
                    (service.clone(), state.recovered_epoch, state.restored.clone())
                }
                _ => {
                    return Err(TxError::illegal_state(format!(
                        "recovery of {} is not reconciling ({:?})",
                        self.domain, state.phase
                    )))
                }
            }
        };
        let pass = {
            let mut stats = self.stats.lock();
            stats.passes += 1;
            stats.passes
        };
        debug!(target: "txcoord::recovery", domain = %self.domain, pass, "Reconciliation pass");

        let mut all_contacted = true;
        for recovery_id in restored {
            if self.is_shutting_down() {
                return Ok(false);
            }
            if self.contacted.lock().contains(&recovery_id) {
                continue;
            }
            let Some(partner) = self.partners.find(recovery_id) else {
                continue;
            };
            if self.reconcile_partner(&partner, &service, recovered_epoch) {
                partner.mark_recovered();
                self.contacted.lock().insert(recovery_id);
            } else {
                all_contacted = false;
            }
        }

        let pending = self.transactions();
        for tx in pending {
            if self.is_shutting_down() {
                return Ok(false);
            }
            match tx.recover() {
                RetryStatus::Pending => {}
                status => self.retire(tx.xid(), status),
            }
        }

        Ok(all_contacted && self.transactions.lock().is_empty())
    }

    /// Ask one partner what it holds in doubt. Returns false when the
    /// partner could not be reached or an orphan could not be rolled back.
    fn reconcile_partner(
        &self,
        partner: &Arc<PartnerEntry>,
        service: &ServiceData,
        recovered_epoch: u32,
    ) -> bool {
        let name = partner.descriptor().name.clone();
        let rm = match partner.connect() {
            Ok(rm) => rm,
            Err(code) => {
                warn!(target: "txcoord::recovery", partner = %name, ?code, "Cannot reach resource manager");
                return false;
            }
        };
        let listed = match rm.recover() {
            Ok(listed) => listed,
            Err(code) => {
                partner.reset_connection();
                warn!(target: "txcoord::recovery", partner = %name, ?code, "Resource manager recover failed");
                return false;
            }
        };

        let in_doubt: Vec<Xid> = listed
            .into_iter()
            .filter(|xid| {
                xid.is_own_format()
                    && xid.appl_id() == Some(service.appl_id)
                    && xid.epoch().map_or(false, |e| e <= recovered_epoch)
            })
            .collect();
        self.stats.lock().in_doubt_branches += in_doubt.len();

        let transactions = self.transactions();
        for tx in &transactions {
            tx.match_in_doubt(partner.recovery_id(), &in_doubt);
        }

        let mut settled = true;
        for xid in &in_doubt {
            if transactions.iter().any(|tx| tx.contains_branch(xid)) {
                continue;
            }
            match rm.rollback(xid) {
                Ok(()) | Err(XaError::NotA) => {
                    info!(target: "txcoord::recovery", partner = %name, xid = %xid, "Orphaned branch rolled back");
                    self.stats.lock().orphans_rolled_back += 1;
                }
                Err(code @ (XaError::HeurRb | XaError::HeurCom | XaError::HeurMix | XaError::HeurHaz)) => {
                    warn!(target: "txcoord::recovery", partner = %name, xid = %xid, ?code, "Orphaned branch completed heuristically");
                    if let Err(code) = rm.forget(xid) {
                        warn!(target: "txcoord::recovery", partner = %name, xid = %xid, ?code, "Cannot forget orphaned branch");
                    }
                    self.stats.lock().orphans_rolled_back += 1;
                }
                Err(code) => {
                    warn!(target: "txcoord::recovery", partner = %name, xid = %xid, ?code, "Cannot roll back orphaned branch");
                    if code == XaError::RmFail {
                        partner.reset_connection();
                    }
                    settled = false;
                }
            }
        }

        debug!(target: "txcoord::recovery", partner = %name, in_doubt = in_doubt.len(), settled, "Partner reconciled");
        settled
    }

    fn retire(&self, xid: &Xid, status: RetryStatus) {
        self.transactions.lock().retain(|tx| tx.xid() != xid);
        let mut stats = self.stats.lock();
        if status == RetryStatus::GaveUp {
            stats.transactions_abandoned += 1;
        } else {
            stats.transactions_completed += 1;
        }
    }

    /// Clear partners recovery no longer needs, compact both logs and
    /// record that the domain is recovered.
    ///
    /// # Errors
    /// `System` or `Log` when the logs cannot be updated.
    pub fn finish(&self) -> TxResult<()> {
        let service = self
            .service_data()
            .ok_or_else(|| TxError::illegal_state(format!("{} has not been replayed", self.domain)))?;

        let cleared = self.partners.clear_unused()?;
        self.tran_log
            .keypoint()
            .map_err(|e| replay::replay_error(self.tran_log.name(), e))?;
        self.partner_log
            .keypoint()
            .map_err(|e| replay::replay_error(self.partner_log.name(), e))?;
        self.partner_log
            .write_service_data(&service, ServerState::Recovered)
            .map_err(|e| replay::replay_error(self.partner_log.name(), e))?;

        let stats = {
            let mut stats = self.stats.lock();
            stats.partners_cleared += cleared;
            stats.clone()
        };
        info!(
            target: "txcoord::recovery",
            domain = %self.domain,
            passes = stats.passes,
            completed = stats.transactions_completed,
            abandoned = stats.transactions_abandoned,
            orphans = stats.orphans_rolled_back,
            "Recovery complete"
        );
        self.set_phase(RecoveryPhase::Recovered);
        Ok(())
    }

    // === Background worker ===

    /// Replay and reconcile on a dedicated thread.
    ///
    /// # Errors
    /// `IllegalState` if recovery was already started; `System` when the
    /// thread cannot be spawned.
    pub fn start(self: &Arc<Self>) -> TxResult<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() || self.phase() != RecoveryPhase::NotStarted {
            return Err(TxError::illegal_state(format!(
                "recovery of {} already started",
                self.domain
            )));
        }
        let this = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("txcoord-recovery-{}", self.domain))
            .spawn(move || this.run())
            .map_err(|e| TxError::system(format!("cannot spawn recovery thread: {}", e)))?;
        *worker = Some(handle);
        Ok(())
    }

    fn run(&self) {
        if self.replay().is_err() {
            return;
        }
        let mut pass = 0u32;
        loop {
            if self.is_shutting_down() {
                break;
            }
            match self.reconcile_pass() {
                Ok(true) => {
                    if let Err(e) = self.finish() {
                        error!(target: "txcoord::recovery", domain = %self.domain, error = %e, "Cannot record recovery");
                        self.fail(&e);
                    }
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(target: "txcoord::recovery", domain = %self.domain, error = %e, "Reconciliation pass failed");
                }
            }

            pass = pass.saturating_add(1);
            let delay = self.policy.delay_for(pass);
            let mut state = self.state.lock();
            if !self.is_shutting_down() {
                self.changed.wait_for(&mut state, delay);
            }
        }
        info!(target: "txcoord::recovery", domain = %self.domain, "Recovery terminated");
        let mut state = self.state.lock();
        if !state.phase.is_final() {
            state.phase = RecoveryPhase::Terminated;
        }
        self.changed.notify_all();
    }

    /// Wake the worker for an early pass.
    pub fn wake(&self) {
        let _state = self.state.lock();
        self.changed.notify_all();
    }

    /// Stop the worker and wait for it to exit.
    ///
    /// Transactions still in doubt stay in the log for the next run.
    pub fn terminate(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        {
            let mut state = self.state.lock();
            if state.phase == RecoveryPhase::NotStarted {
                state.phase = RecoveryPhase::Terminated;
            }
            self.changed.notify_all();
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    // === Waiting ===

    /// Block until replay has finished.
    ///
    /// # Errors
    /// The replay error when replay failed; `ShuttingDown` when recovery
    /// was terminated before replay.
    pub fn wait_for_replay_complete(&self) -> TxResult<()> {
        self.wait_for(Milestone::Replayed, None).map(|_| ())
    }

    /// Block until reconciliation has finished.
    ///
    /// # Errors
    /// The failure when recovery failed; `ShuttingDown` when it was
    /// terminated first.
    pub fn wait_for_recovery_complete(&self) -> TxResult<()> {
        self.wait_for(Milestone::Recovered, None).map(|_| ())
    }

    /// Like `wait_for_recovery_complete`, giving up after `timeout`.
    ///
    /// Returns `Ok(false)` on timeout.
    pub fn wait_for_recovery_complete_timeout(&self, timeout: Duration) -> TxResult<bool> {
        self.wait_for(Milestone::Recovered, Some(Instant::now() + timeout))
    }

    fn wait_for(&self, milestone: Milestone, deadline: Option<Instant>) -> TxResult<bool> {
        let mut state = self.state.lock();
        while !milestone.reached(state.phase) {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out()
                        && !milestone.reached(state.phase)
                    {
                        return Ok(false);
                    }
                }
                None => self.changed.wait(&mut state),
            }
        }
        match (state.phase, milestone) {
            (RecoveryPhase::Failed, _) => Err(state
                .failure
                .as_ref()
                .map(|f| f.to_error(&self.domain))
                .unwrap_or_else(|| TxError::system(format!("recovery of {} failed", self.domain)))),
            (RecoveryPhase::Terminated, Milestone::Replayed) if state.service.is_some() => Ok(true),
            (RecoveryPhase::Terminated, _) => Err(TxError::ShuttingDown),
            _ => Ok(true),
        }
    }

    // === Operator actions ===

    /// Resolve a rebuilt transaction awaiting manual completion.
    ///
    /// # Errors
    /// `IllegalState` when no such transaction is being recovered or it
    /// does not await manual completion.
    pub fn complete_manually(&self, xid: &Xid, commit: bool) -> TxResult<RetryStatus> {
        let tx = self
            .transactions()
            .into_iter()
            .find(|tx| tx.xid() == xid)
            .ok_or_else(|| {
                TxError::illegal_state(format!("{} is not being recovered in {}", xid, self.domain))
            })?;
        let status = tx.complete_manually(commit)?;
        if status != RetryStatus::Pending {
            self.retire(xid, status);
        }
        self.wake();
        Ok(status)
    }
}

impl std::fmt::Debug for RecoveryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryCoordinator")
            .field("domain", &self.domain)
            .field("phase", &self.phase())
            .field("stats", &self.stats())
            .finish()
    }
}
