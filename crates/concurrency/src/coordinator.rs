//! Transaction coordinator
//!
//! One [`TransactionCoordinator`] drives one global transaction through the
//! state machine:
//!
//! ```text
//! ACTIVE ─► PREPARING ─┬─► PREPARED (subordinate) ─┐
//!   │                  ├─► COMMITTING ◄────────────┤
//!   │                  ├─► COMMITTING_ONE_PHASE     │
//!   │                  └─► LAST_PARTICIPANT ────────┤
//!   └─────────────────────► ROLLING_BACK ◄──────────┘
//!
//! COMMITTING   ─► COMMITTED   | HEURISTIC_ON_COMMIT   ─► NONE
//! ROLLING_BACK ─► ROLLED_BACK | HEURISTIC_ON_ROLLBACK ─► NONE
//! ```
//!
//! The whole commit, rollback or recover sequence of one transaction runs
//! under a single mutex. The rollback-only flag is the exception: it is an
//! atomic shared with timers and callbacks, which may set it at any time.
//!
//! Outcome delivery never blocks on an unreachable participant. When a pass
//! leaves work behind, a [`RetryTask`](crate::RetryTask) is handed to the
//! environment's scheduler, which later calls
//! [`retry_completion`](TransactionCoordinator::retry_completion). During
//! recovery the reconciliation loop calls
//! [`recover`](TransactionCoordinator::recover) again instead.

use crate::branch::BranchHandle;
use crate::environment::TxEnvironment;
use crate::registry::{PrepareOutcome, ResourceRegistry};
use crate::retry::RetryStatus;
use crate::state::{RollbackOnlyFlag, TxStateCell, TxStatus};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use txcoord_core::{
    BranchStatus, EndFlag, EnlistOptions, HeuristicDirection, HeuristicOutcome, OnePhaseResource,
    ResourceManager, Synchronization, TransactionState, TxError, TxResult, Vote, Xid,
};
use txcoord_durability::{LoggedTransaction, TransactionHeader};

use TransactionState::{
    Active, Committed, Committing, CommittingOnePhase, HeuristicOnCommit, HeuristicOnRollback,
    LastParticipant, Prepared, Preparing, RolledBack, RollingBack,
};

struct CoordinatorInner {
    registry: ResourceRegistry,
    syncs: Vec<Arc<dyn Synchronization>>,
    after_completion_done: bool,
    attempts: u32,
    recovering: bool,
    recover_passes: u32,
    needs_manual: bool,
    logged_heuristic: HeuristicOutcome,
    outcome: Option<TransactionState>,
}

/// Coordinator of one global transaction.
pub struct TransactionCoordinator {
    xid: Xid,
    subordinate: bool,
    superior: Option<Xid>,
    owner: Option<String>,
    env: TxEnvironment,
    cell: Arc<TxStateCell>,
    deadline: Option<Instant>,
    timeout_armed: AtomicBool,
    inner: Mutex<CoordinatorInner>,
}

impl TransactionCoordinator {
    /// Begin a superior transaction.
    pub fn new(env: TxEnvironment, xid: Xid) -> Self {
        Self::build(env, xid, false, None, None)
    }

    /// Import a transaction as a subordinate of `superior`, optionally owned
    /// by an external provider.
    pub fn new_subordinate(
        env: TxEnvironment,
        xid: Xid,
        superior: Xid,
        owner: Option<String>,
    ) -> Self {
        Self::build(env, xid, true, Some(superior), owner)
    }

    fn build(
        env: TxEnvironment,
        xid: Xid,
        subordinate: bool,
        superior: Option<Xid>,
        owner: Option<String>,
    ) -> Self {
        let cell = Arc::new(TxStateCell::new());
        let header = TransactionHeader {
            xid: xid.clone(),
            subordinate,
            superior: superior.clone(),
            owner: owner.clone(),
        };
        let registry = ResourceRegistry::new(env.clone(), cell.clone(), header);
        let deadline = env.settings().transaction_timeout().map(|t| Instant::now() + t);
        TransactionCoordinator {
            xid,
            subordinate,
            superior,
            owner,
            env,
            cell,
            deadline,
            timeout_armed: AtomicBool::new(true),
            inner: Mutex::new(CoordinatorInner::new(registry, false, HeuristicOutcome::None)),
        }
    }

    /// Rebuild a transaction from its log record.
    ///
    /// # Errors
    /// `Corrupted` when a logged branch names an unknown partner.
    pub fn reconstruct(env: TxEnvironment, logged: &LoggedTransaction) -> TxResult<Self> {
        let cell = Arc::new(TxStateCell::reconstructed(logged.state, logged.heuristic));
        let registry = ResourceRegistry::reconstruct(env.clone(), cell.clone(), logged)?;
        let header = &logged.header;
        debug!(target: "txcoord::recovery", xid = %header.xid, state = %logged.state, branches = logged.branches.len(), "Transaction reconstructed");
        Ok(TransactionCoordinator {
            xid: header.xid.clone(),
            subordinate: header.subordinate,
            superior: header.superior.clone(),
            owner: header.owner.clone(),
            env,
            cell,
            deadline: None,
            timeout_armed: AtomicBool::new(false),
            inner: Mutex::new(CoordinatorInner::new(registry, true, logged.heuristic)),
        })
    }

    // === Accessors ===

    /// Global transaction id.
    pub fn xid(&self) -> &Xid {
        &self.xid
    }

    /// True for an imported transaction.
    pub fn is_subordinate(&self) -> bool {
        self.subordinate
    }

    /// Superior's xid, for subordinates.
    pub fn superior(&self) -> Option<&Xid> {
        self.superior.as_ref()
    }

    /// External provider owning a subordinate.
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Current protocol state.
    pub fn state(&self) -> TransactionState {
        self.cell.state()
    }

    /// Snapshot of state, heuristic outcome and rollback-only flag.
    pub fn status(&self) -> TxStatus {
        self.cell.snapshot()
    }

    /// The rollback-only flag, for timers.
    pub fn rollback_only_flag(&self) -> RollbackOnlyFlag {
        self.cell.rollback_only().clone()
    }

    /// When the transaction times out, if it has a timeout.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True until completion starts; afterwards a timer expiry is ignored.
    pub fn is_timeout_armed(&self) -> bool {
        self.timeout_armed.load(Ordering::SeqCst)
    }

    /// Remaining lifetime in whole seconds (at least 1), if timed.
    pub fn remaining_timeout_secs(&self) -> Option<u64> {
        self.deadline.map(|d| {
            d.saturating_duration_since(Instant::now())
                .as_secs()
                .max(1)
        })
    }

    /// Final state reached before the transaction was forgotten.
    pub fn outcome(&self) -> Option<TransactionState> {
        self.inner.lock().outcome
    }

    /// True when an operator must decide the outcome.
    pub fn needs_manual_completion(&self) -> bool {
        self.inner.lock().needs_manual
    }

    /// Delivery retries made so far.
    pub fn attempts(&self) -> u32 {
        self.inner.lock().attempts
    }

    /// Name and status of every participant.
    pub fn branch_statuses(&self) -> Vec<(String, BranchStatus)> {
        self.inner.lock().registry.branch_statuses()
    }

    /// True once a transaction record has been written.
    pub fn is_logged(&self) -> bool {
        self.inner.lock().registry.is_logged()
    }

    /// Partner recovery ids used by this transaction's branches.
    pub fn recovery_ids(&self) -> Vec<u64> {
        self.inner.lock().registry.recovery_ids()
    }

    /// True when one of this transaction's branches carries `xid`.
    pub fn contains_branch(&self, xid: &Xid) -> bool {
        self.inner.lock().registry.contains_branch(xid)
    }

    /// Reconcile this transaction's branches with a partner's in-doubt
    /// list. Returns the number of branches still in doubt.
    pub fn match_in_doubt(&self, recovery_id: u64, in_doubt: &[Xid]) -> usize {
        self.inner.lock().registry.match_in_doubt(recovery_id, in_doubt)
    }

    fn require(&self, allowed: &[TransactionState], op: &str) -> TxResult<TransactionState> {
        let state = self.cell.state();
        if allowed.contains(&state) {
            Ok(state)
        } else {
            Err(TxError::illegal_state(format!(
                "cannot {} {} in state {}",
                op, self.xid, state
            )))
        }
    }

    fn check_not_doomed(&self) -> TxResult<()> {
        if self.cell.rollback_only().is_set() {
            return Err(TxError::rollback(format!(
                "{} is marked rollback-only",
                self.xid
            )));
        }
        Ok(())
    }

    /// Stop the deadline from dooming the transaction. Called under the
    /// coordinator lock once completion has been requested.
    fn disarm_timeout(&self) {
        if self.timeout_armed.swap(false, Ordering::SeqCst) {
            if let Some(listener) = self.env.listener() {
                listener.timeout_disarmed(&self.xid);
            }
        }
    }

    fn advance(&self, next: TransactionState) {
        if let Err(e) = self.cell.transition(next) {
            error!(target: "txcoord::txn", xid = %self.xid, error = %e, "State transition refused");
        }
    }

    // === Work association ===

    /// Enlist a two-phase resource manager.
    ///
    /// # Errors
    /// - `IllegalState` unless `ACTIVE`
    /// - `Rollback` once rollback-only
    /// - whatever [`ResourceRegistry::enlist`] reports
    pub fn enlist(
        &self,
        rm: Arc<dyn ResourceManager>,
        options: &EnlistOptions,
    ) -> TxResult<BranchHandle> {
        let mut inner = self.inner.lock();
        self.require(&[Active], "enlist in")?;
        self.check_not_doomed()?;
        inner
            .registry
            .enlist(rm, options, self.remaining_timeout_secs())
    }

    /// Enlist a one-phase-only resource.
    pub fn enlist_one_phase(&self, resource: Arc<dyn OnePhaseResource>) -> TxResult<BranchHandle> {
        let mut inner = self.inner.lock();
        self.require(&[Active], "enlist in")?;
        self.check_not_doomed()?;
        inner.registry.enlist_one_phase(resource)
    }

    /// End a participant's association with the transaction.
    pub fn delist(&self, handle: BranchHandle, flag: EndFlag) -> TxResult<()> {
        let mut inner = self.inner.lock();
        self.require(&[Active], "delist from")?;
        inner.registry.delist(handle, flag)
    }

    /// Register completion callbacks.
    pub fn register_synchronization(&self, sync: Arc<dyn Synchronization>) -> TxResult<()> {
        let mut inner = self.inner.lock();
        self.require(&[Active], "register a synchronization with")?;
        self.check_not_doomed()?;
        inner.syncs.push(sync);
        Ok(())
    }

    /// Doom the transaction. Does not take the coordinator lock, so it may
    /// be called from a synchronization callback.
    pub fn set_rollback_only(&self) -> TxResult<()> {
        self.require(&[Active, Preparing], "mark rollback-only")?;
        if self.cell.rollback_only().set() {
            debug!(target: "txcoord::txn", xid = %self.xid, "Marked rollback-only");
        }
        Ok(())
    }

    // === Completion ===

    /// Commit the transaction.
    ///
    /// For a superior this runs the whole protocol from `ACTIVE`. For a
    /// subordinate it delivers the superior's commit decision to a
    /// `PREPARED` transaction.
    ///
    /// # Errors
    /// `Rollback`, one of the heuristic errors, `System`, or `IllegalState`.
    pub fn commit(&self) -> TxResult<()> {
        let mut inner = self.inner.lock();
        if self.subordinate {
            self.require(&[Prepared], "commit")?;
            inner.registry.log_state(Committing)?;
            self.cell.transition(Committing)?;
            debug!(target: "txcoord::txn", xid = %self.xid, "Superior decided commit");
            return self.deliver_commit(&mut inner);
        }
        self.require(&[Active], "commit")?;
        self.disarm_timeout();
        self.commit_active(&mut inner)
    }

    /// Commit a subordinate in one phase at its superior's request.
    pub fn commit_one_phase(&self) -> TxResult<()> {
        let mut inner = self.inner.lock();
        if !self.subordinate {
            return Err(TxError::illegal_state(format!(
                "{} is not a subordinate",
                self.xid
            )));
        }
        self.require(&[Active], "commit in one phase")?;
        self.disarm_timeout();
        self.commit_active(&mut inner)
    }

    /// Vote on a subordinate transaction.
    ///
    /// Returns `Vote::Ok` once the prepared set is durably logged and the
    /// transaction waits in `PREPARED`, or `Vote::ReadOnly` when nothing is
    /// left to complete.
    ///
    /// # Errors
    /// `Rollback` when the transaction rolled back instead; heuristic and
    /// system errors as for commit.
    pub fn prepare(&self) -> TxResult<Vote> {
        let mut inner = self.inner.lock();
        if !self.subordinate {
            return Err(TxError::illegal_state(format!(
                "{} is not a subordinate",
                self.xid
            )));
        }
        self.require(&[Active], "prepare")?;
        self.disarm_timeout();
        let inner = &mut *inner;

        self.before_completion(inner);
        if !inner.registry.distribute_end(EndFlag::Success) {
            self.cell.rollback_only().set();
        }
        if self.cell.rollback_only().is_set() {
            return Err(self.roll_back_doomed(inner));
        }
        if !inner.registry.has_participants() {
            self.cell.transition(Committed)?;
            self.post_completion(inner, true);
            return Ok(Vote::ReadOnly);
        }

        self.cell.transition(Preparing)?;
        match inner.registry.distribute_prepare(true, false) {
            Ok(PrepareOutcome::ReadOnly) => {
                self.cell.transition(Committed)?;
                self.post_completion(inner, true);
                Ok(Vote::ReadOnly)
            }
            Ok(PrepareOutcome::Prepared) => {
                if let Err(e) = inner.registry.log_state(Prepared) {
                    return Err(self.prepare_failed(inner, e));
                }
                self.cell.transition(Prepared)?;
                debug!(target: "txcoord::txn", xid = %self.xid, "Prepared, awaiting superior");
                Ok(Vote::Ok)
            }
            Ok(other) => {
                let e = TxError::system(format!("unexpected vote {:?} for a subordinate", other));
                Err(self.prepare_failed(inner, e))
            }
            Err(e) => Err(self.prepare_failed(inner, e)),
        }
    }

    /// Roll the transaction back.
    ///
    /// # Errors
    /// `IllegalState` unless `ACTIVE` (or `PREPARED` for a subordinate); a
    /// heuristic error when a participant had already committed.
    pub fn rollback(&self) -> TxResult<()> {
        let mut inner = self.inner.lock();
        let state = self.cell.state();
        match state {
            Active => {
                self.disarm_timeout();
                inner.registry.distribute_end(EndFlag::Fail);
                self.cell.transition(RollingBack)?;
            }
            Prepared if self.subordinate => {
                self.cell.transition(RollingBack)?;
                if let Err(e) = inner.registry.log_state(RollingBack) {
                    error!(target: "txcoord::txn", xid = %self.xid, error = %e, "Cannot log rollback decision");
                }
            }
            _ => {
                return Err(TxError::illegal_state(format!(
                    "cannot roll back {} in state {}",
                    self.xid, state
                )))
            }
        }
        debug!(target: "txcoord::txn", xid = %self.xid, "Rolling back");
        self.deliver_rollback(&mut inner)
    }

    /// Timer expiry: if the transaction is still `ACTIVE` and no completion
    /// has started, mark it rollback-only and roll it back. Otherwise a
    /// no-op.
    pub fn timeout_rollback(&self) -> TxResult<()> {
        // Completion in progress holds the lock; it already disarmed us
        if !self.timeout_armed.load(Ordering::SeqCst) {
            debug!(target: "txcoord::txn", xid = %self.xid, "Timeout ignored after completion started");
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if self.cell.state() != Active || !self.timeout_armed.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.cell.rollback_only().set();
        info!(target: "txcoord::txn", xid = %self.xid, "Transaction timed out");
        inner.registry.distribute_end(EndFlag::Fail);
        self.cell.transition(RollingBack)?;
        self.deliver_rollback(&mut inner)
    }

    fn before_completion(&self, inner: &CoordinatorInner) {
        for sync in &inner.syncs {
            if let Err(e) = sync.before_completion() {
                warn!(target: "txcoord::txn", xid = %self.xid, error = %e, "before_completion failed");
                self.cell.rollback_only().set();
            }
        }
    }

    fn commit_active(&self, inner: &mut CoordinatorInner) -> TxResult<()> {
        debug!(target: "txcoord::txn", xid = %self.xid, "Commit requested");
        self.before_completion(inner);
        if !inner.registry.distribute_end(EndFlag::Success) {
            self.cell.rollback_only().set();
        }
        if self.cell.rollback_only().is_set() {
            return Err(self.roll_back_doomed(inner));
        }

        if !inner.registry.has_participants() {
            self.cell.transition(Committed)?;
            self.post_completion(inner, true);
            return Ok(());
        }
        if inner.registry.is_only_agent() {
            return self.commit_one_phase_path(inner);
        }

        self.cell.transition(Preparing)?;
        let optimize = self.env.settings().one_phase_optimization;
        match inner.registry.distribute_prepare(false, optimize) {
            Ok(PrepareOutcome::ReadOnly) => {
                self.cell.transition(Committed)?;
                self.post_completion(inner, true);
                Ok(())
            }
            Ok(PrepareOutcome::OnePhase) => self.commit_one_phase_path(inner),
            Ok(PrepareOutcome::SingleVote) => {
                self.cell.transition(Committing)?;
                self.deliver_commit(inner)
            }
            Ok(PrepareOutcome::Prepared) => {
                if let Err(e) = inner.registry.log_state(Committing) {
                    return Err(self.prepare_failed(inner, e));
                }
                self.cell.transition(Committing)?;
                self.deliver_commit(inner)
            }
            Ok(PrepareOutcome::LastAgent { prepared }) => self.complete_last_agent(inner, prepared),
            Err(e) => Err(self.prepare_failed(inner, e)),
        }
    }

    fn roll_back_doomed(&self, inner: &mut CoordinatorInner) -> TxError {
        debug!(target: "txcoord::txn", xid = %self.xid, "Rollback-only at completion");
        self.advance(RollingBack);
        let delivered = self.deliver_rollback(inner);
        escalate(
            TxError::rollback(format!("{} was marked rollback-only", self.xid)),
            delivered,
        )
    }

    fn prepare_failed(&self, inner: &mut CoordinatorInner, e: TxError) -> TxError {
        if e.is_heuristic() {
            warn!(target: "txcoord::txn", xid = %self.xid, error = %e, "Heuristic outcome while preparing");
            if let Err(le) = inner.registry.log_heuristic(self.cell.heuristic()) {
                error!(target: "txcoord::txn", xid = %self.xid, error = %le, "Cannot log heuristic outcome");
            }
        } else if matches!(e, TxError::System(_)) {
            error!(target: "txcoord::txn", xid = %self.xid, error = %e, "Prepare failed");
        } else {
            debug!(target: "txcoord::txn", xid = %self.xid, error = %e, "Participant vetoed commit");
        }
        self.advance(RollingBack);
        let delivered = self.deliver_rollback(inner);
        escalate(e, delivered)
    }

    fn commit_one_phase_path(&self, inner: &mut CoordinatorInner) -> TxResult<()> {
        self.cell.transition(CommittingOnePhase)?;
        let result = inner.registry.flow_commit_one_phase(false);
        match &result {
            Ok(()) => {
                self.settle(inner, true);
                self.post_completion(inner, true);
            }
            Err(e) if e.is_heuristic() => {
                self.settle(inner, true);
                self.post_completion(inner, true);
            }
            Err(e) => {
                debug!(target: "txcoord::txn", xid = %self.xid, error = %e, "One-phase commit did not commit");
                self.advance(RolledBack);
                self.post_completion(inner, false);
            }
        }
        result
    }

    fn complete_last_agent(&self, inner: &mut CoordinatorInner, prepared: usize) -> TxResult<()> {
        if prepared == 0 {
            return self.commit_one_phase_path(inner);
        }
        if !self.env.settings().accept_heuristic_hazard {
            error!(target: "txcoord::txn", xid = %self.xid, "One-phase participant enlisted with two-phase participants");
            self.advance(RollingBack);
            let delivered = self.deliver_rollback(inner);
            return Err(escalate(
                TxError::rollback("last participant support is disabled"),
                delivered,
            ));
        }

        self.cell.transition(LastParticipant)?;
        if let Err(e) = inner.registry.log_state(LastParticipant) {
            return Err(self.prepare_failed(inner, e));
        }

        match inner.registry.flow_commit_one_phase(true) {
            Ok(()) => {
                if let Err(e) = inner.registry.log_state(Committing) {
                    error!(target: "txcoord::txn", xid = %self.xid, error = %e, "Cannot log commit decision");
                }
                self.cell.transition(Committing)?;
                self.deliver_commit(inner)
            }
            // Partly committed: the prepared branches still roll back
            Err(e @ TxError::HeuristicMixed(_)) => {
                warn!(target: "txcoord::txn", xid = %self.xid, "Last participant completed mixed; rolling back prepared branches");
                self.advance(RollingBack);
                if let Err(le) = inner.registry.log_state(RollingBack) {
                    error!(target: "txcoord::txn", xid = %self.xid, error = %le, "Cannot log rollback decision");
                }
                let delivered = self.deliver_rollback(inner);
                Err(escalate(e, delivered))
            }
            Err(e) if e.is_heuristic() => {
                warn!(target: "txcoord::txn", xid = %self.xid, error = %e, "Outcome of last participant unknown");
                self.resolve_by_direction(inner);
                Err(TxError::HeuristicHazard(self.xid.clone()))
            }
            Err(e) => {
                self.advance(RollingBack);
                if let Err(le) = inner.registry.log_state(RollingBack) {
                    error!(target: "txcoord::txn", xid = %self.xid, error = %le, "Cannot log rollback decision");
                }
                let delivered = self.deliver_rollback(inner);
                Err(escalate(e, delivered))
            }
        }
    }

    /// Decide an outcome this coordinator cannot determine, per the
    /// configured heuristic direction.
    fn resolve_by_direction(&self, inner: &mut CoordinatorInner) -> RetryStatus {
        let direction = self.env.settings().heuristic_completion_direction;
        warn!(target: "txcoord::txn", xid = %self.xid, state = %self.cell.state(), ?direction, "Applying heuristic completion direction");
        match direction {
            HeuristicDirection::Commit => self.decide(inner, Committing),
            HeuristicDirection::Rollback => self.decide(inner, RollingBack),
            HeuristicDirection::Manual => {
                inner.needs_manual = true;
                warn!(target: "txcoord::txn", xid = %self.xid, "Transaction awaits manual completion");
                RetryStatus::Pending
            }
        }
    }

    fn decide(&self, inner: &mut CoordinatorInner, decision: TransactionState) -> RetryStatus {
        if let Err(e) = inner.registry.log_state(decision) {
            error!(target: "txcoord::txn", xid = %self.xid, error = %e, "Cannot log decision");
        }
        self.advance(decision);
        self.redrive(inner, decision)
    }

    fn deliver_commit(&self, inner: &mut CoordinatorInner) -> TxResult<()> {
        let result = inner.registry.distribute_commit();
        self.settle(inner, true);
        self.post_completion(inner, true);
        result
    }

    fn deliver_rollback(&self, inner: &mut CoordinatorInner) -> TxResult<()> {
        let result = inner.registry.distribute_rollback();
        self.settle(inner, false);
        self.post_completion(inner, false);
        result
    }

    /// Move to the heuristic sub-state when the outcome diverged, and to the
    /// plain final state once no branch needs another pass.
    fn settle(&self, inner: &mut CoordinatorInner, commit: bool) {
        let outcome = self.cell.heuristic();
        if outcome.is_heuristic() {
            let target = if commit { HeuristicOnCommit } else { HeuristicOnRollback };
            let state = self.cell.state();
            if state != target && state.can_transition_to(target) {
                self.advance(target);
                if let Err(e) = inner.registry.log_state(target) {
                    error!(target: "txcoord::txn", xid = %self.xid, error = %e, "Cannot log heuristic state");
                }
            }
            if inner.logged_heuristic != outcome {
                warn!(target: "txcoord::txn", xid = %self.xid, ?outcome, "Heuristic outcome");
                match inner.registry.log_heuristic(outcome) {
                    Ok(()) => inner.logged_heuristic = outcome,
                    Err(e) => {
                        error!(target: "txcoord::txn", xid = %self.xid, error = %e, "Cannot log heuristic outcome")
                    }
                }
            }
        }
        if !inner.registry.retry_required() {
            let state = self.cell.state();
            if matches!(state, Committing | CommittingOnePhase) && commit {
                self.advance(Committed);
            } else if state == RollingBack && !commit {
                self.advance(RolledBack);
            }
        }
    }

    fn post_completion(&self, inner: &mut CoordinatorInner, commit: bool) -> RetryStatus {
        if self.cell.heuristic().is_heuristic() {
            if let Err(e) = inner.registry.distribute_forget() {
                error!(target: "txcoord::txn", xid = %self.xid, error = %e, "Forget failed");
            }
        }
        if !inner.after_completion_done {
            inner.after_completion_done = true;
            let reported = if commit { Committed } else { RolledBack };
            for sync in &inner.syncs {
                sync.after_completion(reported);
            }
        }
        if inner.registry.retry_required() {
            return self.schedule_retry(inner, commit);
        }
        self.forget(inner);
        RetryStatus::Done
    }

    fn schedule_retry(&self, inner: &mut CoordinatorInner, commit: bool) -> RetryStatus {
        let policy = self.env.retry_policy();
        let Some(task) = policy.next(&self.xid, inner.attempts) else {
            self.give_up(inner, commit);
            return RetryStatus::GaveUp;
        };
        if inner.recovering {
            return RetryStatus::Pending;
        }
        match self.env.retry_scheduler() {
            Some(scheduler) => {
                debug!(target: "txcoord::txn", xid = %self.xid, attempt = task.attempt, delay_ms = task.delay.as_millis() as u64, "Retry scheduled");
                scheduler.schedule(task);
            }
            None => {
                warn!(target: "txcoord::txn", xid = %self.xid, "No retry scheduler; completion resumes at recovery");
            }
        }
        RetryStatus::Pending
    }

    fn give_up(&self, inner: &mut CoordinatorInner, commit: bool) {
        error!(target: "txcoord::txn", xid = %self.xid, attempts = inner.attempts, "Retry limit exhausted, abandoning remaining branches");
        inner.registry.abandon();
        self.cell.raise_heuristic(HeuristicOutcome::Mixed);
        self.settle(inner, commit);
        if let Err(e) = inner.registry.distribute_forget() {
            error!(target: "txcoord::txn", xid = %self.xid, error = %e, "Forget failed");
        }
        self.forget(inner);
    }

    fn forget(&self, inner: &mut CoordinatorInner) {
        let state = self.cell.state();
        inner.outcome = Some(state);
        if let Err(e) = inner.registry.remove_record() {
            error!(target: "txcoord::txn", xid = %self.xid, error = %e, "Cannot remove transaction record");
        }
        self.advance(TransactionState::None);
        self.timeout_armed.store(false, Ordering::SeqCst);
        debug!(target: "txcoord::txn", xid = %self.xid, outcome = %state, "Transaction forgotten");
        if let Some(listener) = self.env.listener() {
            listener.completed(&self.xid, state, self.cell.heuristic());
        }
    }

    // === Retries and recovery ===

    fn redrive(&self, inner: &mut CoordinatorInner, state: TransactionState) -> RetryStatus {
        if state.is_commit_family() {
            if let Err(e) = inner.registry.distribute_commit() {
                warn!(target: "txcoord::txn", xid = %self.xid, error = %e, "Commit redelivery");
            }
            self.settle(inner, true);
            self.post_completion(inner, true)
        } else if state.is_rollback_family() {
            if let Err(e) = inner.registry.distribute_rollback() {
                warn!(target: "txcoord::txn", xid = %self.xid, error = %e, "Rollback redelivery");
            }
            self.settle(inner, false);
            self.post_completion(inner, false)
        } else {
            RetryStatus::Pending
        }
    }

    /// Make one more delivery pass for a transaction whose previous pass
    /// left work behind.
    pub fn retry_completion(&self) -> RetryStatus {
        let mut inner = self.inner.lock();
        let state = self.cell.state();
        if state == TransactionState::None {
            return RetryStatus::Done;
        }
        inner.attempts += 1;
        debug!(target: "txcoord::txn", xid = %self.xid, attempt = inner.attempts, state = %state, "Retrying completion");
        self.redrive(&mut inner, state)
    }

    /// Drive a reconstructed transaction towards completion.
    ///
    /// Commit-family states redeliver commit and rollback-family states
    /// redeliver rollback; branches already final are not contacted again.
    /// A prepared subordinate waits for its superior while its owner is
    /// installed (or, without an owner, until the retry limit is exhausted)
    /// and otherwise applies the configured direction, as does a transaction
    /// whose last participant's outcome is unknown.
    pub fn recover(&self) -> RetryStatus {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let state = self.cell.state();
        if state == TransactionState::None {
            return RetryStatus::Done;
        }
        if inner.needs_manual {
            return RetryStatus::Pending;
        }
        if inner.recover_passes > 0 {
            inner.attempts += 1;
        }
        inner.recover_passes += 1;
        debug!(target: "txcoord::recovery", xid = %self.xid, state = %state, pass = inner.recover_passes, "Recovering transaction");

        match state {
            Prepared => self.recover_in_doubt(inner),
            LastParticipant => {
                warn!(target: "txcoord::recovery", xid = %self.xid, "Outcome of last participant unknown after restart");
                self.resolve_by_direction(inner)
            }
            Active | Preparing => self.decide(inner, RollingBack),
            other => self.redrive(inner, other),
        }
    }

    fn recover_in_doubt(&self, inner: &mut CoordinatorInner) -> RetryStatus {
        match &self.owner {
            Some(owner) => {
                let installed = self
                    .env
                    .providers()
                    .map(|p| p.is_provider_installed(owner))
                    .unwrap_or(true);
                if installed {
                    debug!(target: "txcoord::recovery", xid = %self.xid, owner = %owner, "Waiting for owner to complete");
                    RetryStatus::Pending
                } else {
                    warn!(target: "txcoord::recovery", xid = %self.xid, owner = %owner, "Owner of subordinate no longer installed");
                    self.resolve_by_direction(inner)
                }
            }
            None if self.env.retry_policy().is_exhausted(inner.attempts) => {
                warn!(target: "txcoord::recovery", xid = %self.xid, attempts = inner.attempts, "Superior did not complete subordinate");
                self.resolve_by_direction(inner)
            }
            None => RetryStatus::Pending,
        }
    }

    /// Operator resolution of a transaction awaiting manual completion.
    ///
    /// # Errors
    /// `IllegalState` unless the transaction awaits manual completion;
    /// `System` when the decision cannot be logged.
    pub fn complete_manually(&self, commit: bool) -> TxResult<RetryStatus> {
        let mut inner = self.inner.lock();
        if !inner.needs_manual {
            return Err(TxError::illegal_state(format!(
                "{} does not await manual completion",
                self.xid
            )));
        }
        let decision = if commit { Committing } else { RollingBack };
        inner.registry.log_state(decision)?;
        self.cell.transition(decision)?;
        inner.needs_manual = false;
        info!(target: "txcoord::txn", xid = %self.xid, commit, "Manual completion");
        Ok(self.redrive(&mut inner, decision))
    }
}

impl CoordinatorInner {
    fn new(registry: ResourceRegistry, recovering: bool, logged_heuristic: HeuristicOutcome) -> Self {
        CoordinatorInner {
            registry,
            syncs: Vec::new(),
            after_completion_done: recovering,
            attempts: 0,
            recovering,
            recover_passes: 0,
            needs_manual: false,
            logged_heuristic,
            outcome: None,
        }
    }
}

/// Pick the error reported to the caller: a system error from the rollback
/// pass outranks a heuristic one, which outranks a plain rollback.
fn escalate(primary: TxError, delivered: TxResult<()>) -> TxError {
    match delivered {
        Err(e @ TxError::System(_)) => e,
        Err(e) if e.is_heuristic() && primary.is_rollback() => e,
        _ => primary,
    }
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("xid", &self.xid)
            .field("subordinate", &self.subordinate)
            .field("status", &self.cell.snapshot())
            .finish()
    }
}
