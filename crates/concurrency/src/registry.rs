//! Resource registry
//!
//! The registry owns every branch of one transaction and runs the protocol
//! passes over them:
//!
//! - enlistment, including same-resource-manager joins and log-early
//!   registration of the partner descriptor
//! - the voting pass ([`ResourceRegistry::distribute_prepare`]) with the
//!   one-phase and last-agent optimizations
//! - outcome delivery, forget and abandonment
//! - the transaction record in the transaction log
//!
//! ## Ordering
//!
//! When any branch carries a non-default priority, the voting pass sorts
//! branches by ascending priority (stable) and walks them backwards, and the
//! delivery passes sort by descending priority (stable) and walk forwards.
//! For priorities `[1, 1, 2, 2]` enlisted as `1a, 1b, 2a, 2b`:
//!
//! ```text
//! prepare: 2b 2a 1b 1a
//! commit:  2a 2b 1a 1b
//! ```
//!
//! Without priorities, prepare runs in reverse enlistment order and commit
//! in enlistment order.
//!
//! ## Heuristics
//!
//! Branch results are folded into the shared [`TxStateCell`] only once some
//! branch has diverged, so a clean transaction keeps the outcome `None`.
//! Transient failures (`RmFail`, `Retry`) never raise the outcome; they set
//! [`retry_required`](ResourceRegistry::retry_required).

use crate::branch::{Association, BranchHandle, ResourceBranch};
use crate::environment::TxEnvironment;
use crate::partners::RecoveredResource;
use crate::state::TxStateCell;
use std::sync::Arc;
use tracing::{debug, error, warn};
use txcoord_core::{
    BranchStatus, EndFlag, EnlistOptions, HeuristicOutcome, OnePhaseResource, RecordId,
    ResourceManager, StartFlag, TransactionState, TxError, TxResult, Vote, XaError, Xid,
    DEFAULT_PRIORITY,
};
use txcoord_durability::{LoggedTransaction, TransactionHeader};

/// Consolidated result of the voting pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// Every participant voted read-only; nothing left to deliver.
    ReadOnly,
    /// More than one participant prepared and the set has been logged.
    Prepared,
    /// Exactly one participant prepared; commit it without logging.
    SingleVote,
    /// Every other participant was read-only; the remaining one should be
    /// committed in one phase without a prepare.
    OnePhase,
    /// A one-phase participant was held back and now decides the outcome.
    LastAgent {
        /// Two-phase participants that voted to commit.
        prepared: usize,
    },
}

/// Branches of one transaction and the passes run over them.
pub struct ResourceRegistry {
    header: TransactionHeader,
    env: TxEnvironment,
    cell: Arc<TxStateCell>,
    branches: Vec<ResourceBranch>,
    joined: Option<ResourceBranch>,
    last_agent: Option<ResourceBranch>,
    next_branch: u32,
    next_handle: u32,
    has_priorities: bool,
    disable_two_phase: bool,
    record: Option<RecordId>,
    logged: bool,
    retry_required: bool,
    retry_pass: bool,
    system_error: Option<String>,
}

impl ResourceRegistry {
    pub(crate) fn new(env: TxEnvironment, cell: Arc<TxStateCell>, header: TransactionHeader) -> Self {
        let disable_two_phase = !env.is_logging();
        ResourceRegistry {
            header,
            env,
            cell,
            branches: Vec::new(),
            joined: None,
            last_agent: None,
            next_branch: 1,
            next_handle: 1,
            has_priorities: false,
            disable_two_phase,
            record: None,
            logged: false,
            retry_required: false,
            retry_pass: false,
            system_error: None,
        }
    }

    /// Rebuild the registry of a logged transaction.
    ///
    /// Every logged branch becomes a prepared branch reached through its
    /// partner entry.
    ///
    /// # Errors
    /// `Corrupted` when a branch names a partner the partner log does not have.
    pub(crate) fn reconstruct(
        env: TxEnvironment,
        cell: Arc<TxStateCell>,
        logged: &LoggedTransaction,
    ) -> TxResult<Self> {
        let mut registry = Self::new(env, cell, logged.header.clone());
        for entry in &logged.branches {
            let partner = registry.env.partners().find(entry.recovery_id).ok_or_else(|| {
                let log = registry
                    .env
                    .tran_log()
                    .map(|l| l.name().to_string())
                    .unwrap_or_default();
                TxError::corrupted(
                    log,
                    format!(
                        "branch {} of {} refers to unknown partner {}",
                        entry.xid, logged.header.xid, entry.recovery_id
                    ),
                )
            })?;
            let rm: Arc<dyn ResourceManager> = Arc::new(RecoveredResource::new(partner.clone()));
            let handle = registry.allocate_handle();
            if entry.priority != DEFAULT_PRIORITY {
                registry.has_priorities = true;
            }
            registry
                .branches
                .push(ResourceBranch::recovered(rm, partner, entry, handle));
        }
        registry.record = Some(logged.record);
        registry.logged = true;
        registry.retry_pass = true;
        Ok(registry)
    }

    fn allocate_handle(&mut self) -> BranchHandle {
        let handle = BranchHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn global(&self) -> &Xid {
        &self.header.xid
    }

    fn all_branches(&self) -> impl Iterator<Item = &ResourceBranch> {
        self.branches
            .iter()
            .chain(self.last_agent.iter())
            .chain(self.joined.iter())
    }

    fn find_mut(&mut self, handle: BranchHandle) -> Option<&mut ResourceBranch> {
        self.branches
            .iter_mut()
            .chain(self.joined.iter_mut())
            .chain(self.last_agent.iter_mut())
            .find(|b| b.handle() == handle)
    }

    // === Inspection ===

    /// Header written to the transaction record.
    pub fn header(&self) -> &TransactionHeader {
        &self.header
    }

    /// True when anything is enlisted.
    pub fn has_participants(&self) -> bool {
        !self.branches.is_empty() || self.last_agent.is_some()
    }

    /// True when exactly one participant would take part in completion.
    pub fn is_only_agent(&self) -> bool {
        self.branches.len() + usize::from(self.last_agent.is_some()) == 1
    }

    /// True when a one-phase participant is enlisted.
    pub fn has_last_agent(&self) -> bool {
        self.last_agent.is_some()
    }

    /// Set by the last delivery or forget pass when a branch still needs work.
    pub fn retry_required(&self) -> bool {
        self.retry_required
    }

    /// True once a transaction record exists.
    pub fn is_logged(&self) -> bool {
        self.record.is_some()
    }

    /// Name and status of every branch, in current pass order.
    pub fn branch_statuses(&self) -> Vec<(String, BranchStatus)> {
        self.all_branches()
            .map(|b| (b.name().to_string(), b.status()))
            .collect()
    }

    /// True when some branch carries this xid.
    pub fn contains_branch(&self, xid: &Xid) -> bool {
        self.branches.iter().any(|b| b.xid() == xid)
    }

    /// Recovery ids of the partners this transaction's branches use.
    pub fn recovery_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.branches.iter().filter_map(|b| b.recovery_id()).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    // === Enlistment ===

    /// Enlist a two-phase resource manager.
    ///
    /// Enlisting the same connection again returns its existing handle,
    /// resuming the association if it was suspended. A connection to the
    /// same resource manager as the first branch joins that branch when the
    /// coupling matches. Otherwise the partner descriptor is registered
    /// (and forced to the partner log) before a new branch is started.
    ///
    /// # Errors
    /// - `IllegalState` when two-phase commit is disabled and a participant exists
    /// - `Rollback` when the resource manager refuses to start the branch
    /// - `System` for any other start failure or a partner-log failure
    pub fn enlist(
        &mut self,
        rm: Arc<dyn ResourceManager>,
        options: &EnlistOptions,
        timeout_secs: Option<u64>,
    ) -> TxResult<BranchHandle> {
        let existing = self
            .branches
            .iter_mut()
            .chain(self.joined.iter_mut())
            .find(|b| b.holds(&rm));
        if let Some(branch) = existing {
            let handle = branch.handle();
            let result = match branch.association() {
                Association::Active => Ok(()),
                Association::Suspended | Association::Ended => branch.start(StartFlag::Join),
            };
            self.check_start(result, &rm)?;
            return Ok(handle);
        }

        if self.disable_two_phase && self.has_participants() {
            return Err(TxError::illegal_state(
                "two-phase commit is disabled for this transaction",
            ));
        }

        if let Some(master_xid) = self.joinable_master(&rm, options) {
            let handle = self.allocate_handle();
            let mut branch = ResourceBranch::joined(rm.clone(), master_xid, options.coupling, handle);
            let result = branch.start(StartFlag::Join);
            self.check_start(result, &rm)?;
            debug!(target: "txcoord::registry", xid = %branch.xid(), rm = %rm.name(), "Joined first branch");
            self.joined = Some(branch);
            return Ok(handle);
        }

        let partner = self.env.partners().register(&options.descriptor)?;
        if let Some(secs) = timeout_secs {
            // Advisory only: enlistment goes ahead either way
            match rm.set_transaction_timeout(secs) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(target: "txcoord::registry", xid = %self.header.xid, rm = %rm.name(), secs, "Transaction timeout not supported");
                }
                Err(e) => {
                    warn!(target: "txcoord::registry", xid = %self.header.xid, rm = %rm.name(), secs, error = %e, "Cannot set transaction timeout");
                }
            }
        }
        let xid = self.header.xid.branch(partner.recovery_id(), self.next_branch);
        self.next_branch += 1;
        let handle = self.allocate_handle();
        let mut branch = ResourceBranch::two_phase(
            rm.clone(),
            partner,
            xid,
            options.priority,
            options.coupling,
            handle,
        );
        let result = branch.start(StartFlag::NoFlags);
        self.check_start(result, &rm)?;
        if options.priority != DEFAULT_PRIORITY {
            self.has_priorities = true;
        }
        debug!(target: "txcoord::registry", xid = %branch.xid(), rm = %rm.name(), priority = options.priority, "Branch enlisted");
        self.branches.push(branch);
        Ok(handle)
    }

    fn joinable_master(&self, rm: &Arc<dyn ResourceManager>, options: &EnlistOptions) -> Option<Xid> {
        if self.joined.is_some() {
            return None;
        }
        let master = self.branches.iter().find(|b| !b.is_one_phase())?;
        if master.coupling() != options.coupling {
            return None;
        }
        let master_rm = master.resource_manager()?;
        match rm.is_same_rm(master_rm.as_ref()) {
            Ok(true) => Some(master.xid().clone()),
            Ok(false) | Err(_) => None,
        }
    }

    fn check_start(
        &self,
        result: Result<(), XaError>,
        rm: &Arc<dyn ResourceManager>,
    ) -> TxResult<()> {
        match result {
            Ok(()) => Ok(()),
            Err(XaError::Rollback(reason)) => {
                self.cell.rollback_only().set();
                Err(TxError::rollback(format!(
                    "{} refused to start a branch of {}: {:?}",
                    rm.name(),
                    self.global(),
                    reason
                )))
            }
            Err(e) => Err(TxError::system(format!(
                "{} failed to start a branch of {}: {}",
                rm.name(),
                self.global(),
                e
            ))),
        }
    }

    /// Enlist a one-phase-only resource.
    ///
    /// # Errors
    /// `IllegalState` when a different one-phase resource is already
    /// enlisted, or two-phase commit is disabled and a participant exists.
    pub fn enlist_one_phase(&mut self, resource: Arc<dyn OnePhaseResource>) -> TxResult<BranchHandle> {
        if let Some(existing) = &self.last_agent {
            if existing.holds_one_phase(&resource) {
                return Ok(existing.handle());
            }
            return Err(TxError::illegal_state(format!(
                "{} already has one-phase participant {}",
                self.global(),
                existing.name()
            )));
        }
        if self.disable_two_phase && self.has_participants() {
            return Err(TxError::illegal_state(
                "two-phase commit is disabled for this transaction",
            ));
        }
        let handle = self.allocate_handle();
        let branch = ResourceBranch::one_phase(resource, self.header.xid.clone(), handle);
        debug!(target: "txcoord::registry", xid = %self.header.xid, resource = %branch.name(), "One-phase resource enlisted");
        self.last_agent = Some(branch);
        Ok(handle)
    }

    /// End a participant's association.
    ///
    /// A rollback answer from the resource manager dooms the transaction
    /// but is not an error.
    ///
    /// # Errors
    /// `IllegalState` for an unknown handle, `System` for other end failures.
    pub fn delist(&mut self, handle: BranchHandle, flag: EndFlag) -> TxResult<()> {
        let global = self.header.xid.clone();
        let cell = self.cell.clone();
        let branch = self.find_mut(handle).ok_or_else(|| {
            TxError::illegal_state(format!("{:?} is not enlisted in {}", handle, global))
        })?;
        match branch.end(flag) {
            Ok(()) => Ok(()),
            Err(XaError::Rollback(reason)) => {
                debug!(target: "txcoord::registry", xid = %branch.xid(), ?reason, "Branch marked rollback-only on end");
                cell.rollback_only().set();
                Ok(())
            }
            Err(e) => Err(TxError::system(format!(
                "{} failed to end branch {}: {}",
                branch.name(),
                branch.xid(),
                e
            ))),
        }
    }

    /// End every active association before voting or rolling back.
    /// Returns false when any end failed.
    pub(crate) fn distribute_end(&mut self, flag: EndFlag) -> bool {
        let mut ok = true;
        for branch in self.branches.iter_mut().rev().chain(self.joined.iter_mut()) {
            match branch.end(flag) {
                Ok(()) => {}
                Err(XaError::Rollback(reason)) => {
                    debug!(target: "txcoord::registry", xid = %branch.xid(), ?reason, "Rollback-only on end");
                    ok = false;
                }
                Err(e) => {
                    warn!(target: "txcoord::registry", xid = %branch.xid(), rm = %branch.name(), error = %e, "End failed");
                    branch.set_status(BranchStatus::RolledBack);
                    ok = false;
                }
            }
        }
        ok
    }

    // === Voting ===

    fn sort_for_prepare(&mut self) {
        if self.has_priorities {
            self.branches.sort_by_key(|b| b.priority());
        }
    }

    fn sort_for_commit(&mut self) {
        if self.has_priorities {
            self.branches.sort_by(|a, b| b.priority().cmp(&a.priority()));
        }
    }

    /// Run the voting pass.
    ///
    /// `optimize` allows the one-phase optimizations; it is never set for a
    /// subordinate. A subordinate carrying a one-phase participant cannot
    /// vote to commit.
    ///
    /// # Errors
    /// - `Rollback` when a participant vetoes or the transaction becomes rollback-only
    /// - `HeuristicMixed`/`HeuristicHazard` when a participant diverged while preparing
    /// - `System` for unexpected codes or a transaction-log failure
    pub fn distribute_prepare(&mut self, subordinate: bool, optimize: bool) -> TxResult<PrepareOutcome> {
        if subordinate && self.last_agent.is_some() {
            error!(target: "txcoord::registry", xid = %self.header.xid, "Subordinate transaction carries a one-phase participant");
            return Err(TxError::rollback(
                "a subordinate transaction cannot complete a one-phase participant",
            ));
        }

        self.sort_for_prepare();

        let mut ok_votes = 0usize;
        for i in (0..self.branches.len()).rev() {
            if optimize && i == 0 && ok_votes == 0 && self.last_agent.is_none() {
                debug!(target: "txcoord::registry", xid = %self.header.xid, "Remaining participant committed in one phase");
                return Ok(PrepareOutcome::OnePhase);
            }
            let vote = self.prepare_branch(i)?;
            if self.cell.rollback_only().is_set() {
                return Err(TxError::rollback(format!(
                    "{} marked rollback-only while preparing",
                    self.header.xid
                )));
            }
            if vote == Vote::Ok {
                ok_votes += 1;
            }
        }

        if ok_votes == 1 && optimize && self.last_agent.is_none() {
            return Ok(PrepareOutcome::SingleVote);
        }
        if ok_votes > 0 {
            self.log_resources()?;
        }
        if self.last_agent.is_some() {
            return Ok(PrepareOutcome::LastAgent { prepared: ok_votes });
        }
        Ok(if ok_votes == 0 {
            PrepareOutcome::ReadOnly
        } else {
            PrepareOutcome::Prepared
        })
    }

    fn prepare_branch(&mut self, i: usize) -> TxResult<Vote> {
        let global = self.header.xid.clone();
        let branch = &mut self.branches[i];
        if branch.status() != BranchStatus::Registered {
            return Ok(Vote::ReadOnly);
        }
        let result = branch.prepare();
        debug!(target: "txcoord::registry", xid = %branch.xid(), rm = %branch.name(), ?result, "Prepare");
        match result {
            Ok(Vote::Ok) => {
                branch.set_status(BranchStatus::Prepared);
                Ok(Vote::Ok)
            }
            Ok(Vote::ReadOnly) => {
                branch.set_status(BranchStatus::Completed);
                Ok(Vote::ReadOnly)
            }
            Err(XaError::Rollback(_)) | Err(XaError::NotA) => {
                branch.set_status(BranchStatus::RolledBack);
                Err(TxError::rollback(format!(
                    "{} voted to roll back {}",
                    branch.name(),
                    global
                )))
            }
            Err(XaError::HeurMix) => {
                warn!(target: "txcoord::registry", xid = %branch.xid(), rm = %branch.name(), "Heuristic mixed on prepare");
                branch.set_status(BranchStatus::HeuristicMixed);
                self.cell.raise_heuristic(HeuristicOutcome::Mixed);
                Err(TxError::HeuristicMixed(global))
            }
            Err(XaError::HeurHaz) => {
                warn!(target: "txcoord::registry", xid = %branch.xid(), rm = %branch.name(), "Heuristic hazard on prepare");
                branch.set_status(BranchStatus::HeuristicHazard);
                self.cell.raise_heuristic(HeuristicOutcome::Hazard);
                Err(TxError::HeuristicHazard(global))
            }
            Err(XaError::RmFail) => {
                // Outcome of the vote is unknown; make sure rollback reaches it
                branch.set_status(BranchStatus::Prepared);
                Err(TxError::rollback(format!(
                    "{} became unavailable while preparing {}",
                    branch.name(),
                    global
                )))
            }
            Err(XaError::RmErr) => {
                branch.set_status(BranchStatus::Prepared);
                Err(TxError::system(format!(
                    "{} failed to prepare {}",
                    branch.name(),
                    global
                )))
            }
            Err(e) => Err(TxError::system(format!(
                "{} answered {} to prepare of {}",
                branch.name(),
                e,
                global
            ))),
        }
    }

    /// Commit one participant in a single phase: the held-back one-phase
    /// participant if any, otherwise the first branch.
    ///
    /// With `last_participant` set, a heuristic commit or rollback is the
    /// decision rather than a divergence: the branch ends plainly committed
    /// or rolled back and needs no forget.
    pub fn flow_commit_one_phase(&mut self, last_participant: bool) -> TxResult<()> {
        let global = self.header.xid.clone();
        let target = match self.last_agent.as_mut() {
            Some(branch) => branch,
            None => self
                .branches
                .first_mut()
                .ok_or_else(|| TxError::system(format!("{} has no participant", global)))?,
        };

        target.set_status(BranchStatus::CompletingOnePhase);
        let result = target.commit(true);
        debug!(target: "txcoord::registry", xid = %global, rm = %target.name(), ?result, "Commit one phase");

        let raised = match result {
            Ok(()) => {
                target.set_status(BranchStatus::Committed);
                return Ok(());
            }
            Err(XaError::Rollback(_)) | Err(XaError::RmErr) => {
                target.set_status(BranchStatus::RolledBack);
                return Err(TxError::rollback(format!(
                    "{} rolled back {}",
                    target.name(),
                    global
                )));
            }
            Err(XaError::NotA) => {
                target.set_status(BranchStatus::Completed);
                return Err(TxError::rollback(format!(
                    "{} has no record of {}",
                    target.name(),
                    global
                )));
            }
            Err(XaError::HeurCom) if last_participant => {
                debug!(target: "txcoord::registry", xid = %global, rm = %target.name(), "Last participant committed heuristically");
                target.set_status(BranchStatus::Committed);
                return Ok(());
            }
            Err(XaError::HeurRb) if last_participant => {
                target.set_status(BranchStatus::RolledBack);
                return Err(TxError::rollback(format!(
                    "last participant {} rolled back {}",
                    target.name(),
                    global
                )));
            }
            Err(XaError::HeurCom) => {
                target.set_status(BranchStatus::HeuristicCommit);
                HeuristicOutcome::Commit
            }
            Err(XaError::HeurRb) => {
                target.set_status(BranchStatus::HeuristicRollback);
                HeuristicOutcome::Rollback
            }
            Err(XaError::HeurMix) => {
                target.set_status(BranchStatus::HeuristicMixed);
                HeuristicOutcome::Mixed
            }
            Err(XaError::HeurHaz) => {
                target.set_status(BranchStatus::HeuristicHazard);
                HeuristicOutcome::Hazard
            }
            Err(XaError::RmFail) => {
                target.set_status(BranchStatus::Completed);
                HeuristicOutcome::Hazard
            }
            Err(e @ (XaError::Inval | XaError::Proto | XaError::Retry)) => {
                target.set_status(BranchStatus::Completed);
                return Err(TxError::system(format!(
                    "{} answered {} to one-phase commit of {}",
                    target.name(),
                    e,
                    global
                )));
            }
        };

        warn!(target: "txcoord::registry", xid = %global, outcome = ?raised, "Heuristic outcome on one-phase commit");
        self.cell.raise_heuristic(raised);
        match self.cell.heuristic() {
            HeuristicOutcome::Commit | HeuristicOutcome::None => Ok(()),
            HeuristicOutcome::Rollback if last_participant => Err(TxError::rollback(format!(
                "last participant rolled back {}",
                global
            ))),
            HeuristicOutcome::Rollback => Err(TxError::HeuristicRollback(global)),
            HeuristicOutcome::Hazard => Err(TxError::HeuristicHazard(global)),
            HeuristicOutcome::Mixed => Err(TxError::HeuristicMixed(global)),
        }
    }

    // === Outcome delivery ===

    /// Deliver commit to every prepared branch.
    ///
    /// # Errors
    /// `System` for unexpected codes; otherwise the heuristic error matching
    /// the combined outcome when it contradicts commit.
    pub fn distribute_commit(&mut self) -> TxResult<()> {
        self.sort_for_commit();
        self.distribute_outcome(true);
        if let Some(msg) = self.system_error.take() {
            return Err(TxError::system(msg));
        }
        let global = self.header.xid.clone();
        match self.cell.heuristic() {
            HeuristicOutcome::None | HeuristicOutcome::Commit => Ok(()),
            HeuristicOutcome::Rollback => Err(TxError::HeuristicRollback(global)),
            HeuristicOutcome::Hazard => Err(TxError::HeuristicHazard(global)),
            HeuristicOutcome::Mixed => Err(TxError::HeuristicMixed(global)),
        }
    }

    /// Deliver rollback to every branch that may hold work.
    ///
    /// # Errors
    /// `System` for unexpected codes; a heuristic error only when this pass
    /// raised the outcome from `None` to something contradicting rollback.
    pub fn distribute_rollback(&mut self) -> TxResult<()> {
        let saved = self.cell.heuristic();
        self.sort_for_commit();
        self.distribute_outcome(false);
        if let Some(msg) = self.system_error.take() {
            return Err(TxError::system(msg));
        }
        if saved.is_heuristic() {
            return Ok(());
        }
        let global = self.header.xid.clone();
        match self.cell.heuristic() {
            HeuristicOutcome::None | HeuristicOutcome::Rollback => Ok(()),
            HeuristicOutcome::Commit => Err(TxError::HeuristicCommit(global)),
            HeuristicOutcome::Hazard => Err(TxError::HeuristicHazard(global)),
            HeuristicOutcome::Mixed => Err(TxError::HeuristicMixed(global)),
        }
    }

    fn distribute_outcome(&mut self, commit: bool) {
        self.retry_required = false;
        self.system_error = None;
        for i in 0..self.branches.len() {
            self.deliver_outcome(i, commit);
        }
        if !commit {
            self.rollback_last_agent();
        }
        self.fold_heuristic();
        self.retry_pass = true;
    }

    fn deliver_outcome(&mut self, i: usize, commit: bool) {
        let retry_pass = self.retry_pass;
        let branch = &mut self.branches[i];
        let before = branch.status();
        match before {
            BranchStatus::Prepared => branch.set_status(BranchStatus::Completing),
            BranchStatus::Completing => {}
            BranchStatus::Registered if !commit => {}
            _ => return,
        }

        let result = if commit {
            branch.commit(false)
        } else {
            branch.rollback()
        };
        debug!(target: "txcoord::registry", xid = %branch.xid(), rm = %branch.name(), commit, ?result, "Deliver outcome");

        let done = if commit {
            BranchStatus::Committed
        } else {
            BranchStatus::RolledBack
        };
        let mut raise = HeuristicOutcome::None;
        match result {
            Ok(()) => branch.set_status(done),
            Err(XaError::HeurCom) => branch.set_status(BranchStatus::HeuristicCommit),
            Err(XaError::HeurRb) => branch.set_status(BranchStatus::HeuristicRollback),
            Err(XaError::HeurMix) => branch.set_status(BranchStatus::HeuristicMixed),
            Err(XaError::HeurHaz) => branch.set_status(BranchStatus::HeuristicHazard),
            Err(XaError::RmErr) | Err(XaError::Rollback(_)) => {
                branch.set_status(BranchStatus::RolledBack);
                if commit {
                    raise = HeuristicOutcome::Rollback;
                }
            }
            Err(XaError::RmFail) if before == BranchStatus::Registered => {
                // Never prepared: the resource manager rolls back on its own
                branch.set_status(BranchStatus::RolledBack);
            }
            Err(XaError::RmFail) | Err(XaError::Retry) => {
                debug!(target: "txcoord::registry", xid = %branch.xid(), rm = %branch.name(), "Outcome delivery deferred");
                self.retry_required = true;
            }
            Err(XaError::NotA) => {
                if commit && !retry_pass {
                    raise = HeuristicOutcome::Hazard;
                }
                branch.set_status(BranchStatus::Completed);
            }
            Err(e @ (XaError::Proto | XaError::Inval)) => {
                error!(target: "txcoord::registry", xid = %branch.xid(), rm = %branch.name(), code = %e, "Protocol error delivering outcome");
                branch.set_status(BranchStatus::Completed);
                self.system_error = Some(format!(
                    "{} answered {} to {} of {}",
                    branch.name(),
                    e,
                    if commit { "commit" } else { "rollback" },
                    branch.xid()
                ));
            }
        }

        if branch.status().is_heuristic() {
            warn!(target: "txcoord::registry", xid = %branch.xid(), rm = %branch.name(), status = %branch.status(), "Participant diverged");
        }
        if raise.is_heuristic() {
            warn!(target: "txcoord::registry", xid = %branch.xid(), rm = %branch.name(), outcome = ?raise, "Commit not applied by participant");
            self.cell.raise_heuristic(raise);
        }
    }

    fn rollback_last_agent(&mut self) {
        let Some(branch) = self.last_agent.as_mut() else {
            return;
        };
        if branch.status() != BranchStatus::Registered {
            return;
        }
        let result = branch.rollback();
        debug!(target: "txcoord::registry", rm = %branch.name(), ?result, "Rollback one-phase participant");
        match result {
            Ok(()) | Err(XaError::Rollback(_)) | Err(XaError::NotA) => {
                branch.set_status(BranchStatus::RolledBack)
            }
            Err(XaError::HeurCom) => branch.set_status(BranchStatus::HeuristicCommit),
            Err(XaError::HeurRb) => branch.set_status(BranchStatus::HeuristicRollback),
            Err(XaError::HeurMix) => branch.set_status(BranchStatus::HeuristicMixed),
            Err(XaError::HeurHaz) => branch.set_status(BranchStatus::HeuristicHazard),
            Err(e) => {
                warn!(target: "txcoord::registry", rm = %branch.name(), error = %e, "One-phase rollback failed");
                branch.set_status(BranchStatus::Completed);
            }
        }
    }

    fn fold_heuristic(&mut self) {
        let diverged = self.cell.heuristic().is_heuristic()
            || self.all_branches().any(|b| b.status().is_heuristic());
        if !diverged {
            return;
        }
        let combined = self
            .all_branches()
            .map(|b| b.status().heuristic())
            .fold(HeuristicOutcome::None, HeuristicOutcome::combine);
        self.cell.raise_heuristic(combined);
    }

    /// Deliver forget to every branch left in a heuristic status.
    ///
    /// # Errors
    /// `System` when a participant answers with a protocol error.
    pub fn distribute_forget(&mut self) -> TxResult<()> {
        let mut failure = None;
        let mut retry = false;
        for branch in self.branches.iter_mut().chain(self.last_agent.iter_mut()) {
            if !branch.status().is_heuristic() {
                continue;
            }
            let result = branch.forget();
            debug!(target: "txcoord::registry", xid = %branch.xid(), rm = %branch.name(), ?result, "Forget");
            match result {
                Ok(()) | Err(XaError::NotA) => branch.set_status(BranchStatus::Completed),
                Err(XaError::RmErr) | Err(XaError::RmFail) | Err(XaError::Retry) => retry = true,
                Err(e) => {
                    error!(target: "txcoord::registry", xid = %branch.xid(), rm = %branch.name(), code = %e, "Forget failed");
                    branch.set_status(BranchStatus::Completed);
                    failure = Some(format!("{} answered {} to forget of {}", branch.name(), e, branch.xid()));
                }
            }
        }
        self.retry_required |= retry;
        match failure {
            Some(msg) => Err(TxError::system(msg)),
            None => Ok(()),
        }
    }

    /// Give up on every branch not yet final.
    pub fn abandon(&mut self) {
        for branch in self.branches.iter_mut().chain(self.last_agent.iter_mut()) {
            if !branch.status().is_final() {
                warn!(target: "txcoord::registry", xid = %branch.xid(), rm = %branch.name(), status = %branch.status(), "Abandoning branch");
                branch.set_status(BranchStatus::Completed);
            }
        }
        self.retry_required = false;
    }

    /// After reconstruction: mark prepared branches of this partner that
    /// the resource manager no longer holds in doubt as completed.
    /// Returns the number of branches still in doubt.
    pub fn match_in_doubt(&mut self, recovery_id: u64, in_doubt: &[Xid]) -> usize {
        let mut matched = 0;
        for branch in self
            .branches
            .iter_mut()
            .filter(|b| b.recovery_id() == Some(recovery_id))
        {
            if !matches!(branch.status(), BranchStatus::Prepared | BranchStatus::Completing) {
                continue;
            }
            if in_doubt.contains(branch.xid()) {
                matched += 1;
            } else {
                debug!(target: "txcoord::recovery", xid = %branch.xid(), recovery_id, "Branch no longer in doubt");
                branch.set_status(BranchStatus::Completed);
            }
        }
        matched
    }

    // === Transaction record ===

    /// Write the transaction record with every prepared branch. Runs once;
    /// not forced until the next state is logged.
    pub fn log_resources(&mut self) -> TxResult<()> {
        if self.logged {
            return Ok(());
        }
        self.logged = true;
        let Some(log) = self.env.tran_log().cloned() else {
            return Ok(());
        };
        let record = log.create_transaction(&self.header).map_err(log_failure)?;
        for branch in &self.branches {
            if branch.status() != BranchStatus::Prepared {
                continue;
            }
            if let Some(entry) = branch.log_entry() {
                log.add_branch(record, &entry).map_err(log_failure)?;
            }
        }
        self.record = Some(record);
        debug!(target: "txcoord::registry", xid = %self.header.xid, record, "Prepared branches logged");
        Ok(())
    }

    /// Record a recoverable state in the transaction record, if one exists.
    pub fn log_state(&self, state: TransactionState) -> TxResult<()> {
        match (self.record, self.env.tran_log()) {
            (Some(record), Some(log)) if state.is_recoverable() => {
                log.set_state(record, state).map_err(log_failure)
            }
            _ => Ok(()),
        }
    }

    /// Record the combined heuristic outcome, if a record exists.
    pub fn log_heuristic(&self, outcome: HeuristicOutcome) -> TxResult<()> {
        match (self.record, self.env.tran_log()) {
            (Some(record), Some(log)) => log.set_heuristic(record, outcome).map_err(log_failure),
            _ => Ok(()),
        }
    }

    /// Remove the transaction record, if one exists.
    pub fn remove_record(&mut self) -> TxResult<()> {
        match (self.record.take(), self.env.tran_log()) {
            (Some(record), Some(log)) => log.remove(record).map_err(log_failure),
            _ => Ok(()),
        }
    }
}

fn log_failure(e: txcoord_core::LogError) -> TxError {
    TxError::system(format!("transaction log: {}", e))
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("xid", &self.header.xid)
            .field("branches", &self.branches)
            .field("joined", &self.joined)
            .field("last_agent", &self.last_agent)
            .field("record", &self.record)
            .finish()
    }
}
