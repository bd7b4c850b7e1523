//! Collaborators shared by every coordinator of one process.

use crate::partners::PartnerTable;
use crate::retry::{RetryPolicy, RetryScheduler};
use std::sync::Arc;
use txcoord_core::{HeuristicOutcome, ProviderDirectory, TransactionSettings, TransactionState, Xid};
use txcoord_durability::TransactionLog;

/// Observer of coordinator lifecycle events, for whoever tracks live
/// transactions.
///
/// Called with the coordinator's lock held: implementations must not call
/// back into the coordinator.
pub trait CompletionListener: Send + Sync {
    /// The transaction's deadline no longer applies; any timer for it can go.
    fn timeout_disarmed(&self, _xid: &Xid) {}

    /// The transaction was forgotten after reaching `outcome`.
    fn completed(&self, xid: &Xid, outcome: TransactionState, heuristic: HeuristicOutcome);
}

/// Settings, logs and schedulers threaded into each coordinator at
/// construction. Cloning is cheap.
#[derive(Clone)]
pub struct TxEnvironment {
    settings: TransactionSettings,
    tran_log: Option<Arc<TransactionLog>>,
    partners: Arc<PartnerTable>,
    retry: Option<Arc<dyn RetryScheduler>>,
    providers: Option<Arc<dyn ProviderDirectory>>,
    listener: Option<Arc<dyn CompletionListener>>,
}

impl TxEnvironment {
    /// An environment without logging or schedulers.
    pub fn new(settings: TransactionSettings) -> Self {
        TxEnvironment {
            settings,
            tran_log: None,
            partners: Arc::new(PartnerTable::unlogged()),
            retry: None,
            providers: None,
            listener: None,
        }
    }

    /// Use a transaction log (builder pattern).
    pub fn with_tran_log(mut self, log: Arc<TransactionLog>) -> Self {
        self.tran_log = Some(log);
        self
    }

    /// Use a partner table (builder pattern).
    pub fn with_partners(mut self, partners: Arc<PartnerTable>) -> Self {
        self.partners = partners;
        self
    }

    /// Use a retry scheduler (builder pattern).
    pub fn with_retry_scheduler(mut self, scheduler: Arc<dyn RetryScheduler>) -> Self {
        self.retry = Some(scheduler);
        self
    }

    /// Use a provider directory for subordinate owners (builder pattern).
    pub fn with_providers(mut self, providers: Arc<dyn ProviderDirectory>) -> Self {
        self.providers = Some(providers);
        self
    }

    /// Report disarmed deadlines and completions (builder pattern).
    pub fn with_listener(mut self, listener: Arc<dyn CompletionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Settings.
    pub fn settings(&self) -> &TransactionSettings {
        &self.settings
    }

    /// Retry policy derived from the settings.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_settings(&self.settings)
    }

    /// Transaction log, if logging.
    pub fn tran_log(&self) -> Option<&Arc<TransactionLog>> {
        self.tran_log.as_ref()
    }

    /// Partner table.
    pub fn partners(&self) -> &Arc<PartnerTable> {
        &self.partners
    }

    /// Retry scheduler, if any.
    pub fn retry_scheduler(&self) -> Option<&Arc<dyn RetryScheduler>> {
        self.retry.as_ref()
    }

    /// Provider directory, if any.
    pub fn providers(&self) -> Option<&Arc<dyn ProviderDirectory>> {
        self.providers.as_ref()
    }

    /// Completion listener, if any.
    pub fn listener(&self) -> Option<&Arc<dyn CompletionListener>> {
        self.listener.as_ref()
    }

    /// True when transactions are durably logged.
    ///
    /// A transaction born without a log cannot run two-phase commit safely.
    pub fn is_logging(&self) -> bool {
        self.tran_log.is_some()
    }
}

impl std::fmt::Debug for TxEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxEnvironment")
            .field("settings", &self.settings)
            .field("logging", &self.is_logging())
            .field("partners", &self.partners.len())
            .finish()
    }
}
