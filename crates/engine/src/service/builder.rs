//! Builder for the transaction service
//!
//! Logs, the resource factory and the provider directory are all optional.
//! A service without local logs runs every transaction unlogged.

use super::{DomainLogs, TransactionService};
use crate::config::TxConfig;
use crate::recovery::replay_error;
use std::path::Path;
use std::sync::Arc;
use txcoord_core::{ProviderDirectory, RecoveryLog, ResourceFactory, TxResult};
use txcoord_durability::{FileLog, PartnerLog, TransactionLog};

/// File name of the transaction log inside a log directory.
pub const TRAN_LOG_FILE: &str = "tranlog.txl";
/// File name of the partner log inside a log directory.
pub const PARTNER_LOG_FILE: &str = "partnerlog.txl";

/// Fluent configuration for a [`TransactionService`].
///
/// ```ignore
/// let service = TransactionService::builder(TxConfig::new("server1"))
///     .log_dir("/var/lib/txcoord")?
///     .factory(factory)
///     .build()?;
/// service.initiate_recovery("server1")?;
/// let tx = service.begin()?;
/// ```
pub struct ServiceBuilder {
    config: TxConfig,
    factory: Option<Arc<dyn ResourceFactory>>,
    providers: Option<Arc<dyn ProviderDirectory>>,
    local_logs: Option<DomainLogs>,
    peer_logs: Vec<(String, DomainLogs)>,
}

impl ServiceBuilder {
    /// Builder with no logs, factory or provider directory.
    pub fn new(config: TxConfig) -> Self {
        ServiceBuilder {
            config,
            factory: None,
            providers: None,
            local_logs: None,
            peer_logs: Vec::new(),
        }
    }

    /// Use these stores as the local transaction and partner logs.
    pub fn local_logs(mut self, tran: Arc<dyn RecoveryLog>, partner: Arc<dyn RecoveryLog>) -> Self {
        self.local_logs = Some(DomainLogs {
            tran_log: Arc::new(TransactionLog::new(tran)),
            partner_log: Arc::new(PartnerLog::new(partner)),
        });
        self
    }

    /// Open (or create) file-backed local logs in `dir`.
    ///
    /// # Errors
    /// `Log` when either file cannot be opened; `Corrupted` when either
    /// file fails validation.
    pub fn log_dir(self, dir: impl AsRef<Path>) -> TxResult<Self> {
        let dir = dir.as_ref();
        let (tran, partner) = open_file_logs(dir)?;
        Ok(self.local_logs(tran, partner))
    }

    /// Make the logs of another failure domain available for
    /// [`TransactionService::initiate_recovery`].
    pub fn peer_domain(
        mut self,
        domain: impl Into<String>,
        tran: Arc<dyn RecoveryLog>,
        partner: Arc<dyn RecoveryLog>,
    ) -> Self {
        self.peer_logs.push((
            domain.into(),
            DomainLogs {
                tran_log: Arc::new(TransactionLog::new(tran)),
                partner_log: Arc::new(PartnerLog::new(partner)),
            },
        ));
        self
    }

    /// Factory used to reconnect to logged resource managers.
    pub fn factory(mut self, factory: Arc<dyn ResourceFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Directory used during recovery to check whether the owner of an
    /// in-doubt subordinate is still installed. An owner that is gone gets
    /// the configured heuristic direction instead of waiting forever.
    pub fn providers(mut self, providers: Arc<dyn ProviderDirectory>) -> Self {
        self.providers = Some(providers);
        self
    }

    /// Validate the configuration and start the background scheduler.
    ///
    /// # Errors
    /// `Config` for an invalid configuration; `System` when the scheduler
    /// threads cannot be spawned.
    pub fn build(self) -> TxResult<TransactionService> {
        TransactionService::from_parts(
            self.config,
            self.factory,
            self.providers,
            self.local_logs,
            self.peer_logs,
        )
    }
}

fn open_file_logs(dir: &Path) -> TxResult<(Arc<dyn RecoveryLog>, Arc<dyn RecoveryLog>)> {
    let open = |file: &str, name: &str| -> TxResult<Arc<dyn RecoveryLog>> {
        let log = FileLog::open(dir.join(file), name)
            .map_err(|e| replay_error(name, e))?;
        Ok(Arc::new(log))
    };
    Ok((open(TRAN_LOG_FILE, "tranlog")?, open(PARTNER_LOG_FILE, "partnerlog")?))
}

impl std::fmt::Debug for ServiceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceBuilder")
            .field("config", &self.config)
            .field("local_logs", &self.local_logs.is_some())
            .field(
                "peer_domains",
                &self.peer_logs.iter().map(|(d, _)| d.as_str()).collect::<Vec<_>>(),
            )
            .field("factory", &self.factory.is_some())
            .field("providers", &self.providers.is_some())
            .finish()
    }
}
