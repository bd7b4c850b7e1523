//! Transaction service for txcoord
//!
//! This crate runs the coordinator as a service:
//! - BackgroundScheduler: worker threads for timeouts and delivery retries
//! - TxConfig: `txcoord.toml` with transaction and scheduler settings
//! - RecoveryCoordinator: replay and reconciliation of one failure domain
//! - TransactionService: begin/import, the live transaction table, recovery
//!   lifecycle and shutdown
//!
//! The service is the only component that knows about:
//! - Epochs and application identity across runs
//! - Which failure domains are being recovered
//! - Clean-shutdown markers in the partner log

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod background;
pub mod config;
pub mod recovery;
pub mod service;

pub use background::{BackgroundScheduler, SchedulerError, SchedulerStats, TaskId, TaskPriority};
pub use config::{SchedulerConfig, TxConfig, CONFIG_FILE_NAME};
pub use recovery::{replay_domain, RecoveryCoordinator, RecoveryPhase, RecoveryStats, ReplayedDomain};
pub use service::{
    ServiceBuilder, TransactionMetrics, TransactionService, PARTNER_LOG_FILE, SHUTDOWN_GRACE,
    TRAN_LOG_FILE,
};
