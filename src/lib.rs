//! txcoord - two-phase commit coordination with heuristic resolution and
//! crash recovery
//!
//! txcoord drives distributed transactions across resource managers that
//! speak an XA-style protocol: it collects votes, logs the decision, delivers
//! the outcome, folds divergent participant outcomes into a heuristic
//! result, and after a crash rebuilds every in-flight transaction from its
//! logs and finishes it.
//!
//! # Quick Start
//!
//! ```ignore
//! use txcoord::{TransactionService, TxConfig, EnlistOptions, PartnerDescriptor};
//!
//! let service = TransactionService::builder(TxConfig::new("server1"))
//!     .log_dir("/var/lib/txcoord")?
//!     .factory(factory)
//!     .build()?;
//! service.initiate_recovery("server1")?;
//!
//! let tx = service.begin()?;
//! tx.enlist(orders_db, &EnlistOptions::new(PartnerDescriptor::new("orders", orders_url)))?;
//! tx.enlist(billing_db, &EnlistOptions::new(PartnerDescriptor::new("billing", billing_url)))?;
//! service.commit(tx.xid())?;
//! ```
//!
//! # Architecture
//!
//! - `txcoord-core`: identifiers, statuses, the heuristic lattice, errors,
//!   settings and the traits a resource manager implements
//! - `txcoord-durability`: the transaction and partner logs and their stores
//! - `txcoord-concurrency`: the per-transaction state machine and the
//!   registry that runs the protocol against its branches
//! - `txcoord-engine`: the service, recovery of failure domains, the
//!   background scheduler and configuration

pub use txcoord_concurrency::{
    BranchHandle, PartnerTable, RetryPolicy, RetryScheduler, RetryStatus, RetryTask,
    TransactionCoordinator, TxEnvironment, TxStatus,
};
pub use txcoord_core::{
    BranchCoupling, BranchStatus, EndFlag, EnlistOptions, HeuristicDirection, HeuristicOutcome,
    LogError, OnePhaseResource, PartnerDescriptor, ProviderDirectory, RecoveryLog,
    ResourceFactory, ResourceManager, RollbackReason, StartFlag, Synchronization,
    TransactionSettings, TransactionState, TxError, TxResult, Vote, XaError, XaResult, Xid,
};
pub use txcoord_durability::{FileLog, MemoryLog, ServerState, ServiceData};
pub use txcoord_engine::{
    RecoveryCoordinator, RecoveryPhase, RecoveryStats, SchedulerConfig, ServiceBuilder,
    TransactionMetrics, TransactionService, TxConfig, CONFIG_FILE_NAME,
};

/// Scripted resource managers and callbacks for tests.
pub mod testing {
    pub use txcoord_concurrency::testing::*;
}
