//! Coordination layer for txcoord
//!
//! This crate drives two-phase commit for one transaction at a time:
//! - `TransactionCoordinator`: the per-transaction state machine
//! - `ResourceRegistry`: enlisted participants, vote ordering and outcome
//!   delivery with heuristic tracking
//! - `PartnerTable`: resource-manager identities shared across transactions
//! - `RetryPolicy`: backoff for outcome delivery that could not finish
//!
//! Nothing here owns threads. Retries and timeouts are handed to whatever
//! the embedding service installs in the `TxEnvironment`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod branch;
pub mod coordinator;
pub mod environment;
pub mod partners;
pub mod registry;
pub mod retry;
pub mod state;
pub mod testing;

pub use branch::{Association, BranchHandle, Participant, ResourceBranch};
pub use coordinator::TransactionCoordinator;
pub use environment::{CompletionListener, TxEnvironment};
pub use partners::{PartnerEntry, PartnerTable, RecoveredResource};
pub use registry::{PrepareOutcome, ResourceRegistry};
pub use retry::{RetryPolicy, RetryScheduler, RetryStatus, RetryTask};
pub use state::{RollbackOnlyFlag, TxStateCell, TxStatus};
