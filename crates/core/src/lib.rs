//! Core types and traits for txcoord
//!
//! This crate defines the vocabulary shared by every layer:
//! - Xid: global transaction and branch identifiers
//! - HeuristicOutcome: the heuristic lattice
//! - BranchStatus / TransactionState: protocol statuses
//! - XaError, Vote, StartFlag, EndFlag: resource-manager protocol codes
//! - TxError / LogError: error taxonomy
//! - TransactionSettings: immutable coordinator settings
//! - Traits: ResourceManager, OnePhaseResource, ResourceFactory,
//!   Synchronization, ProviderDirectory, RecoveryLog

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod heuristic;
pub mod settings;
pub mod status;
pub mod traits;
pub mod types;
pub mod xa;
pub mod xid;

pub use error::{LogError, TxError, TxResult};
pub use heuristic::HeuristicOutcome;
pub use settings::{HeuristicDirection, SettingsError, TransactionSettings};
pub use status::{BranchStatus, TransactionState};
pub use traits::{
    LogRecord, LogSection, OnePhaseResource, ProviderDirectory, RecordId, RecoveryLog,
    ResourceFactory, ResourceManager, Synchronization,
};
pub use types::{BranchCoupling, EnlistOptions, PartnerDescriptor, DEFAULT_PRIORITY};
pub use xa::{EndFlag, RollbackReason, StartFlag, Vote, XaError, XaResult};
pub use xid::{Xid, XidError, FORMAT_ID};
