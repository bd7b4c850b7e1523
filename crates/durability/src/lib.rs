//! Durability layer for txcoord
//!
//! This crate owns everything that is persisted for recovery:
//!
//! - Log stores: in-memory (`MemoryLog`) and file-backed (`FileLog`)
//! - Record layout: section kinds and payload types (`format`)
//! - Transaction log: per-transaction state and prepared branches
//! - Partner log: resource-manager descriptors and recovery id reservation
//! - Service data: server identity, epoch and lifecycle marker in both logs

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod format;
pub mod log;
pub mod partner_log;
mod service;
pub mod tranlog;

pub use format::{BranchEntry, PartnerRecord, ServerState, ServiceData, TransactionHeader};
pub use log::{FileLog, MemoryLog};
pub use partner_log::{PartnerLog, PartnerLogReplay};
pub use tranlog::{LoggedTransaction, TranLogReplay, TransactionLog};
