//! Record layout of the transaction and partner logs.
//!
//! Both logs are made of records whose sections are keyed by the kinds
//! below. Section payloads are rmp-encoded.
//!
//! ```text
//! Service-data record (one per log)
//!   SERVER_DATA    server name
//!   APPLID_DATA    application instance id
//!   EPOCH_DATA     epoch
//!   SERVER_STATE   Starting | Recovered | Stopped      (partner log only)
//!   LOW_WATERMARK  lowest live recovery id            (partner log only)
//!   NEXT_ID        first recovery id not yet reserved (partner log only)
//!
//! Transaction record (transaction log)
//!   GLOBAL_ID          TransactionHeader
//!   TRANSACTION_STATE  TransactionState
//!   RESOURCE_BRANCH    BranchEntry, one item per prepared branch
//!   HEURISTIC_OUTCOME  HeuristicOutcome
//!
//! Partner record (partner log)
//!   PARTNER_DESCRIPTOR PartnerRecord
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use txcoord_core::{LogError, PartnerDescriptor, Xid};
use uuid::Uuid;

/// Section kinds.
pub mod kinds {
    /// Server name.
    pub const SERVER_DATA: u16 = 1;
    /// Application instance id.
    pub const APPLID_DATA: u16 = 2;
    /// Epoch.
    pub const EPOCH_DATA: u16 = 3;
    /// Server state.
    pub const SERVER_STATE: u16 = 4;
    /// Low watermark of live recovery ids.
    pub const LOW_WATERMARK: u16 = 5;
    /// Next unreserved recovery id.
    pub const NEXT_ID: u16 = 6;
    /// Transaction state.
    pub const TRANSACTION_STATE: u16 = 16;
    /// Transaction header.
    pub const GLOBAL_ID: u16 = 17;
    /// Prepared branch.
    pub const RESOURCE_BRANCH: u16 = 18;
    /// Combined heuristic outcome.
    pub const HEURISTIC_OUTCOME: u16 = 19;
    /// Partner descriptor.
    pub const PARTNER_DESCRIPTOR: u16 = 32;

    /// Kinds that belong to a service-data record.
    pub const SERVICE_KINDS: [u16; 6] = [
        SERVER_DATA,
        APPLID_DATA,
        EPOCH_DATA,
        SERVER_STATE,
        LOW_WATERMARK,
        NEXT_ID,
    ];
}

/// Identity shared by the transaction and partner logs of one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceData {
    /// Server name.
    pub server_name: String,
    /// Application instance id.
    pub appl_id: Uuid,
    /// Epoch of the run that wrote the data.
    pub epoch: u32,
}

/// Lifecycle marker written to the partner log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerState {
    /// Replay done, reconciliation may still be running.
    Starting,
    /// Reconciliation finished with nothing in doubt.
    Recovered,
    /// Clean shutdown with no transactions in flight.
    Stopped,
}

/// Identity of a logged transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionHeader {
    /// Global id.
    pub xid: Xid,
    /// True when imported from a superior.
    pub subordinate: bool,
    /// The superior's xid, for subordinates.
    pub superior: Option<Xid>,
    /// External provider owning a subordinate.
    pub owner: Option<String>,
}

/// A prepared branch as logged in a transaction record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchEntry {
    /// Recovery id of the partner the branch belongs to.
    pub recovery_id: u64,
    /// Branch xid.
    pub xid: Xid,
    /// Commit priority.
    pub priority: i32,
}

/// A resource manager as logged in a partner record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartnerRecord {
    /// Stable recovery id.
    pub recovery_id: u64,
    /// Reconnection descriptor.
    pub descriptor: PartnerDescriptor,
}

/// Encode a section payload.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, LogError> {
    rmp_serde::to_vec(value).map_err(|e| LogError::codec(e.to_string()))
}

/// Decode a section payload.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, LogError> {
    rmp_serde::from_slice(bytes).map_err(|e| LogError::codec(e.to_string()))
}
