//! Global transaction and branch identifiers
//!
//! An [`Xid`] follows the XA shape: a format id, a global transaction id
//! (gtrid) and a branch qualifier (bqual). Identifiers minted by this
//! coordinator use [`FORMAT_ID`] and a fixed layout so recovery can tell its
//! own branches apart from foreign ones and from branches of a later epoch.
//!
//! # Layout
//!
//! ```text
//! gtrid (28 bytes):
//! ┌──────────────────────┬──────────────┬─────────────────┐
//! │ Application id (16)  │ Epoch (4 BE) │ Sequence (8 BE) │
//! └──────────────────────┴──────────────┴─────────────────┘
//!
//! bqual (12 bytes):
//! ┌──────────────────────┬────────────────┐
//! │ Recovery id (8 BE)   │ Branch (4 BE)  │
//! └──────────────────────┴────────────────┘
//! ```
//!
//! A global id has an empty branch qualifier.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Format id stamped on every xid minted by this coordinator ("TXCD").
pub const FORMAT_ID: i32 = 0x5458_4344;

/// Maximum gtrid length allowed by XA.
pub const MAX_GTRID_LEN: usize = 64;

/// Maximum bqual length allowed by XA.
pub const MAX_BQUAL_LEN: usize = 64;

const GTRID_LEN: usize = 16 + 4 + 8;
const BQUAL_LEN: usize = 8 + 4;

/// Errors raised when building an xid from raw parts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum XidError {
    /// Global transaction id exceeds 64 bytes.
    #[error("gtrid length {0} exceeds {MAX_GTRID_LEN}")]
    GtridTooLong(usize),

    /// Branch qualifier exceeds 64 bytes.
    #[error("bqual length {0} exceeds {MAX_BQUAL_LEN}")]
    BqualTooLong(usize),
}

/// XA transaction identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Xid {
    format_id: i32,
    gtrid: Vec<u8>,
    bqual: Vec<u8>,
}

impl Xid {
    /// Build an xid from raw parts, e.g. one reported by a resource manager
    /// or imported from a foreign superior.
    pub fn new(format_id: i32, gtrid: Vec<u8>, bqual: Vec<u8>) -> Result<Self, XidError> {
        if gtrid.len() > MAX_GTRID_LEN {
            return Err(XidError::GtridTooLong(gtrid.len()));
        }
        if bqual.len() > MAX_BQUAL_LEN {
            return Err(XidError::BqualTooLong(bqual.len()));
        }
        Ok(Xid {
            format_id,
            gtrid,
            bqual,
        })
    }

    /// Mint a global id in this coordinator's format.
    pub fn global(appl_id: Uuid, epoch: u32, sequence: u64) -> Self {
        let mut gtrid = Vec::with_capacity(GTRID_LEN);
        gtrid.extend_from_slice(appl_id.as_bytes());
        gtrid.extend_from_slice(&epoch.to_be_bytes());
        gtrid.extend_from_slice(&sequence.to_be_bytes());
        Xid {
            format_id: FORMAT_ID,
            gtrid,
            bqual: Vec::new(),
        }
    }

    /// Derive a branch xid sharing this xid's global part.
    pub fn branch(&self, recovery_id: u64, branch: u32) -> Self {
        let mut bqual = Vec::with_capacity(BQUAL_LEN);
        bqual.extend_from_slice(&recovery_id.to_be_bytes());
        bqual.extend_from_slice(&branch.to_be_bytes());
        Xid {
            format_id: self.format_id,
            gtrid: self.gtrid.clone(),
            bqual,
        }
    }

    /// The global part of this xid (branch qualifier stripped).
    pub fn global_id(&self) -> Xid {
        Xid {
            format_id: self.format_id,
            gtrid: self.gtrid.clone(),
            bqual: Vec::new(),
        }
    }

    /// Format id.
    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    /// Global transaction id bytes.
    pub fn gtrid(&self) -> &[u8] {
        &self.gtrid
    }

    /// Branch qualifier bytes.
    pub fn bqual(&self) -> &[u8] {
        &self.bqual
    }

    /// True when both xids name the same global transaction.
    pub fn same_global(&self, other: &Xid) -> bool {
        self.format_id == other.format_id && self.gtrid == other.gtrid
    }

    /// True when the xid carries this coordinator's format and gtrid layout.
    pub fn is_own_format(&self) -> bool {
        self.format_id == FORMAT_ID && self.gtrid.len() == GTRID_LEN
    }

    /// Application id embedded in an own-format xid.
    pub fn appl_id(&self) -> Option<Uuid> {
        if !self.is_own_format() {
            return None;
        }
        Uuid::from_slice(&self.gtrid[0..16]).ok()
    }

    /// Epoch embedded in an own-format xid.
    pub fn epoch(&self) -> Option<u32> {
        if !self.is_own_format() {
            return None;
        }
        Some(u32::from_be_bytes(self.gtrid[16..20].try_into().ok()?))
    }

    /// Sequence number embedded in an own-format xid.
    pub fn sequence(&self) -> Option<u64> {
        if !self.is_own_format() {
            return None;
        }
        Some(u64::from_be_bytes(self.gtrid[20..28].try_into().ok()?))
    }

    /// Partner recovery id embedded in an own-format branch xid.
    pub fn recovery_id(&self) -> Option<u64> {
        if !self.is_own_format() || self.bqual.len() != BQUAL_LEN {
            return None;
        }
        Some(u64::from_be_bytes(self.bqual[0..8].try_into().ok()?))
    }

    /// Branch counter embedded in an own-format branch xid.
    pub fn branch_number(&self) -> Option<u32> {
        if !self.is_own_format() || self.bqual.len() != BQUAL_LEN {
            return None;
        }
        Some(u32::from_be_bytes(self.bqual[8..12].try_into().ok()?))
    }
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{:02x}", b)?;
    }
    Ok(())
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:", self.format_id)?;
        write_hex(f, &self.gtrid)?;
        f.write_str(":")?;
        write_hex(f, &self.bqual)
    }
}

impl fmt::Debug for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Xid({})", self)
    }
}
