//! Enlistment value types
//!
//! - PartnerDescriptor: how to reconnect to a resource manager after a restart
//! - BranchCoupling: whether joined work shares locks with its branch
//! - EnlistOptions: per-enlistment descriptor, priority and coupling

use serde::{Deserialize, Serialize};
use std::fmt;

/// Commit priority used when none is given.
pub const DEFAULT_PRIORITY: i32 = 0;

/// Serialized description of a resource manager, sufficient for a
/// [`ResourceFactory`](crate::traits::ResourceFactory) to reconnect to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartnerDescriptor {
    /// Resource manager name.
    pub name: String,
    /// Opaque connection data.
    pub data: Vec<u8>,
}

impl PartnerDescriptor {
    /// Create a descriptor.
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        PartnerDescriptor {
            name: name.into(),
            data: data.into(),
        }
    }
}

impl fmt::Display for PartnerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.name, self.data.len())
    }
}

/// Branch coupling for same-resource-manager joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BranchCoupling {
    /// Separate branches; no sharing.
    #[default]
    Loose,
    /// Work may share the first branch of the same resource manager.
    Tight,
}

/// Options for a two-phase enlistment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnlistOptions {
    /// Recovery descriptor for the resource manager.
    pub descriptor: PartnerDescriptor,
    /// Commit priority; higher commits first and prepares last.
    pub priority: i32,
    /// Coupling used for same-resource-manager joins.
    pub coupling: BranchCoupling,
}

impl EnlistOptions {
    /// Options with default priority and coupling.
    pub fn new(descriptor: PartnerDescriptor) -> Self {
        EnlistOptions {
            descriptor,
            priority: DEFAULT_PRIORITY,
            coupling: BranchCoupling::Loose,
        }
    }

    /// Set the commit priority (builder pattern).
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the branch coupling (builder pattern).
    pub fn with_coupling(mut self, coupling: BranchCoupling) -> Self {
        self.coupling = coupling;
        self
    }
}
