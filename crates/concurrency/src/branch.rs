//! Resource branches
//!
//! A [`ResourceBranch`] is one enlisted participant plus its protocol status.
//! The participant kinds form a closed set, matched exhaustively wherever
//! behavior differs:
//!
//! - `OnePhase`: a resource that can only commit in one phase; it has no
//!   branch of its own and never prepares
//! - `TwoPhase`: an XA-style resource manager bound to a branch xid and to
//!   the partner entry used to find it again after a crash
//! - `Joined`: a second connection to the same resource manager as the first
//!   two-phase branch, sharing that branch's xid; only start/end flow to it

use crate::partners::PartnerEntry;
use std::fmt;
use std::sync::Arc;
use txcoord_core::{
    BranchCoupling, BranchStatus, EndFlag, OnePhaseResource, ResourceManager, StartFlag, Vote,
    XaError, XaResult, Xid,
};
use txcoord_durability::BranchEntry;

/// Caller-visible handle for an enlisted participant, used to delist it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BranchHandle(pub(crate) u32);

/// Kind of participant behind a branch.
pub enum Participant {
    /// One-phase-only resource.
    OnePhase(Arc<dyn OnePhaseResource>),
    /// Two-phase resource manager with its own branch.
    TwoPhase {
        /// Resource manager connection.
        rm: Arc<dyn ResourceManager>,
        /// Partner used for recovery.
        partner: Arc<PartnerEntry>,
    },
    /// Connection joined to the first two-phase branch.
    Joined {
        /// Resource manager connection.
        rm: Arc<dyn ResourceManager>,
    },
}

/// Association between the participant and the branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Association {
    /// Work is being done on the branch.
    Active,
    /// Work is suspended and may resume.
    Suspended,
    /// Work on the branch is over.
    Ended,
}

/// One enlisted participant and its protocol status.
pub struct ResourceBranch {
    participant: Participant,
    xid: Xid,
    status: BranchStatus,
    priority: i32,
    coupling: BranchCoupling,
    association: Association,
    handle: BranchHandle,
}

impl ResourceBranch {
    pub(crate) fn one_phase(
        resource: Arc<dyn OnePhaseResource>,
        xid: Xid,
        handle: BranchHandle,
    ) -> Self {
        ResourceBranch {
            participant: Participant::OnePhase(resource),
            xid,
            status: BranchStatus::Registered,
            priority: txcoord_core::DEFAULT_PRIORITY,
            coupling: BranchCoupling::Loose,
            association: Association::Ended,
            handle,
        }
    }

    pub(crate) fn two_phase(
        rm: Arc<dyn ResourceManager>,
        partner: Arc<PartnerEntry>,
        xid: Xid,
        priority: i32,
        coupling: BranchCoupling,
        handle: BranchHandle,
    ) -> Self {
        partner.acquire();
        ResourceBranch {
            participant: Participant::TwoPhase { rm, partner },
            xid,
            status: BranchStatus::Registered,
            priority,
            coupling,
            association: Association::Active,
            handle,
        }
    }

    pub(crate) fn joined(
        rm: Arc<dyn ResourceManager>,
        xid: Xid,
        coupling: BranchCoupling,
        handle: BranchHandle,
    ) -> Self {
        ResourceBranch {
            participant: Participant::Joined { rm },
            xid,
            status: BranchStatus::Registered,
            priority: txcoord_core::DEFAULT_PRIORITY,
            coupling,
            association: Association::Active,
            handle,
        }
    }

    /// Rebuild a prepared branch from a log entry.
    pub(crate) fn recovered(
        rm: Arc<dyn ResourceManager>,
        partner: Arc<PartnerEntry>,
        entry: &BranchEntry,
        handle: BranchHandle,
    ) -> Self {
        let mut branch = Self::two_phase(
            rm,
            partner,
            entry.xid.clone(),
            entry.priority,
            BranchCoupling::Loose,
            handle,
        );
        branch.status = BranchStatus::Prepared;
        branch.association = Association::Ended;
        branch
    }

    /// Branch xid.
    pub fn xid(&self) -> &Xid {
        &self.xid
    }

    /// Protocol status.
    pub fn status(&self) -> BranchStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: BranchStatus) {
        self.status = status;
    }

    /// Commit priority.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Coupling requested at enlistment.
    pub fn coupling(&self) -> BranchCoupling {
        self.coupling
    }

    /// Current association.
    pub fn association(&self) -> Association {
        self.association
    }

    /// Handle returned by enlistment.
    pub fn handle(&self) -> BranchHandle {
        self.handle
    }

    /// The participant.
    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    /// Name of the participant.
    pub fn name(&self) -> &str {
        match &self.participant {
            Participant::OnePhase(r) => r.name(),
            Participant::TwoPhase { rm, .. } | Participant::Joined { rm } => rm.name(),
        }
    }

    /// True for a one-phase-only participant.
    pub fn is_one_phase(&self) -> bool {
        matches!(self.participant, Participant::OnePhase(_))
    }

    /// Partner recovery id, for two-phase branches.
    pub fn recovery_id(&self) -> Option<u64> {
        match &self.participant {
            Participant::TwoPhase { partner, .. } => Some(partner.recovery_id()),
            Participant::OnePhase(_) | Participant::Joined { .. } => None,
        }
    }

    /// Resource manager connection, for two-phase and joined branches.
    pub fn resource_manager(&self) -> Option<&Arc<dyn ResourceManager>> {
        match &self.participant {
            Participant::TwoPhase { rm, .. } | Participant::Joined { rm } => Some(rm),
            Participant::OnePhase(_) => None,
        }
    }

    /// True when `rm` is the very connection this branch was enlisted with.
    pub(crate) fn holds(&self, rm: &Arc<dyn ResourceManager>) -> bool {
        self.resource_manager()
            .map(|own| same_object(own, rm))
            .unwrap_or(false)
    }

    /// True when `resource` is this branch's one-phase resource.
    pub(crate) fn holds_one_phase(&self, resource: &Arc<dyn OnePhaseResource>) -> bool {
        match &self.participant {
            Participant::OnePhase(own) => {
                Arc::as_ptr(own) as *const () == Arc::as_ptr(resource) as *const ()
            }
            _ => false,
        }
    }

    /// Log entry for a prepared two-phase branch.
    pub(crate) fn log_entry(&self) -> Option<BranchEntry> {
        self.recovery_id().map(|recovery_id| BranchEntry {
            recovery_id,
            xid: self.xid.clone(),
            priority: self.priority,
        })
    }

    // === Protocol flows ===

    pub(crate) fn start(&mut self, flag: StartFlag) -> XaResult<()> {
        match &self.participant {
            Participant::OnePhase(_) => Ok(()),
            Participant::TwoPhase { rm, .. } | Participant::Joined { rm } => {
                rm.start(&self.xid, flag)?;
                self.association = Association::Active;
                Ok(())
            }
        }
    }

    /// End the association. A branch already ended is not contacted again.
    pub(crate) fn end(&mut self, flag: EndFlag) -> XaResult<()> {
        if self.association == Association::Ended {
            return Ok(());
        }
        if flag == EndFlag::Suspend && self.association == Association::Suspended {
            return Ok(());
        }
        match &self.participant {
            Participant::OnePhase(_) => Ok(()),
            Participant::TwoPhase { rm, .. } | Participant::Joined { rm } => {
                let result = rm.end(&self.xid, flag);
                self.association = match flag {
                    EndFlag::Suspend if result.is_ok() => Association::Suspended,
                    EndFlag::Suspend => self.association,
                    EndFlag::Success | EndFlag::Fail => Association::Ended,
                };
                result
            }
        }
    }

    pub(crate) fn prepare(&self) -> XaResult<Vote> {
        match &self.participant {
            Participant::TwoPhase { rm, .. } => rm.prepare(&self.xid),
            // Joined work is prepared through its master branch
            Participant::Joined { .. } => Ok(Vote::ReadOnly),
            Participant::OnePhase(_) => Err(XaError::Proto),
        }
    }

    pub(crate) fn commit(&self, one_phase: bool) -> XaResult<()> {
        match &self.participant {
            Participant::OnePhase(r) => r.commit_one_phase(),
            Participant::TwoPhase { rm, .. } => rm.commit(&self.xid, one_phase),
            Participant::Joined { .. } => Ok(()),
        }
    }

    pub(crate) fn rollback(&self) -> XaResult<()> {
        match &self.participant {
            Participant::OnePhase(r) => r.rollback(),
            Participant::TwoPhase { rm, .. } => rm.rollback(&self.xid),
            Participant::Joined { .. } => Ok(()),
        }
    }

    pub(crate) fn forget(&self) -> XaResult<()> {
        match &self.participant {
            Participant::TwoPhase { rm, .. } => rm.forget(&self.xid),
            Participant::OnePhase(_) | Participant::Joined { .. } => Ok(()),
        }
    }
}

impl Drop for ResourceBranch {
    fn drop(&mut self) {
        if let Participant::TwoPhase { partner, .. } = &self.participant {
            partner.release();
        }
    }
}

impl fmt::Debug for ResourceBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.participant {
            Participant::OnePhase(_) => "one-phase",
            Participant::TwoPhase { .. } => "two-phase",
            Participant::Joined { .. } => "joined",
        };
        f.debug_struct("ResourceBranch")
            .field("kind", &kind)
            .field("name", &self.name())
            .field("xid", &self.xid)
            .field("status", &self.status)
            .field("priority", &self.priority)
            .finish()
    }
}

fn same_object(a: &Arc<dyn ResourceManager>, b: &Arc<dyn ResourceManager>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
