//! Record-level lifecycle state.
//!
//! `absent → building → active → redefining → active`, `active → deleting →
//! absent`, and any build state may pass through `failed-rollback` on its
//! way back to `active` or `absent`.

use facet::Facet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Facet)]
#[repr(u8)]
pub enum VmState {
    /// Never existed or fully deleted.
    Absent,
    /// First build in progress.
    Building,
    /// Running at its committed revision, no operation in flight.
    Active,
    /// A replacement revision is being built beside the live one.
    Redefining,
    Deleting,
    /// A build failed and its resources are being discarded.
    FailedRollback,
}

impl VmState {
    pub fn can_transition(self, to: VmState) -> bool {
        use VmState::*;
        matches!(
            (self, to),
            (Absent, Building)
                | (Building, Active)
                | (Building, FailedRollback)
                | (Active, Redefining)
                | (Active, Deleting)
                | (Redefining, Active)
                | (Redefining, FailedRollback)
                | (FailedRollback, Active)
                | (FailedRollback, Absent)
                | (Deleting, Absent)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VmState::Absent => "absent",
            VmState::Building => "building",
            VmState::Active => "active",
            VmState::Redefining => "redefining",
            VmState::Deleting => "deleting",
            VmState::FailedRollback => "failed-rollback",
        }
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
