//! Delete flow: stop, undefine, drop volumes, forget the record.
//!
//! Failing before the domain is undefined leaves the VM as it was. Past
//! that point the guest is gone and the flow only reports the interruption.

use super::{Effect, Event, Flow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteState {
    Active,
    Stopping,
    Stopped,
    Undefined,
    VolumesDeleted,
    Absent,
    /// Failed before anything irreversible happened.
    Kept,
    /// Failed after the domain was undefined.
    Interrupted,
}

pub struct DeleteFlow;

impl Flow for DeleteFlow {
    type State = DeleteState;

    fn entry_state(&self) -> DeleteState {
        DeleteState::Active
    }

    fn is_terminal(&self, state: DeleteState) -> bool {
        matches!(
            state,
            DeleteState::Absent | DeleteState::Kept | DeleteState::Interrupted
        )
    }

    fn transition(&self, state: &DeleteState, event: &Event) -> (DeleteState, Vec<Effect>) {
        use DeleteState as S;

        match (*state, event) {
            (S::Active, Event::FlowStarted) => (S::Stopping, vec![Effect::StopDomain]),
            (S::Stopping, Event::DomainStopped) => (S::Stopped, vec![Effect::UndefineDomain]),
            (S::Stopped, Event::DomainUndefined) => (S::Undefined, vec![Effect::DeleteVolumes]),
            (S::Undefined, Event::VolumesDeleted) => {
                (S::VolumesDeleted, vec![Effect::RemoveRecord])
            }
            (S::VolumesDeleted, Event::RecordRemoved) => (S::Absent, vec![]),

            (S::Active | S::Stopping | S::Stopped, Event::Failed) => (S::Kept, vec![]),
            (S::Undefined | S::VolumesDeleted, Event::Failed) => (S::Interrupted, vec![]),

            (s, _) => (s, vec![]),
        }
    }
}
