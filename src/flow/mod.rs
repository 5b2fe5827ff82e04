//! Lifecycle flows as pure state machines.
//!
//! Each operation is a `Flow`: transition rules mapping `(state, Event) ->
//! (state, Vec<Effect>)`. The orchestrator performs the effects against the
//! hypervisor, volumes and guest, and feeds the resulting events back in.
//! Nothing here does I/O, so illegal orderings (committing before the new
//! domain is verified, say) have no transition that produces them.

pub mod build;
pub mod delete;

use crate::vm_config::ScriptCategory;

/// Completion signals fed back into a flow.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    FlowStarted,

    // build
    DiskReady,
    CloudInitReady,
    DomainDefined,
    DomainStarted,
    GuestReady,
    ScriptSucceeded { category: ScriptCategory, index: usize },
    Restored,
    Committed,
    RolledBack,

    // delete
    DomainStopped,
    DomainUndefined,
    VolumesDeleted,
    RecordRemoved,

    /// The effect in progress failed; the driver keeps the error.
    Failed,
    /// Cancellation observed between steps.
    AbortRequested,
}

/// Work the driver performs next.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    ProvisionDisk,
    WriteCloudInit,
    DefineDomain,
    StartDomain,
    WaitForGuest,
    RunScript { category: ScriptCategory, index: usize },
    /// Attach the restore volume, run the restore scripts, detach.
    Restore,
    /// Persist the new revision and retire the previous one.
    Commit,
    /// Discard every resource created by this attempt.
    Rollback,

    StopDomain,
    UndefineDomain,
    DeleteVolumes,
    RemoveRecord,
}

impl Effect {
    /// Step name used in errors and events.
    pub fn step(&self) -> String {
        match self {
            Effect::ProvisionDisk => "disk provisioning".into(),
            Effect::WriteCloudInit => "cloud-init volume".into(),
            Effect::DefineDomain => "domain definition".into(),
            Effect::StartDomain => "domain start".into(),
            Effect::WaitForGuest => "guest boot".into(),
            Effect::RunScript { category, index } => format!("{category} script #{index}"),
            Effect::Restore => "restore".into(),
            Effect::Commit => "commit".into(),
            Effect::Rollback => "rollback".into(),
            Effect::StopDomain => "domain stop".into(),
            Effect::UndefineDomain => "domain undefine".into(),
            Effect::DeleteVolumes => "volume deletion".into(),
            Effect::RemoveRecord => "record removal".into(),
        }
    }
}

pub trait Flow: Send {
    type State: Copy + PartialEq + std::fmt::Debug;

    fn entry_state(&self) -> Self::State;

    /// The driver stops once a terminal state has no pending effects.
    fn is_terminal(&self, state: Self::State) -> bool;

    /// Pure transition. Unknown events leave the state unchanged with no
    /// effects.
    fn transition(&self, state: &Self::State, event: &Event) -> (Self::State, Vec<Effect>);
}
