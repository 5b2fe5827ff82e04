//! Build flow shared by create and redefine: provision, boot, prepare,
//! optionally restore, then commit. Any failure or abort before the commit
//! lands routes to a single rollback.

use super::{Effect, Event, Flow};
use crate::vm_config::ScriptCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Pending,
    DiskProvisioned,
    CloudInitWritten,
    DomainDefined,
    DomainStarted,
    /// `done` prepare scripts have succeeded; script `done` is running.
    Preparing { done: usize },
    Restoring,
    /// Every check passed; only the commit remains.
    Verified,
    Committed,
    RollingBack,
    RolledBack,
}

impl BuildState {
    fn is_settled(self) -> bool {
        matches!(
            self,
            BuildState::Committed | BuildState::RollingBack | BuildState::RolledBack
        )
    }
}

pub struct BuildFlow {
    prepare_scripts: usize,
    restore: bool,
}

impl BuildFlow {
    pub fn new(prepare_scripts: usize, restore: bool) -> Self {
        Self {
            prepare_scripts,
            restore,
        }
    }

    /// Where to go once `done` prepare scripts have succeeded.
    fn after_prepare(&self, done: usize) -> (BuildState, Vec<Effect>) {
        if done < self.prepare_scripts {
            (
                BuildState::Preparing { done },
                vec![Effect::RunScript {
                    category: ScriptCategory::Prepare,
                    index: done,
                }],
            )
        } else if self.restore {
            (BuildState::Restoring, vec![Effect::Restore])
        } else {
            (BuildState::Verified, vec![Effect::Commit])
        }
    }
}

impl Flow for BuildFlow {
    type State = BuildState;

    fn entry_state(&self) -> BuildState {
        BuildState::Pending
    }

    fn is_terminal(&self, state: BuildState) -> bool {
        matches!(state, BuildState::Committed | BuildState::RolledBack)
    }

    fn transition(&self, state: &BuildState, event: &Event) -> (BuildState, Vec<Effect>) {
        use BuildState as S;

        match (*state, event) {
            (S::Pending, Event::FlowStarted) => (S::Pending, vec![Effect::ProvisionDisk]),
            (S::Pending, Event::DiskReady) => (S::DiskProvisioned, vec![Effect::WriteCloudInit]),
            (S::DiskProvisioned, Event::CloudInitReady) => {
                (S::CloudInitWritten, vec![Effect::DefineDomain])
            }
            (S::CloudInitWritten, Event::DomainDefined) => {
                (S::DomainDefined, vec![Effect::StartDomain])
            }
            (S::DomainDefined, Event::DomainStarted) => {
                (S::DomainStarted, vec![Effect::WaitForGuest])
            }
            (S::DomainStarted, Event::GuestReady) => self.after_prepare(0),

            (
                S::Preparing { done },
                Event::ScriptSucceeded {
                    category: ScriptCategory::Prepare,
                    index,
                },
            ) if *index == done => self.after_prepare(done + 1),

            (S::Restoring, Event::Restored) => (S::Verified, vec![Effect::Commit]),
            (S::Verified, Event::Committed) => (S::Committed, vec![]),

            (s, Event::Failed | Event::AbortRequested) if !s.is_settled() => {
                (S::RollingBack, vec![Effect::Rollback])
            }
            (S::RollingBack, Event::RolledBack) => (S::RolledBack, vec![]),

            (s, _) => (s, vec![]),
        }
    }
}
