use std::collections::VecDeque;

use crate::error::MulchError;
use crate::flow::delete::{DeleteFlow, DeleteState};
use crate::flow::{Effect, Event, Flow};
use crate::paths;
use crate::registry::{OpGuard, Operation, VmRecord};
use crate::vm_state::VmState;
use crate::volume::VolumeRef;

use super::Orchestrator;

impl Orchestrator {
    /// Stop and undefine the VM, drop its volumes, forget its record.
    ///
    /// Backups are deleted too unless `keep_backups` is set. `force`
    /// overrides the user lock only.
    pub async fn delete(
        &self,
        name: &str,
        force: bool,
        keep_backups: bool,
    ) -> Result<(), MulchError> {
        let guard = self.registry.acquire(name, Operation::Delete)?;
        let record = self
            .registry
            .get(name)
            .ok_or_else(|| MulchError::NotFound { name: name.into() })?;
        if record.locked && !force {
            return Err(MulchError::Locked { name: name.into() });
        }
        self.registry
            .update(&guard, |r| r.state = VmState::Deleting)?;
        self.hub.info(name, "deleting VM");

        let flow = DeleteFlow;
        let mut failure = None;
        let mut state = flow.entry_state();
        let (next, effects) = flow.transition(&state, &Event::FlowStarted);
        state = next;
        let mut queue = VecDeque::from(effects);

        while let Some(effect) = queue.pop_front() {
            let event = match self
                .perform_delete(&guard, &record, keep_backups, &effect)
                .await
            {
                Ok(event) => event,
                Err(e) => {
                    self.hub
                        .error(name, format!("{} failed: {e}", effect.step()));
                    failure = Some((effect.step(), e));
                    Event::Failed
                }
            };
            let (next, effects) = flow.transition(&state, &event);
            tracing::debug!(vm = name, from = ?state, to = ?next, "delete transition");
            state = next;
            queue.extend(effects);
        }

        match (state, failure) {
            (DeleteState::Absent, _) => {
                self.hub.info(name, "VM deleted");
                Ok(())
            }
            (state, failure) => {
                if state == DeleteState::Kept {
                    if let Err(e) = self.registry.update(&guard, |r| r.state = VmState::Active) {
                        self.hub
                            .error(name, format!("unable to record state active: {e}"));
                    }
                }
                let (step, source) = failure.unwrap_or_else(|| {
                    (
                        format!("{state:?}"),
                        MulchError::Aborted { name: name.into() },
                    )
                });
                Err(MulchError::BuildFailed {
                    name: name.into(),
                    step,
                    source: Box::new(source),
                })
            }
        }
    }

    async fn perform_delete(
        &self,
        guard: &OpGuard,
        record: &VmRecord,
        keep_backups: bool,
        effect: &Effect,
    ) -> Result<Event, MulchError> {
        let vm = record.name.as_str();
        let domain = record.active.domain.clone();
        match effect {
            Effect::StopDomain => {
                self.stop_domain(vm, &domain).await?;
                Ok(Event::DomainStopped)
            }
            Effect::UndefineDomain => {
                self.hv(move |hv| {
                    if hv.domain_exists(&domain)? {
                        hv.undefine_domain(&domain)?;
                    }
                    Ok(())
                })
                .await?;
                self.macs.release(&record.active.mac);
                Ok(Event::DomainUndefined)
            }
            Effect::DeleteVolumes => {
                let mut volumes = vec![
                    VolumeRef::new(paths::POOL_DISKS, record.active.disk_volume.clone()),
                    VolumeRef::new(paths::POOL_CLOUD_INIT, record.active.cloud_init_volume.clone()),
                ];
                if keep_backups {
                    if !record.backups.is_empty() {
                        self.hub
                            .info(vm, format!("keeping {} backup(s)", record.backups.len()));
                    }
                } else {
                    volumes.extend(
                        record
                            .backups
                            .iter()
                            .map(|b| VolumeRef::new(paths::POOL_BACKUPS, b.volume.clone())),
                    );
                }

                // the guest is gone; a volume that will not go away is leaked
                for vol in &volumes {
                    match self.volumes.describe(vol).await {
                        Ok(Some(_)) => {
                            if let Err(e) = self.volumes.delete(vol).await {
                                self.hub
                                    .error(vm, format!("unable to delete volume {vol}: {e}"));
                            }
                        }
                        Ok(None) => {}
                        Err(e) => self
                            .hub
                            .error(vm, format!("unable to look up volume {vol}: {e}")),
                    }
                }
                Ok(Event::VolumesDeleted)
            }
            Effect::RemoveRecord => {
                self.registry.remove(guard)?;
                Ok(Event::RecordRemoved)
            }
            _ => Ok(Event::Failed),
        }
    }
}
