//! Driver for [`BuildFlow`]: performs each effect, tracks what this attempt
//! created, and discards exactly that on rollback.

use std::collections::VecDeque;

use crate::cloudinit::{self, SeedParams};
use crate::domain_xml::{self, BACKUP_TARGET_DEV, DomainSpec};
use crate::error::MulchError;
use crate::flow::build::{BuildFlow, BuildState};
use crate::flow::{Effect, Event, Flow};
use crate::paths;
use crate::registry::{ActiveResources, OpGuard, RetiredRevision, VmRecord};
use crate::util::{format_size, unix_now};
use crate::vm_config::{ScriptCategory, VmConfig};
use crate::vm_state::VmState;
use crate::volume::VolumeRef;

use super::{Orchestrator, ScriptTarget};

/// Identity of the revision being built.
pub(super) struct BuildPlan {
    pub name: String,
    pub revision: u32,
    pub config: VmConfig,
    pub mac: String,
    pub domain: String,
    pub disk: VolumeRef,
    pub cloud_init: VolumeRef,
}

impl BuildPlan {
    pub fn new(config: VmConfig, revision: u32, mac: String) -> Self {
        let name = config.name.clone();
        Self {
            domain: paths::domain_name(&name, revision),
            disk: VolumeRef::new(paths::POOL_DISKS, paths::disk_volume(&name, revision)),
            cloud_init: VolumeRef::new(
                paths::POOL_CLOUD_INIT,
                paths::cloud_init_volume(&name, revision),
            ),
            name,
            revision,
            config,
            mac,
        }
    }

    fn active_resources(&self) -> ActiveResources {
        ActiveResources {
            domain: self.domain.clone(),
            disk_volume: self.disk.name.clone(),
            cloud_init_volume: self.cloud_init.name.clone(),
            mac: self.mac.clone(),
        }
    }
}

/// How a verified build becomes the VM's committed revision.
pub(super) enum CommitMode {
    /// First revision: publish a new record.
    Create,
    /// Swap the record to the new revision, then retire `previous`.
    Replace { previous: VmRecord },
}

/// Resources created by this attempt, and nothing else.
#[derive(Default)]
struct Attempt {
    disk_path: Option<std::path::PathBuf>,
    cloud_init_path: Option<std::path::PathBuf>,
    disk: bool,
    cloud_init: bool,
    domain: bool,
    address: Option<String>,
    committed: Option<VmRecord>,
}

impl Orchestrator {
    /// Run one build attempt to its terminal state.
    pub(super) async fn run_build(
        &self,
        guard: &OpGuard,
        plan: &BuildPlan,
        mode: &CommitMode,
    ) -> Result<VmRecord, MulchError> {
        let flow = BuildFlow::new(plan.config.prepare.len(), plan.config.restore_backup.is_some());
        let mut attempt = Attempt::default();
        let mut failure: Option<(String, MulchError)> = None;

        let mut state = flow.entry_state();
        let (next, effects) = flow.transition(&state, &Event::FlowStarted);
        state = next;
        let mut queue = VecDeque::from(effects);

        while let Some(effect) = queue.pop_front() {
            let event = if guard.is_cancelled() && failure.is_none() && effect != Effect::Rollback
            {
                self.hub
                    .warning(&plan.name, format!("abort requested before {}", effect.step()));
                failure = Some((
                    effect.step(),
                    MulchError::Aborted {
                        name: plan.name.clone(),
                    },
                ));
                Event::AbortRequested
            } else {
                match self.perform(guard, plan, mode, &effect, &mut attempt).await {
                    Ok(event) => event,
                    Err(e) => {
                        self.hub
                            .error(&plan.name, format!("{} failed: {e}", effect.step()));
                        failure = Some((effect.step(), e));
                        Event::Failed
                    }
                }
            };

            let (next, effects) = flow.transition(&state, &event);
            tracing::debug!(vm = %plan.name, from = ?state, to = ?next, ?event, "build transition");
            state = next;
            queue.extend(effects);
        }

        match (state, attempt.committed, failure) {
            (BuildState::Committed, Some(record), _) => Ok(record),
            (_, _, Some((step, source))) => Err(MulchError::BuildFailed {
                name: plan.name.clone(),
                step,
                source: Box::new(source),
            }),
            (state, _, None) => Err(MulchError::BuildFailed {
                name: plan.name.clone(),
                step: format!("{state:?}"),
                source: Box::new(MulchError::Aborted {
                    name: plan.name.clone(),
                }),
            }),
        }
    }

    async fn perform(
        &self,
        guard: &OpGuard,
        plan: &BuildPlan,
        mode: &CommitMode,
        effect: &Effect,
        attempt: &mut Attempt,
    ) -> Result<Event, MulchError> {
        let vm = plan.name.as_str();
        match effect {
            Effect::ProvisionDisk => {
                let seed = VolumeRef::new(paths::POOL_SEEDS, paths::seed_volume(&plan.config.seed));
                self.hub
                    .info(vm, format!("provisioning disk {} from {seed}", plan.disk));
                self.refuse_existing(&plan.disk).await?;

                let provisioned = self.volumes.provision(&seed, &plan.disk).await;
                attempt.disk = self.left_behind(vm, &plan.disk, provisioned.is_ok()).await;
                let provisioned = provisioned?;
                self.hub.info(
                    vm,
                    format!(
                        "copied {} in {:.1}s",
                        format_size(provisioned.bytes_copied),
                        provisioned.elapsed.as_secs_f64()
                    ),
                );

                if plan.config.disk_size != provisioned.volume.size {
                    self.hub.info(
                        vm,
                        format!("resizing disk to {}", format_size(plan.config.disk_size)),
                    );
                    self.volumes.resize(&plan.disk, plan.config.disk_size).await?;
                }
                attempt.disk_path = Some(provisioned.volume.path);
                Ok(Event::DiskReady)
            }

            Effect::WriteCloudInit => {
                self.hub
                    .info(vm, format!("writing cloud-init volume {}", plan.cloud_init));
                self.refuse_existing(&plan.cloud_init).await?;
                let image = cloudinit::seed_iso(&SeedParams {
                    config: &plan.config,
                    revision: plan.revision,
                    control_user: &self.config.ssh_user,
                    ssh_public_key: &self.ssh_public_key,
                })?;

                let written = self.volumes.write(&plan.cloud_init, image).await;
                attempt.cloud_init = self
                    .left_behind(vm, &plan.cloud_init, written.is_ok())
                    .await;
                attempt.cloud_init_path = Some(written?.path);
                Ok(Event::CloudInitReady)
            }

            Effect::DefineDomain => {
                let (Some(disk_path), Some(cloud_init_path)) =
                    (&attempt.disk_path, &attempt.cloud_init_path)
                else {
                    return Err(MulchError::Volume {
                        pool: plan.disk.pool.clone(),
                        name: plan.disk.name.clone(),
                        message: "volumes missing before domain definition".into(),
                    });
                };
                let domain = plan.domain.clone();
                if self.hv(move |hv| hv.domain_exists(&domain)).await? {
                    return Err(MulchError::AlreadyExists {
                        name: plan.domain.clone(),
                    });
                }

                let xml = domain_xml::generate_domain_xml(&DomainSpec {
                    name: &plan.domain,
                    ram_bytes: plan.config.ram_size,
                    cpu_count: plan.config.cpu_count,
                    disk_path,
                    cloud_init_path,
                    network: &self.config.network,
                    mac: &plan.mac,
                });
                self.hub.info(
                    vm,
                    format!(
                        "defining domain {} ({} CPU, {} RAM, MAC {})",
                        plan.domain,
                        plan.config.cpu_count,
                        format_size(plan.config.ram_size),
                        plan.mac
                    ),
                );
                self.hv(move |hv| hv.define_domain(&xml)).await?;
                attempt.domain = true;
                Ok(Event::DomainDefined)
            }

            Effect::StartDomain => {
                self.hub.info(vm, format!("starting domain {}", plan.domain));
                let domain = plan.domain.clone();
                self.hv(move |hv| hv.start_domain(&domain)).await?;
                Ok(Event::DomainStarted)
            }

            Effect::WaitForGuest => {
                let address = self.wait_for_ip(guard, vm, &plan.domain).await?;
                self.hub.info(vm, format!("guest is up at {address}"));
                attempt.address = Some(address);
                Ok(Event::GuestReady)
            }

            Effect::RunScript { category, index } => {
                let target = ScriptTarget {
                    config: &plan.config,
                    revision: plan.revision,
                    host: guest_address(attempt, vm)?,
                    backup_device: None,
                };
                self.run_script(guard, &target, *category, *index).await?;
                Ok(Event::ScriptSucceeded {
                    category: *category,
                    index: *index,
                })
            }

            Effect::Restore => {
                let host = guest_address(attempt, vm)?.to_string();
                self.restore(guard, plan, &host).await?;
                Ok(Event::Restored)
            }

            Effect::Commit => {
                let record = self.commit(guard, plan, mode).await?;
                attempt.committed = Some(record);
                Ok(Event::Committed)
            }

            Effect::Rollback => {
                self.rollback(plan, attempt).await;
                Ok(Event::RolledBack)
            }

            Effect::StopDomain
            | Effect::UndefineDomain
            | Effect::DeleteVolumes
            | Effect::RemoveRecord => Ok(Event::Failed),
        }
    }

    /// Whether a step that creates `vol` left it behind. A volume that
    /// cannot be looked up is assumed to exist so rollback still tries it.
    async fn left_behind(&self, vm: &str, vol: &VolumeRef, created: bool) -> bool {
        if created {
            return true;
        }
        match self.volumes.describe(vol).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                self.hub
                    .error(vm, format!("unable to look up volume {vol}: {e}"));
                true
            }
        }
    }

    async fn refuse_existing(&self, vol: &VolumeRef) -> Result<(), MulchError> {
        if self.volumes.describe(vol).await?.is_some() {
            return Err(MulchError::Volume {
                pool: vol.pool.clone(),
                name: vol.name.clone(),
                message: "volume already exists".into(),
            });
        }
        Ok(())
    }

    /// Attach the backup named by `restore_backup`, run the restore scripts
    /// against it, detach.
    async fn restore(&self, guard: &OpGuard, plan: &BuildPlan, host: &str) -> Result<(), MulchError> {
        let vm = plan.name.as_str();
        let Some(backup) = &plan.config.restore_backup else {
            return Ok(());
        };
        let vol = VolumeRef::new(paths::POOL_BACKUPS, backup.clone());
        let descriptor = self
            .volumes
            .describe(&vol)
            .await?
            .ok_or_else(|| MulchError::NotFound {
                name: vol.to_string(),
            })?;

        self.hub.info(vm, format!("attaching backup {vol} for restore"));
        let disk_xml = domain_xml::backup_disk_xml(&descriptor.path, "qcow2");
        let (domain, xml) = (plan.domain.clone(), disk_xml.clone());
        self.hv(move |hv| hv.attach_device(&domain, &xml)).await?;

        let target = ScriptTarget {
            config: &plan.config,
            revision: plan.revision,
            host,
            backup_device: Some(BACKUP_TARGET_DEV),
        };
        let mut result = Ok(());
        for index in 0..plan.config.restore.len() {
            result = self
                .run_script(guard, &target, ScriptCategory::Restore, index)
                .await;
            if result.is_err() {
                break;
            }
        }

        let domain = plan.domain.clone();
        let detached = self.hv(move |hv| hv.detach_device(&domain, &disk_xml)).await;
        result?;
        detached
    }

    async fn commit(
        &self,
        guard: &OpGuard,
        plan: &BuildPlan,
        mode: &CommitMode,
    ) -> Result<VmRecord, MulchError> {
        let now = unix_now();
        match mode {
            CommitMode::Create => {
                let record = VmRecord {
                    name: plan.name.clone(),
                    revision: plan.revision,
                    locked: false,
                    state: VmState::Active,
                    active: plan.active_resources(),
                    config: plan.config.clone(),
                    history: Vec::new(),
                    backups: Vec::new(),
                    created_at: now,
                    updated_at: now,
                };
                self.registry.insert(guard, record.clone())?;
                self.hub
                    .info(&plan.name, format!("committed revision {}", plan.revision));
                Ok(record)
            }
            CommitMode::Replace { previous } => {
                let record = self.registry.update(guard, |r| {
                    r.history.push(RetiredRevision {
                        revision: previous.revision,
                        domain: previous.active.domain.clone(),
                        retired_at: now,
                    });
                    r.revision = plan.revision;
                    r.active = plan.active_resources();
                    r.config = plan.config.clone();
                    r.state = VmState::Active;
                })?;
                self.hub.info(
                    &plan.name,
                    format!(
                        "committed revision {} (was {})",
                        plan.revision, previous.revision
                    ),
                );
                self.retire(&plan.name, &previous.active).await;
                Ok(record)
            }
        }
    }

    /// Discard what this attempt created. Errors are reported, never raised.
    async fn rollback(&self, plan: &BuildPlan, attempt: &Attempt) {
        let vm = plan.name.as_str();
        self.hub
            .warning(vm, format!("rolling back revision {}", plan.revision));

        let mut domain_gone = true;
        if attempt.domain {
            if let Err(e) = self.discard_domain(&plan.domain).await {
                self.hub
                    .error(vm, format!("rollback: unable to remove domain {}: {e}", plan.domain));
                domain_gone = false;
            }
        }
        if domain_gone {
            self.macs.release(&plan.mac);
        }
        for (created, vol) in [
            (attempt.cloud_init, &plan.cloud_init),
            (attempt.disk, &plan.disk),
        ] {
            if created {
                if let Err(e) = self.volumes.delete(vol).await {
                    self.hub
                        .error(vm, format!("rollback: unable to delete volume {vol}: {e}"));
                }
            }
        }
    }

    /// Hard-stop and undefine a domain that never went live.
    async fn discard_domain(&self, domain: &str) -> Result<(), MulchError> {
        let domain = domain.to_string();
        self.hv(move |hv| {
            if hv.domain_is_active(&domain)? {
                hv.destroy_domain(&domain)?;
            }
            hv.undefine_domain(&domain)
        })
        .await
    }
}

fn guest_address<'a>(attempt: &'a Attempt, vm: &str) -> Result<&'a str, MulchError> {
    attempt
        .address
        .as_deref()
        .ok_or_else(|| MulchError::Remote {
            host: vm.to_string(),
            message: "guest address unknown".into(),
        })
}
