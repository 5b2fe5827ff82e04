//! Lifecycle orchestrator: create, redefine, backup and delete VMs.
//!
//! Every mutating operation first takes the VM's [`OpGuard`], so operations
//! on one name never overlap while different names proceed in parallel.
//! Builds run beside the live revision and only replace it once the new
//! domain is up and its scripts passed.

mod backup;
mod build;
mod delete;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::AppConfig;
use crate::domain_xml::MacGenerator;
use crate::error::MulchError;
use crate::executor::{RemoteExecutor, build_script_payload};
use crate::fetch::ScriptFetcher;
use crate::hub::{Hub, Subscription};
use crate::hypervisor::Hypervisor;
use crate::logging::{ScriptLogger, rotate_logs, script_key};
use crate::paths;
use crate::registry::{ActiveResources, OpGuard, Operation, RecordStore, VmRecord, VmRegistry};
use crate::vm_config::{self, ScriptCategory, VmConfig};
use crate::vm_state::VmState;
use crate::volume::{VolumeEngine, VolumeRef};

use build::{BuildPlan, CommitMode};

const IP_POLL_INTERVAL: Duration = Duration::from_secs(2);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_secs(1);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

/// External systems the orchestrator drives.
pub struct Collaborators {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub volumes: VolumeEngine,
    pub fetcher: Arc<dyn ScriptFetcher>,
    pub executor: Arc<dyn RemoteExecutor>,
    pub store: Box<dyn RecordStore>,
}

/// Point-in-time view of one VM.
#[derive(Debug, Clone)]
pub struct VmStatus {
    pub name: String,
    pub state: VmState,
    pub operation: Option<Operation>,
    /// `None` while the first build is still running.
    pub record: Option<VmRecord>,
}

/// Where and as whom a lifecycle script runs.
struct ScriptTarget<'a> {
    config: &'a VmConfig,
    revision: u32,
    host: &'a str,
    /// Guest device of an attached backup disk, exported as `_BACKUP`.
    backup_device: Option<&'a str>,
}

pub struct Orchestrator {
    config: AppConfig,
    hub: Hub,
    registry: VmRegistry,
    hv: Arc<dyn Hypervisor>,
    volumes: VolumeEngine,
    fetcher: Arc<dyn ScriptFetcher>,
    executor: Arc<dyn RemoteExecutor>,
    macs: MacGenerator,
    ssh_public_key: String,
}

impl Orchestrator {
    /// Load the registry and reserve the hardware addresses it references.
    pub fn open(config: AppConfig, hub: Hub, parts: Collaborators) -> Result<Self, MulchError> {
        let registry = VmRegistry::open(parts.store)?;
        let macs = MacGenerator::new();
        let records = registry.list();
        macs.reserve(records.iter().map(|r| r.active.mac.as_str()));

        let ssh_public_key = config.control_public_key()?;
        if ssh_public_key.is_empty() {
            tracing::warn!("no control public key, guests will not accept SSH");
        }

        tracing::info!(
            vms = records.len(),
            storage = parts.volumes.strategy_name(),
            "orchestrator ready"
        );
        Ok(Self {
            config,
            hub,
            registry,
            hv: parts.hypervisor,
            volumes: parts.volumes,
            fetcher: parts.fetcher,
            executor: parts.executor,
            macs,
            ssh_public_key,
        })
    }

    /// Make sure every storage pool and the VM network exist.
    pub async fn setup(&self) -> Result<(), MulchError> {
        let root = self.config.storage_root();
        for (pool, _, mode) in paths::POOLS {
            let dir = paths::pool_dir(&root, pool);
            self.hv(move |hv| hv.ensure_pool(pool, &dir, mode)).await?;
        }
        let (network, subnet) = (
            self.config.network.clone(),
            self.config.network_subnet.clone(),
        );
        self.hv(move |hv| hv.ensure_network(&network, &subnet))
            .await
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn volumes(&self) -> &VolumeEngine {
        &self.volumes
    }

    // ── operations ─────────────────────────────────────────

    /// Build revision 1 of a new VM from `document`.
    pub async fn create(&self, name: &str, document: &str) -> Result<VmRecord, MulchError> {
        if self.registry.contains(name) {
            return Err(MulchError::AlreadyExists { name: name.into() });
        }
        let guard = self.registry.acquire(name, Operation::Create)?;
        if self.registry.contains(name) {
            return Err(MulchError::AlreadyExists { name: name.into() });
        }

        let config = self.compile_for(name, document).await?;
        let plan = BuildPlan::new(config, 1, self.macs.next());
        self.hub.info(name, "building revision 1");

        match self.run_build(&guard, &plan, &CommitMode::Create).await {
            Ok(record) => {
                self.hub.info(name, "VM is active");
                Ok(record)
            }
            Err(e) => {
                self.hub.error(name, format!("create failed: {e}"));
                Err(e)
            }
        }
    }

    /// Build a new revision beside the live one and swap to it.
    ///
    /// `revision` defaults to the current revision plus one; an explicit
    /// value must be greater than the current revision. `force` overrides
    /// the user lock only.
    pub async fn redefine(
        &self,
        name: &str,
        document: &str,
        revision: Option<u32>,
        force: bool,
    ) -> Result<VmRecord, MulchError> {
        let guard = self.registry.acquire(name, Operation::Redefine)?;
        let previous = self
            .registry
            .get(name)
            .ok_or_else(|| MulchError::NotFound { name: name.into() })?;
        if previous.locked && !force {
            return Err(MulchError::Locked { name: name.into() });
        }
        let target = match revision {
            Some(requested) if requested <= previous.revision => {
                return Err(MulchError::StaleRevision {
                    name: name.into(),
                    requested,
                    current: previous.revision,
                });
            }
            Some(requested) => requested,
            None => previous.revision + 1,
        };

        let config = self.compile_for(name, document).await?;
        self.registry
            .update(&guard, |r| r.state = VmState::Redefining)?;

        let plan = BuildPlan::new(config, target, self.macs.next());
        self.hub.info(
            name,
            format!(
                "building revision {target} beside revision {}",
                previous.revision
            ),
        );

        let result = self
            .run_build(&guard, &plan, &CommitMode::Replace { previous })
            .await;
        if let Err(e) = &result {
            self.hub.error(name, format!("redefine failed: {e}"));
            for state in [VmState::FailedRollback, VmState::Active] {
                if let Err(e) = self.registry.update(&guard, |r| r.state = state) {
                    self.hub
                        .error(name, format!("unable to record state {state}: {e}"));
                }
            }
        }
        result
    }

    pub fn lock(&self, name: &str) -> Result<VmRecord, MulchError> {
        self.set_locked(name, true)
    }

    pub fn unlock(&self, name: &str) -> Result<VmRecord, MulchError> {
        self.set_locked(name, false)
    }

    fn set_locked(&self, name: &str, locked: bool) -> Result<VmRecord, MulchError> {
        let guard = self.registry.acquire(name, Operation::Lock)?;
        if !self.registry.contains(name) {
            return Err(MulchError::NotFound { name: name.into() });
        }
        let record = self.registry.update(&guard, |r| r.locked = locked)?;
        self.hub
            .info(name, if locked { "locked" } else { "unlocked" });
        Ok(record)
    }

    pub fn status(&self, name: &str) -> Result<VmStatus, MulchError> {
        let operation = self.registry.operation_in_flight(name);
        let record = self.registry.get(name);
        let state = match (&record, operation) {
            (Some(record), _) => record.state,
            (None, Some(Operation::Create)) => VmState::Building,
            (None, _) => return Err(MulchError::NotFound { name: name.into() }),
        };
        Ok(VmStatus {
            name: name.to_string(),
            state,
            operation,
            record,
        })
    }

    /// Every known VM, sorted by name.
    pub fn list(&self) -> Vec<VmRecord> {
        self.registry.list()
    }

    /// Ask the operation running on `name` to stop and roll back. Returns
    /// false when nothing is running.
    pub fn abort(&self, name: &str) -> bool {
        let signalled = self.registry.abort(name);
        if signalled {
            self.hub.warning(name, "abort requested");
        }
        signalled
    }

    pub fn subscribe_events(&self) -> Subscription {
        self.hub.subscribe()
    }

    /// Events of one VM plus global events.
    pub fn subscribe_vm(&self, name: &str) -> Subscription {
        self.hub.subscribe_vm(name)
    }

    // ── shared steps ───────────────────────────────────────

    async fn compile_for(&self, name: &str, document: &str) -> Result<VmConfig, MulchError> {
        self.hub.info(name, "compiling configuration");
        let config = vm_config::compile(document, self.fetcher.as_ref()).await?;
        if config.name != name {
            return Err(MulchError::validation(
                "name",
                format!("document describes VM '{}', not '{name}'", config.name),
            ));
        }
        Ok(config)
    }

    /// Run a hypervisor call on the blocking pool.
    async fn hv<T, F>(&self, f: F) -> Result<T, MulchError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Hypervisor) -> Result<T, MulchError> + Send + 'static,
    {
        let hv = Arc::clone(&self.hv);
        tokio::task::spawn_blocking(move || f(hv.as_ref()))
            .await
            .map_err(|e| MulchError::Join {
                message: e.to_string(),
            })?
    }

    /// Poll the DHCP leases until the domain has an address.
    async fn wait_for_ip(
        &self,
        guard: &OpGuard,
        vm: &str,
        domain: &str,
    ) -> Result<String, MulchError> {
        let timeout = Duration::from_secs(self.config.ip_wait_timeout_s);
        let deadline = Instant::now() + timeout;
        self.hub.info(vm, format!("waiting for {domain} to get an address"));

        loop {
            let d = domain.to_string();
            if let Some(address) = self.hv(move |hv| hv.domain_address(&d)).await? {
                return Ok(address);
            }
            if Instant::now() >= deadline {
                return Err(MulchError::Libvirt {
                    message: format!("{domain} got no address within {}s", timeout.as_secs()),
                    hint: format!("check DHCP on network '{}'", self.config.network),
                });
            }
            tokio::select! {
                _ = tokio::time::sleep(IP_POLL_INTERVAL) => {}
                _ = guard.token().cancelled() => {
                    return Err(MulchError::Aborted { name: vm.into() });
                }
            }
        }
    }

    /// Fetch and run one lifecycle script, logging its output to the hub
    /// and to a per-run log file.
    async fn run_script(
        &self,
        guard: &OpGuard,
        target: &ScriptTarget<'_>,
        category: ScriptCategory,
        index: usize,
    ) -> Result<(), MulchError> {
        let config = target.config;
        let vm = config.name.as_str();
        let script = config
            .scripts(category)
            .get(index)
            .ok_or_else(|| MulchError::validation(category.as_str(), format!("no script #{index}")))?;

        self.hub.info(
            vm,
            format!("running {category} script {} as {}", script.url, script.run_as),
        );
        let body = self.fetcher.fetch(&script.url).await?;

        let mut env: Vec<(String, String)> = config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.push(("_VM_NAME".into(), config.name.clone()));
        env.push(("_APP_USER".into(), config.app_user.clone()));
        env.push(("_VM_REVISION".into(), target.revision.to_string()));
        if let Some(device) = target.backup_device {
            env.push(("_BACKUP".into(), format!("/dev/{device}")));
        }
        let payload = build_script_payload(
            env.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            &body,
        );

        let logs_dir = paths::logs_dir(&self.config.data_root(), vm);
        let key = script_key(category.as_str(), index);
        let logger = ScriptLogger::new(&logs_dir, &key).map_err(|e| MulchError::Io {
            context: format!("creating script log in {}", logs_dir.display()),
            source: e,
        })?;
        let logger = Mutex::new(logger);
        let on_output = |line: &str| {
            self.hub.trace(vm, line);
            logger
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .write_line(line);
        };

        let outcome = tokio::select! {
            outcome = self.executor.run(target.host, &script.run_as, &payload, &on_output) => outcome,
            _ = guard.token().cancelled() => Err(MulchError::Aborted { name: vm.into() }),
        };

        let success = matches!(outcome, Ok(0));
        let log = logger
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .finish(success);
        rotate_logs(&logs_dir, &key, self.config.keep_script_logs);
        tracing::debug!(vm, script = %script.url, log = %log.display(), success, "script finished");

        match outcome? {
            0 => Ok(()),
            status => Err(MulchError::ScriptFailed {
                url: script.url.clone(),
                run_as: script.run_as.clone(),
                status,
            }),
        }
    }

    /// Shut a live domain down, hard-stopping it after a grace period.
    async fn stop_domain(&self, vm: &str, domain: &str) -> Result<(), MulchError> {
        let d = domain.to_string();
        let running = self
            .hv(move |hv| Ok(hv.domain_exists(&d)? && hv.domain_is_active(&d)?))
            .await?;
        if !running {
            return Ok(());
        }

        self.hub.info(vm, format!("shutting down {domain}"));
        let d = domain.to_string();
        self.hv(move |hv| hv.shutdown_domain(&d)).await?;

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            let d = domain.to_string();
            if !self.hv(move |hv| hv.domain_is_active(&d)).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }

        self.hub.warning(
            vm,
            format!("{domain} ignored shutdown for {}s, forcing off", SHUTDOWN_GRACE.as_secs()),
        );
        let d = domain.to_string();
        self.hv(move |hv| hv.destroy_domain(&d)).await
    }

    /// Remove a superseded revision. Failures leak the resource and are
    /// reported; the new revision stays committed.
    async fn retire(&self, vm: &str, old: &ActiveResources) {
        let domain = old.domain.clone();
        let removed = match self.stop_domain(vm, &domain).await {
            Ok(()) => {
                self.hv(move |hv| {
                    if hv.domain_exists(&domain)? {
                        hv.undefine_domain(&domain)?;
                    }
                    Ok(())
                })
                .await
            }
            Err(e) => Err(e),
        };
        match removed {
            Ok(()) => self.macs.release(&old.mac),
            Err(e) => self
                .hub
                .error(vm, format!("unable to retire domain {}: {e}", old.domain)),
        }

        for vol in [
            VolumeRef::new(paths::POOL_DISKS, old.disk_volume.clone()),
            VolumeRef::new(paths::POOL_CLOUD_INIT, old.cloud_init_volume.clone()),
        ] {
            if let Err(e) = self.volumes.delete(&vol).await {
                self.hub
                    .error(vm, format!("unable to delete retired volume {vol}: {e}"));
            }
        }
        self.hub.info(vm, format!("retired {}", old.domain));
    }
}

#[cfg(test)]
mod tests;
