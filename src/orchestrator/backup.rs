use tokio::io::AsyncWrite;

use crate::domain_xml::{self, BACKUP_TARGET_DEV};
use crate::error::MulchError;
use crate::paths;
use crate::registry::{BackupRef, OpGuard, Operation, VmRecord};
use crate::util::{format_size, unix_now, utc_timestamp};
use crate::vm_config::ScriptCategory;
use crate::volume::VolumeRef;

use super::{Orchestrator, ScriptTarget};

impl Orchestrator {
    /// Attach a fresh backup disk to the running VM, run its backup scripts
    /// against it and record the result. The primary disk is never touched.
    pub async fn backup(&self, name: &str) -> Result<VolumeRef, MulchError> {
        let guard = self.registry.acquire(name, Operation::Backup)?;
        let record = self
            .registry
            .get(name)
            .ok_or_else(|| MulchError::NotFound { name: name.into() })?;

        let vol = VolumeRef::new(
            paths::POOL_BACKUPS,
            paths::backup_volume(name, &utc_timestamp()),
        );
        let size = record.config.backup_disk_size;
        self.hub
            .info(name, format!("creating backup volume {vol} ({})", format_size(size)));
        let descriptor = self.volumes.create_blank(&vol, size).await.map_err(|e| {
            MulchError::BuildFailed {
                name: name.into(),
                step: "backup volume".into(),
                source: Box::new(e),
            }
        })?;

        let disk_xml = domain_xml::backup_disk_xml(&descriptor.path, "qcow2");
        match self.run_backup(&guard, &record, &disk_xml).await {
            Ok(()) => {}
            Err((step, e)) => {
                self.hub.error(name, format!("backup failed: {e}"));
                if let Err(e) = self.volumes.delete(&vol).await {
                    self.hub
                        .error(name, format!("unable to delete backup volume {vol}: {e}"));
                }
                return Err(MulchError::BuildFailed {
                    name: name.into(),
                    step,
                    source: Box::new(e),
                });
            }
        }

        let backup = BackupRef {
            volume: vol.name.clone(),
            size,
            revision: record.revision,
            created_at: unix_now(),
        };
        self.registry
            .update(&guard, |r| r.backups.push(backup))?;
        self.hub.info(name, format!("backup {} is ready", vol.name));
        Ok(vol)
    }

    /// Attach, run every backup script, detach. The disk is detached on
    /// failure as well.
    async fn run_backup(
        &self,
        guard: &OpGuard,
        record: &VmRecord,
        disk_xml: &str,
    ) -> Result<(), (String, MulchError)> {
        let vm = record.name.as_str();
        let domain = record.active.domain.clone();

        let d = domain.clone();
        let address = self
            .hv(move |hv| hv.domain_address(&d))
            .await
            .and_then(|a| {
                a.ok_or_else(|| MulchError::Remote {
                    host: domain.clone(),
                    message: "domain has no address, is it running?".into(),
                })
            })
            .map_err(|e| ("guest address".to_string(), e))?;

        let (d, xml) = (domain.clone(), disk_xml.to_string());
        self.hv(move |hv| hv.attach_device(&d, &xml))
            .await
            .map_err(|e| ("backup disk attach".to_string(), e))?;

        let target = ScriptTarget {
            config: &record.config,
            revision: record.revision,
            host: &address,
            backup_device: Some(BACKUP_TARGET_DEV),
        };
        let mut result = Ok(());
        for index in 0..record.config.backup.len() {
            if guard.is_cancelled() {
                result = Err((
                    "backup".to_string(),
                    MulchError::Aborted { name: vm.into() },
                ));
                break;
            }
            if let Err(e) = self
                .run_script(guard, &target, ScriptCategory::Backup, index)
                .await
            {
                result = Err((format!("backup script #{index}"), e));
                break;
            }
        }

        let xml = disk_xml.to_string();
        let detached = self
            .hv(move |hv| hv.detach_device(&domain, &xml))
            .await
            .map_err(|e| ("backup disk detach".to_string(), e));
        if let (Err(_), Err((_, e))) = (&result, &detached) {
            self.hub
                .error(vm, format!("unable to detach backup disk: {e}"));
        }
        result.and(detached)
    }

    /// Stream a backup volume's raw content into `out`.
    pub async fn export_backup<W>(&self, volume: &str, out: &mut W) -> Result<u64, MulchError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let vol = VolumeRef::new(paths::POOL_BACKUPS, volume);
        if self.volumes.describe(&vol).await?.is_none() {
            return Err(MulchError::NotFound {
                name: vol.to_string(),
            });
        }
        let written = self.volumes.export(&vol, out).await?;
        tracing::info!(volume = %vol, bytes = written, "backup exported");
        Ok(written)
    }
}
