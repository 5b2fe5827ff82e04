use std::sync::Arc;

use super::*;
use crate::hub::Severity;
use crate::logging::list_script_logs;
use crate::testing::{MemoryHypervisor, MemoryStore, ScriptedExecutor, StaticFetcher};
use crate::util::GIB;

const DOC: &str = r#"
name = "web1"
seed = "debian-12"
disk_size = "2GB"
ram_size = "512MB"
domains = ["web1.example.com"]
env = [["GREETING", "hello"]]
prepare_prefix_url = "https://scripts.test/prepare/"
prepare = ["app@base.sh"]
backup_prefix_url = "https://scripts.test/backup/"
backup = ["app@dump.sh"]
"#;

struct Fixture {
    hv: MemoryHypervisor,
    store: MemoryStore,
    exec: ScriptedExecutor,
    orch: Arc<Orchestrator>,
    data: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let data = tempfile::tempdir().unwrap();
    let hv = MemoryHypervisor::default();
    hv.put_volume(paths::POOL_SEEDS, "debian-12.qcow2", vec![7u8; 4096]);
    let store = MemoryStore::default();
    let exec = ScriptedExecutor::default();
    let fetcher = StaticFetcher::default()
        .with("https://scripts.test/prepare/base.sh", "#!/bin/bash\necho prepare\n")
        .with("https://scripts.test/prepare/broken.sh", "#!/bin/bash\nexit 3\n")
        .with("https://scripts.test/backup/dump.sh", "#!/bin/bash\necho backup\n")
        .with("https://scripts.test/restore/load.sh", "#!/bin/bash\necho restore\n");

    let config = AppConfig {
        data_path: data.path().display().to_string(),
        ip_wait_timeout_s: 5,
        ..AppConfig::default()
    };
    let hypervisor: Arc<dyn Hypervisor> = Arc::new(hv.clone());
    let orch = Orchestrator::open(
        config,
        Hub::new(),
        Collaborators {
            hypervisor: Arc::clone(&hypervisor),
            volumes: VolumeEngine::delegated(hypervisor),
            fetcher: Arc::new(fetcher),
            executor: Arc::new(exec.clone()),
            store: Box::new(store.clone()),
        },
    )
    .unwrap();

    Fixture {
        hv,
        store,
        exec,
        orch: Arc::new(orch),
        data,
    }
}

fn build_failure(err: MulchError) -> (String, MulchError) {
    match err {
        MulchError::BuildFailed { step, source, .. } => (step, *source),
        other => panic!("expected build failure, got {other:?}"),
    }
}

fn broken_doc() -> String {
    DOC.replace("app@base.sh", "app@broken.sh")
}

impl Fixture {
    fn assert_no_vm_resources(&self) {
        assert!(self.hv.domain_names().is_empty(), "{:?}", self.hv.domain_names());
        assert!(self.hv.volume_names(paths::POOL_DISKS).is_empty());
        assert!(self.hv.volume_names(paths::POOL_CLOUD_INIT).is_empty());
    }
}

fn messages(sub: &mut Subscription) -> Vec<String> {
    std::iter::from_fn(|| sub.try_recv())
        .map(|e| e.message.clone())
        .collect()
}

// ── create ─────────────────────────────────────────────────

#[tokio::test]
async fn create_builds_revision_one() {
    let fx = fixture();
    let record = fx.orch.create("web1", DOC).await.unwrap();

    assert_eq!(record.revision, 1);
    assert_eq!(record.state, VmState::Active);
    assert_eq!(record.active.domain, "web1-r1");
    assert!(!record.locked);

    let domain = fx.hv.domain("web1-r1").unwrap();
    assert!(domain.active);
    assert!(domain.xml.contains(&record.active.mac));
    assert_eq!(fx.hv.volume_names(paths::POOL_DISKS), vec!["web1-r1.qcow2"]);
    assert_eq!(
        fx.hv.volume(paths::POOL_DISKS, "web1-r1.qcow2").unwrap().capacity,
        2 * GIB
    );
    assert_eq!(
        fx.hv.volume_names(paths::POOL_CLOUD_INIT),
        vec!["web1-r1-cloud-init.iso"]
    );

    let calls = fx.exec.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].run_as, "app");
    assert!(calls[0].host.starts_with("10.104.0."));
    assert!(calls[0].payload.contains("export GREETING='hello'\n"));
    assert!(calls[0].payload.contains("export _VM_NAME='web1'\n"));
    assert!(calls[0].payload.contains("export _VM_REVISION='1'\n"));
    assert!(calls[0].payload.ends_with("echo prepare\n"));

    assert_eq!(fx.store.get("web1").unwrap(), record);
    let status = fx.orch.status("web1").unwrap();
    assert_eq!(status.state, VmState::Active);
    assert!(status.operation.is_none());

    let logs = list_script_logs(&paths::logs_dir(fx.data.path(), "web1"));
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].script, "prepare-0");
    assert_eq!(logs[0].status, "ok");
}

#[tokio::test]
async fn create_rejects_existing_name() {
    let fx = fixture();
    fx.orch.create("web1", DOC).await.unwrap();
    let err = fx.orch.create("web1", DOC).await.unwrap_err();
    assert!(matches!(err, MulchError::AlreadyExists { .. }));
    assert_eq!(fx.hv.domain_names(), vec!["web1-r1"]);
}

#[tokio::test]
async fn create_rejects_document_for_another_name() {
    let fx = fixture();
    let err = fx.orch.create("web2", DOC).await.unwrap_err();
    assert!(matches!(err, MulchError::Validation { ref field, .. } if field == "name"));
    fx.assert_no_vm_resources();
}

#[tokio::test]
async fn prepare_failure_rolls_back_create() {
    let fx = fixture();
    fx.exec.fail_when("exit 3", 3);

    let (step, source) = build_failure(fx.orch.create("web1", &broken_doc()).await.unwrap_err());
    assert_eq!(step, "prepare script #0");
    assert!(matches!(source, MulchError::ScriptFailed { status: 3, .. }));

    fx.assert_no_vm_resources();
    assert!(fx.store.get("web1").is_none());
    assert!(matches!(
        fx.orch.status("web1").unwrap_err(),
        MulchError::NotFound { .. }
    ));
    assert_eq!(fx.orch.macs.issued_count(), 0);

    let logs = list_script_logs(&paths::logs_dir(fx.data.path(), "web1"));
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, "failed");
}

#[tokio::test]
async fn missing_seed_fails_at_disk_step() {
    let fx = fixture();
    let doc = DOC.replace("debian-12", "debian-13");
    let (step, _) = build_failure(fx.orch.create("web1", &doc).await.unwrap_err());
    assert_eq!(step, "disk provisioning");
    fx.assert_no_vm_resources();
    assert!(fx.exec.calls().is_empty());
}

#[tokio::test]
async fn hypervisor_failure_rolls_back_created_resources() {
    let fx = fixture();
    fx.hv.fail_on("start_domain");

    let (step, source) = build_failure(fx.orch.create("web1", DOC).await.unwrap_err());
    assert_eq!(step, "domain start");
    assert!(matches!(source, MulchError::Libvirt { .. }));
    fx.assert_no_vm_resources();
    assert!(fx.hv.journal().contains(&"undefine_domain web1-r1".to_string()));
}

#[tokio::test]
async fn rollback_errors_do_not_mask_the_original_failure() {
    let fx = fixture();
    let mut sub = fx.orch.subscribe_events();
    fx.hv.fail_on("start_domain");
    fx.hv.fail_on("delete_volume");

    let (step, source) = build_failure(fx.orch.create("web1", DOC).await.unwrap_err());
    assert_eq!(step, "domain start");
    assert!(source.to_string().contains("start_domain"));

    let events = messages(&mut sub);
    assert!(
        events
            .iter()
            .any(|m| m.starts_with("rollback: unable to delete volume mulch-disks/web1-r1.qcow2"))
    );
    // the domain itself was still removed
    assert!(fx.hv.domain_names().is_empty());
}

#[tokio::test]
async fn failed_copy_is_discarded_when_lookup_also_fails() {
    let fx = fixture();
    let mut sub = fx.orch.subscribe_vm("web1");
    fx.hv.fail_on("upload:web1-r1.qcow2");
    fx.hv.fail_after("upload", "lookup_volume");

    let (step, source) = build_failure(fx.orch.create("web1", DOC).await.unwrap_err());
    assert_eq!(step, "disk provisioning");
    assert!(source.to_string().contains("upload web1-r1.qcow2"), "{source}");

    assert!(
        messages(&mut sub)
            .iter()
            .any(|m| m.starts_with("unable to look up volume mulch-disks/web1-r1.qcow2"))
    );
    assert!(fx.hv.journal().contains(&"delete_volume web1-r1.qcow2".to_string()));
    fx.assert_no_vm_resources();
}

#[tokio::test]
async fn commit_persistence_failure_rolls_back() {
    let fx = fixture();
    fx.store.fail_saves(true);

    let (step, source) = build_failure(fx.orch.create("web1", DOC).await.unwrap_err());
    assert_eq!(step, "commit");
    assert!(matches!(source, MulchError::Store { .. }));
    fx.assert_no_vm_resources();
    assert!(fx.orch.list().is_empty());
}

// ── redefine ───────────────────────────────────────────────

#[tokio::test]
async fn redefine_swaps_to_new_revision() {
    let fx = fixture();
    let first = fx.orch.create("web1", DOC).await.unwrap();
    let doc = DOC.replace("512MB", "1GB");

    let record = fx.orch.redefine("web1", &doc, None, false).await.unwrap();
    assert_eq!(record.revision, 2);
    assert_eq!(record.state, VmState::Active);
    assert_eq!(record.active.domain, "web1-r2");
    assert_eq!(record.config.ram_size, GIB);
    assert_ne!(record.active.mac, first.active.mac);
    assert!(!fx.orch.macs.in_use(&first.active.mac));
    assert!(fx.orch.macs.in_use(&record.active.mac));
    assert_eq!(record.history.len(), 1);
    assert_eq!(record.history[0].revision, 1);
    assert_eq!(record.history[0].domain, "web1-r1");

    assert_eq!(fx.hv.domain_names(), vec!["web1-r2"]);
    assert!(fx.hv.domain("web1-r2").unwrap().active);
    assert_eq!(fx.hv.volume_names(paths::POOL_DISKS), vec!["web1-r2.qcow2"]);
    assert_eq!(
        fx.hv.volume_names(paths::POOL_CLOUD_INIT),
        vec!["web1-r2-cloud-init.iso"]
    );
    assert_eq!(fx.store.get("web1").unwrap(), record);

    // the old domain is only retired after the new one passed its scripts
    let journal = fx.hv.journal();
    let started = journal.iter().position(|l| l == "start_domain web1-r2").unwrap();
    let retired = journal.iter().position(|l| l == "shutdown_domain web1-r1").unwrap();
    assert!(started < retired);
}

#[tokio::test]
async fn failed_redefine_leaves_live_vm_untouched() {
    let fx = fixture();
    let before = fx.orch.create("web1", DOC).await.unwrap();
    let disk_before = fx.hv.volume(paths::POOL_DISKS, "web1-r1.qcow2").unwrap();
    fx.exec.fail_when("exit 3", 3);

    let (step, _) = build_failure(
        fx.orch
            .redefine("web1", &broken_doc(), None, false)
            .await
            .unwrap_err(),
    );
    assert_eq!(step, "prepare script #0");

    let after = fx.orch.status("web1").unwrap().record.unwrap();
    assert_eq!(after.revision, before.revision);
    assert_eq!(after.active, before.active);
    assert_eq!(after.config, before.config);
    assert!(after.history.is_empty());
    assert_eq!(after.state, VmState::Active);

    assert_eq!(fx.hv.domain_names(), vec!["web1-r1"]);
    assert!(fx.hv.domain("web1-r1").unwrap().active);
    assert_eq!(fx.hv.volume_names(paths::POOL_DISKS), vec!["web1-r1.qcow2"]);
    assert_eq!(
        fx.hv.volume(paths::POOL_DISKS, "web1-r1.qcow2").unwrap(),
        disk_before
    );
    assert_eq!(
        fx.hv.volume_names(paths::POOL_CLOUD_INIT),
        vec!["web1-r1-cloud-init.iso"]
    );
}

#[tokio::test]
async fn stale_revision_is_rejected() {
    let fx = fixture();
    fx.orch.create("web1", DOC).await.unwrap();
    fx.orch.redefine("web1", DOC, None, false).await.unwrap();

    for requested in [1, 2] {
        let err = fx
            .orch
            .redefine("web1", DOC, Some(requested), false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MulchError::StaleRevision { requested: r, current: 2, .. } if r == requested
        ));
    }
    assert_eq!(fx.orch.status("web1").unwrap().record.unwrap().revision, 2);

    let record = fx.orch.redefine("web1", DOC, Some(5), false).await.unwrap();
    assert_eq!(record.revision, 5);
    assert_eq!(fx.hv.domain_names(), vec!["web1-r5"]);
}

#[tokio::test]
async fn redefine_of_unknown_vm_is_not_found() {
    let fx = fixture();
    let err = fx.orch.redefine("web1", DOC, None, false).await.unwrap_err();
    assert!(matches!(err, MulchError::NotFound { .. }));
}

#[tokio::test]
async fn locked_vm_requires_force() {
    let fx = fixture();
    fx.orch.create("web1", DOC).await.unwrap();
    assert!(fx.orch.lock("web1").unwrap().locked);

    let err = fx.orch.redefine("web1", DOC, None, false).await.unwrap_err();
    assert!(matches!(err, MulchError::Locked { .. }));
    let err = fx.orch.delete("web1", false, false).await.unwrap_err();
    assert!(matches!(err, MulchError::Locked { .. }));
    assert_eq!(fx.hv.domain_names(), vec!["web1-r1"]);

    let record = fx.orch.redefine("web1", DOC, None, true).await.unwrap();
    assert_eq!(record.revision, 2);
    assert!(record.locked);

    fx.orch.unlock("web1").unwrap();
    fx.orch.delete("web1", false, false).await.unwrap();
}

// ── concurrency and abort ──────────────────────────────────

#[tokio::test]
async fn second_operation_on_same_name_is_busy() {
    let fx = fixture();
    let gate = fx.exec.gate();

    let orch = Arc::clone(&fx.orch);
    let running = tokio::spawn(async move { orch.create("web1", DOC).await });
    gate.entered.notified().await;

    let status = fx.orch.status("web1").unwrap();
    assert_eq!(status.state, VmState::Building);
    assert_eq!(status.operation, Some(Operation::Create));
    assert!(status.record.is_none());

    let err = fx.orch.create("web1", DOC).await.unwrap_err();
    assert!(matches!(err, MulchError::Busy { ref operation, .. } if operation == "create"));
    let err = fx.orch.redefine("web1", DOC, None, true).await.unwrap_err();
    assert!(matches!(err, MulchError::Busy { .. }));
    let err = fx.orch.lock("web1").unwrap_err();
    assert!(matches!(err, MulchError::Busy { .. }));

    gate.release.notify_one();
    let record = running.await.unwrap().unwrap();
    assert_eq!(record.revision, 1);
    assert!(fx.orch.status("web1").unwrap().operation.is_none());
}

#[tokio::test]
async fn abort_rolls_back_in_flight_build() {
    let fx = fixture();
    let gate = fx.exec.gate();
    assert!(!fx.orch.abort("web1"));

    let orch = Arc::clone(&fx.orch);
    let running = tokio::spawn(async move { orch.create("web1", DOC).await });
    gate.entered.notified().await;
    assert!(fx.orch.abort("web1"));

    let (step, source) = build_failure(running.await.unwrap().unwrap_err());
    assert_eq!(step, "prepare script #0");
    assert!(matches!(source, MulchError::Aborted { .. }));
    fx.assert_no_vm_resources();
    assert!(!fx.orch.abort("web1"));
    assert!(fx.orch.list().is_empty());
}

// ── backup and restore ─────────────────────────────────────

#[tokio::test]
async fn backup_attaches_disk_and_records_volume() {
    let fx = fixture();
    fx.orch.create("web1", DOC).await.unwrap();

    let vol = fx.orch.backup("web1").await.unwrap();
    assert_eq!(vol.pool, paths::POOL_BACKUPS);
    assert!(vol.name.starts_with("web1-"));
    assert_eq!(fx.hv.volume_names(paths::POOL_BACKUPS), vec![vol.name.clone()]);
    assert_eq!(
        fx.hv.volume(paths::POOL_BACKUPS, &vol.name).unwrap().capacity,
        2 * GIB
    );

    let record = fx.orch.status("web1").unwrap().record.unwrap();
    assert_eq!(record.backups.len(), 1);
    assert_eq!(record.backups[0].volume, vol.name);
    assert_eq!(record.backups[0].revision, 1);

    let last = fx.exec.calls().pop().unwrap();
    assert!(last.payload.contains("export _BACKUP='/dev/vdb'\n"));
    assert!(last.payload.ends_with("echo backup\n"));

    let journal = fx.hv.journal();
    assert!(journal.contains(&"attach_device web1-r1".to_string()));
    assert!(journal.contains(&"detach_device web1-r1".to_string()));
    assert!(fx.hv.domain("web1-r1").unwrap().devices.is_empty());
}

#[tokio::test]
async fn failed_backup_deletes_its_volume() {
    let fx = fixture();
    fx.orch.create("web1", DOC).await.unwrap();
    fx.exec.fail_when("echo backup", 2);

    let (step, source) = build_failure(fx.orch.backup("web1").await.unwrap_err());
    assert_eq!(step, "backup script #0");
    assert!(matches!(source, MulchError::ScriptFailed { status: 2, .. }));
    assert!(fx.hv.volume_names(paths::POOL_BACKUPS).is_empty());
    assert!(fx.hv.domain("web1-r1").unwrap().devices.is_empty());
    assert!(fx.orch.status("web1").unwrap().record.unwrap().backups.is_empty());
    // primary disk untouched
    assert_eq!(fx.hv.volume_names(paths::POOL_DISKS), vec!["web1-r1.qcow2"]);
}

#[tokio::test]
async fn redefine_restores_named_backup() {
    let fx = fixture();
    fx.orch.create("web1", DOC).await.unwrap();
    let vol = fx.orch.backup("web1").await.unwrap();

    let doc = format!(
        "{DOC}restore_backup = \"{}\"\nrestore_prefix_url = \"https://scripts.test/restore/\"\nrestore = [\"app@load.sh\"]\n",
        vol.name
    );
    let record = fx.orch.redefine("web1", &doc, None, false).await.unwrap();
    assert_eq!(record.revision, 2);

    let last = fx.exec.calls().pop().unwrap();
    assert!(last.payload.ends_with("echo restore\n"));
    assert!(last.payload.contains("export _BACKUP='/dev/vdb'\n"));
    assert!(last.payload.contains("export _VM_REVISION='2'\n"));
    assert!(fx.hv.domain("web1-r2").unwrap().devices.is_empty());
}

#[tokio::test]
async fn restore_of_missing_backup_rolls_back() {
    let fx = fixture();
    fx.orch.create("web1", DOC).await.unwrap();
    let doc = format!("{DOC}restore_backup = \"web1-nope.qcow2\"\n");

    let (step, source) = build_failure(fx.orch.redefine("web1", &doc, None, false).await.unwrap_err());
    assert_eq!(step, "restore");
    assert!(matches!(source, MulchError::NotFound { .. }));
    assert_eq!(fx.hv.domain_names(), vec!["web1-r1"]);
}

#[tokio::test]
async fn export_streams_backup_content() {
    let fx = fixture();
    fx.hv.put_volume(paths::POOL_BACKUPS, "web1-manual.qcow2", b"backup bytes".to_vec());

    let mut out = Vec::new();
    let n = fx
        .orch
        .export_backup("web1-manual.qcow2", &mut out)
        .await
        .unwrap();
    assert_eq!(n, 12);
    assert_eq!(out, b"backup bytes");

    let err = fx
        .orch
        .export_backup("missing.qcow2", &mut Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MulchError::NotFound { .. }));
}

// ── delete ─────────────────────────────────────────────────

#[tokio::test]
async fn delete_removes_everything() {
    let fx = fixture();
    let record = fx.orch.create("web1", DOC).await.unwrap();
    fx.orch.backup("web1").await.unwrap();
    assert!(fx.orch.macs.in_use(&record.active.mac));

    fx.orch.delete("web1", false, false).await.unwrap();
    fx.assert_no_vm_resources();
    assert!(!fx.orch.macs.in_use(&record.active.mac));
    assert!(fx.hv.volume_names(paths::POOL_BACKUPS).is_empty());
    assert!(fx.store.get("web1").is_none());
    assert!(matches!(
        fx.orch.status("web1").unwrap_err(),
        MulchError::NotFound { .. }
    ));
    // seeds are shared and stay
    assert_eq!(fx.hv.volume_names(paths::POOL_SEEDS), vec!["debian-12.qcow2"]);
}

#[tokio::test]
async fn delete_can_keep_backups() {
    let fx = fixture();
    fx.orch.create("web1", DOC).await.unwrap();
    let vol = fx.orch.backup("web1").await.unwrap();

    fx.orch.delete("web1", false, true).await.unwrap();
    fx.assert_no_vm_resources();
    assert_eq!(fx.hv.volume_names(paths::POOL_BACKUPS), vec![vol.name]);
}

#[tokio::test]
async fn delete_failure_before_undefine_keeps_vm() {
    let fx = fixture();
    fx.orch.create("web1", DOC).await.unwrap();
    fx.hv.fail_on("shutdown_domain");

    let (step, _) = build_failure(fx.orch.delete("web1", false, false).await.unwrap_err());
    assert_eq!(step, "domain stop");
    let record = fx.orch.status("web1").unwrap().record.unwrap();
    assert_eq!(record.state, VmState::Active);
    assert_eq!(fx.hv.domain_names(), vec!["web1-r1"]);
}

// ── events and setup ───────────────────────────────────────

#[tokio::test]
async fn vm_subscription_follows_progress() {
    let fx = fixture();
    let mut web1 = fx.orch.subscribe_vm("web1");
    let mut other = fx.orch.subscribe_vm("db1");

    fx.orch.create("web1", DOC).await.unwrap();

    let mut events = Vec::new();
    while let Some(event) = web1.try_recv() {
        assert_eq!(event.vm, "web1");
        events.push(event);
    }
    let messages: Vec<&str> = events.iter().map(|e| e.message.as_str()).collect();
    assert!(messages.contains(&"building revision 1"));
    assert!(messages.contains(&"committed revision 1"));
    assert!(events.iter().any(|e| e.severity == Severity::Trace));
    assert!(!events.iter().any(|e| e.severity == Severity::Error));

    assert!(other.try_recv().is_none());
}

#[tokio::test]
async fn setup_ensures_pools_and_network() {
    let fx = fixture();
    fx.orch.setup().await.unwrap();
    assert!(fx.hv.has_network("mulch"));
    let journal = fx.hv.journal();
    for (pool, _, _) in paths::POOLS {
        assert!(journal.contains(&format!("ensure_pool {pool}")));
    }
}
