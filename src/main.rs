use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use mulch::cli::{Cli, Command, VmCommand};
use mulch::config::{self, AppConfig, StorageMode};
use mulch::error::MulchError;
use mulch::executor::SshExecutor;
use mulch::fetch::HttpFetcher;
use mulch::hub::Hub;
use mulch::hypervisor::libvirt::LibvirtHypervisor;
use mulch::logging;
use mulch::orchestrator::{Collaborators, Orchestrator, VmStatus};
use mulch::paths;
use mulch::registry::{JsonFileStore, VmRecord};
use mulch::util::format_size;
use mulch::vm_config::{self, VmConfig};
use mulch::volume::VolumeEngine;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let hub = Hub::new();
    let file_handle = logging::init_tracing(cli.verbose, &hub);

    let app_config = config::load_app_config(&cli.config)?;

    match cli.command {
        // Compiling a description needs neither libvirt nor the registry
        Command::Check { file } => {
            let text = read_document(&file)?;
            let fetcher = HttpFetcher::new(Duration::from_secs(app_config.fetch_timeout_s))?;
            let vm = vm_config::compile(&text, &fetcher).await?;
            print_config(&vm);
        }
        Command::Vm(command) => {
            file_handle
                .set_file(&app_config.data_root().join("mulchd.log"))
                .ok();
            app_config.check_ssh_keys();
            let orchestrator = Arc::new(open_orchestrator(app_config, hub).await?);
            run(&orchestrator, command).await?;
        }
    }
    Ok(())
}

async fn run(orchestrator: &Arc<Orchestrator>, command: VmCommand) -> Result<(), MulchError> {
    match command {
        VmCommand::Create { name, file } => {
            let text = read_document(&file)?;
            let record = with_abort(orchestrator, &name, orchestrator.create(&name, &text)).await?;
            println!("{} created (revision {})", record.name, record.revision);
        }
        VmCommand::Redefine {
            name,
            file,
            revision,
            force,
        } => {
            let text = read_document(&file)?;
            let record = with_abort(
                orchestrator,
                &name,
                orchestrator.redefine(&name, &text, revision, force),
            )
            .await?;
            println!("{} now at revision {}", record.name, record.revision);
        }
        VmCommand::Backup { name } => {
            let vol = with_abort(orchestrator, &name, orchestrator.backup(&name)).await?;
            println!("{}", vol.name);
        }
        VmCommand::Delete {
            name,
            force,
            keep_backups,
        } => {
            orchestrator.delete(&name, force, keep_backups).await?;
            println!("{name} deleted");
        }
        VmCommand::Status { name: Some(name) } => {
            print_status(&orchestrator.status(&name)?);
        }
        VmCommand::Status { name: None } => {
            let records = orchestrator.list();
            if records.is_empty() {
                println!("no VMs");
            }
            for record in &records {
                print_record_line(record);
            }
        }
        VmCommand::Lock { name } => {
            orchestrator.lock(&name)?;
            println!("{name} locked");
        }
        VmCommand::Unlock { name } => {
            orchestrator.unlock(&name)?;
            println!("{name} unlocked");
        }
        VmCommand::ExportBackup { volume, out } => {
            let mut file = tokio::fs::File::create(&out)
                .await
                .map_err(|source| MulchError::Io {
                    context: format!("failed to create {}", out.display()),
                    source,
                })?;
            let bytes = orchestrator.export_backup(&volume, &mut file).await?;
            println!("{volume}: {} written to {}", format_size(bytes), out.display());
        }
    }

    Ok(())
}

async fn open_orchestrator(app_config: AppConfig, hub: Hub) -> Result<Orchestrator, MulchError> {
    let uri = app_config.libvirt_uri.clone();
    let hypervisor = Arc::new(
        tokio::task::spawn_blocking(move || LibvirtHypervisor::connect(&uri))
            .await
            .map_err(|e| MulchError::Join {
                message: e.to_string(),
            })??,
    );

    let volumes = match app_config.storage_mode() {
        StorageMode::Libvirt => VolumeEngine::delegated(hypervisor.clone()),
        StorageMode::Direct => VolumeEngine::direct(app_config.storage_root()),
    };
    let fetcher = Arc::new(HttpFetcher::new(Duration::from_secs(
        app_config.fetch_timeout_s,
    ))?);
    let executor = Arc::new(SshExecutor::new(
        app_config.ssh_user.clone(),
        app_config.ssh_private_key_path(),
        Duration::from_secs(app_config.ssh_connect_timeout_s),
        app_config.script_timeout(),
    ));
    let store = Box::new(JsonFileStore::open(&paths::records_dir(
        &app_config.data_root(),
    ))?);

    let orchestrator = Orchestrator::open(
        app_config,
        hub,
        Collaborators {
            hypervisor,
            volumes,
            fetcher,
            executor,
            store,
        },
    )?;
    orchestrator.setup().await?;
    Ok(orchestrator)
}

/// Run a long operation, turning Ctrl+C into an abort request for `name`.
/// The operation still runs to completion so it can roll back.
async fn with_abort<T>(
    orchestrator: &Arc<Orchestrator>,
    name: &str,
    operation: impl Future<Output = Result<T, MulchError>>,
) -> Result<T, MulchError> {
    let watcher = {
        let orchestrator = Arc::clone(orchestrator);
        let name = name.to_string();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("interrupt received, rolling back {name}...");
                orchestrator.abort(&name);
            }
        })
    };
    let result = operation.await;
    watcher.abort();
    result
}

fn read_document(path: &Path) -> Result<String, MulchError> {
    std::fs::read_to_string(path).map_err(|source| MulchError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })
}

fn print_config(vm: &VmConfig) {
    println!("name:        {}", vm.name);
    println!("seed:        {}", vm.seed);
    println!("hostname:    {}", vm.hostname);
    println!("cpus:        {}", vm.cpu_count);
    println!("ram:         {}", format_size(vm.ram_size));
    println!("disk:        {}", format_size(vm.disk_size));
    println!("backup disk: {}", format_size(vm.backup_disk_size));
    for domain in &vm.domains {
        match (&domain.redirect_to, domain.port) {
            (Some(to), _) => println!("domain:      {} -> {to}", domain.name),
            (None, Some(port)) => println!("domain:      {} (port {port})", domain.name),
            (None, None) => println!("domain:      {}", domain.name),
        }
    }
    println!(
        "scripts:     {} prepare, {} backup, {} restore",
        vm.prepare.len(),
        vm.backup.len(),
        vm.restore.len()
    );
}

fn print_status(status: &VmStatus) {
    let operation = status.operation.map(|op| op.as_str()).unwrap_or("-");
    println!("name:      {}", status.name);
    println!("state:     {}", status.state);
    println!("operation: {operation}");
    if let Some(record) = &status.record {
        println!("revision:  {}", record.revision);
        println!("locked:    {}", record.locked);
        println!("domain:    {}", record.active.domain);
        println!("mac:       {}", record.active.mac);
        for backup in &record.backups {
            println!(
                "backup:    {} ({}, revision {})",
                backup.volume,
                format_size(backup.size),
                backup.revision
            );
        }
    }
}

fn print_record_line(record: &VmRecord) {
    let lock = if record.locked { " (locked)" } else { "" };
    println!(
        "{:<20} r{:<4} {}{lock}",
        record.name, record.revision, record.state
    );
}
