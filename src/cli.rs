use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "mulchd", about = "Build and lifecycle orchestrator for libvirt VMs")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "mulchd.toml")]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compile a VM description and print the result, without building anything
    Check {
        /// VM description (TOML)
        file: PathBuf,
    },

    #[command(flatten)]
    Vm(VmCommand),
}

/// Commands that drive the orchestrator.
#[derive(Subcommand, Debug)]
pub enum VmCommand {
    /// Build and start a new VM
    Create {
        /// VM name, must match the description
        name: String,
        /// VM description (TOML)
        file: PathBuf,
    },

    /// Rebuild a VM from a new description and swap it in once it is ready
    Redefine {
        name: String,
        /// VM description (TOML)
        file: PathBuf,

        /// Revision to build (defaults to current + 1)
        #[arg(long)]
        revision: Option<u32>,

        /// Ignore the VM lock
        #[arg(long)]
        force: bool,
    },

    /// Run the backup scripts against a fresh backup disk
    Backup { name: String },

    /// Stop the VM and delete it with its volumes
    Delete {
        name: String,

        /// Ignore the VM lock
        #[arg(long)]
        force: bool,

        /// Leave backup volumes in place
        #[arg(long)]
        keep_backups: bool,
    },

    /// Show one VM, or list all of them
    Status { name: Option<String> },

    /// Protect a VM against redefine and delete
    Lock { name: String },

    /// Remove the protection set by `lock`
    Unlock { name: String },

    /// Copy a backup volume to a local file
    ExportBackup {
        /// Backup volume name
        volume: String,
        /// Destination file
        out: PathBuf,
    },
}
