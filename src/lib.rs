#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod cli;
pub mod cloudinit;
pub mod config;
pub mod domain_xml;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod flow;
pub mod hub;
pub mod hypervisor;
pub mod iso9660;
pub mod logging;
pub mod orchestrator;
pub mod paths;
pub mod registry;
pub mod util;
pub mod vm_config;
pub mod vm_state;
pub mod volume;

#[cfg(test)]
pub(crate) mod testing;
