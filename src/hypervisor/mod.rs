//! Hypervisor seam.
//!
//! The orchestrator and the volume engine only see this trait. Calls are
//! synchronous (libvirt's C API blocks); long transfers run inside
//! `spawn_blocking`. Any error is final for the current operation attempt.

pub mod libvirt;
pub mod xml;

use std::path::PathBuf;

use crate::error::MulchError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub pool: String,
    pub name: String,
    /// Virtual capacity in bytes.
    pub capacity: u64,
    pub path: PathBuf,
}

/// Pull side of a volume download stream.
pub trait VolumeReader {
    /// Fill `buf`, returning 0 at end of volume.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, MulchError>;
    fn finish(self: Box<Self>) -> Result<(), MulchError>;
}

/// Push side of a volume upload stream.
pub trait VolumeWriter {
    fn send(&mut self, data: &[u8]) -> Result<(), MulchError>;
    fn finish(self: Box<Self>) -> Result<(), MulchError>;
}

pub trait Hypervisor: Send + Sync {
    /// Make sure a directory-backed storage pool exists and is running.
    fn ensure_pool(&self, name: &str, path: &std::path::Path, mode: &str)
    -> Result<(), MulchError>;

    /// Make sure the NAT network exists and is running.
    fn ensure_network(&self, name: &str, subnet: &str) -> Result<(), MulchError>;

    /// Target directory of a storage pool.
    fn pool_root(&self, pool: &str) -> Result<PathBuf, MulchError>;

    fn lookup_volume(&self, pool: &str, name: &str) -> Result<Option<VolumeInfo>, MulchError>;
    fn create_volume(&self, pool: &str, xml: &str) -> Result<VolumeInfo, MulchError>;
    fn delete_volume(&self, pool: &str, name: &str) -> Result<(), MulchError>;
    fn resize_volume(&self, pool: &str, name: &str, capacity: u64) -> Result<(), MulchError>;

    fn download(&self, pool: &str, name: &str) -> Result<Box<dyn VolumeReader>, MulchError>;
    fn upload(&self, pool: &str, name: &str) -> Result<Box<dyn VolumeWriter>, MulchError>;

    fn define_domain(&self, xml: &str) -> Result<(), MulchError>;
    fn start_domain(&self, name: &str) -> Result<(), MulchError>;
    /// ACPI shutdown request. Returns immediately.
    fn shutdown_domain(&self, name: &str) -> Result<(), MulchError>;
    /// Hard power-off.
    fn destroy_domain(&self, name: &str) -> Result<(), MulchError>;
    fn undefine_domain(&self, name: &str) -> Result<(), MulchError>;
    fn domain_exists(&self, name: &str) -> Result<bool, MulchError>;
    fn domain_is_active(&self, name: &str) -> Result<bool, MulchError>;
    /// First IPv4 address from the DHCP leases, if the guest has one yet.
    fn domain_address(&self, name: &str) -> Result<Option<String>, MulchError>;

    fn attach_device(&self, domain: &str, xml: &str) -> Result<(), MulchError>;
    fn detach_device(&self, domain: &str, xml: &str) -> Result<(), MulchError>;
}
