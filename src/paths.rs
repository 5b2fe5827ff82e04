//! Storage pool names, per-revision resource names and data directories.

use std::path::{Path, PathBuf};

pub const POOL_SEEDS: &str = "mulch-seeds";
pub const POOL_DISKS: &str = "mulch-disks";
pub const POOL_CLOUD_INIT: &str = "mulch-cloud-init";
pub const POOL_BACKUPS: &str = "mulch-backups";

/// Every pool with its directory under the storage root and its permissions.
pub const POOLS: [(&str, &str, &str); 4] = [
    (POOL_SEEDS, "seeds", "0755"),
    (POOL_DISKS, "disks", "0711"),
    (POOL_CLOUD_INIT, "cloud-init", "0755"),
    (POOL_BACKUPS, "backups", "0755"),
];

/// Directory backing a pool: `<storage>/<subdir>`.
pub fn pool_dir(storage_root: &Path, pool: &str) -> PathBuf {
    let subdir = POOLS
        .iter()
        .find(|(name, _, _)| *name == pool)
        .map(|(_, dir, _)| *dir)
        .unwrap_or(pool);
    storage_root.join(subdir)
}

/// Libvirt domain name of one revision: `web1-r2`.
pub fn domain_name(vm: &str, revision: u32) -> String {
    format!("{vm}-r{revision}")
}

pub fn disk_volume(vm: &str, revision: u32) -> String {
    format!("{vm}-r{revision}.qcow2")
}

pub fn cloud_init_volume(vm: &str, revision: u32) -> String {
    format!("{vm}-r{revision}-cloud-init.iso")
}

pub fn seed_volume(seed: &str) -> String {
    format!("{seed}.qcow2")
}

pub fn backup_volume(vm: &str, timestamp: &str) -> String {
    format!("{vm}-{timestamp}.qcow2")
}

/// Persisted VM records: `<data>/vms/`.
pub fn records_dir(data_root: &Path) -> PathBuf {
    data_root.join("vms")
}

/// Lifecycle script logs for one VM: `<data>/logs/<vm>/`.
pub fn logs_dir(data_root: &Path, vm: &str) -> PathBuf {
    data_root.join("logs").join(vm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_resources_are_distinct() {
        assert_eq!(domain_name("web1", 2), "web1-r2");
        assert_eq!(disk_volume("web1", 2), "web1-r2.qcow2");
        assert_eq!(cloud_init_volume("web1", 2), "web1-r2-cloud-init.iso");
        assert_ne!(disk_volume("web1", 1), disk_volume("web1", 2));
    }

    #[test]
    fn pool_dirs_live_under_storage_root() {
        let root = Path::new("/srv/storage");
        assert_eq!(pool_dir(root, POOL_DISKS), PathBuf::from("/srv/storage/disks"));
        assert_eq!(
            pool_dir(root, POOL_CLOUD_INIT),
            PathBuf::from("/srv/storage/cloud-init")
        );
        assert_eq!(pool_dir(root, "custom"), PathBuf::from("/srv/storage/custom"));
    }

    #[test]
    fn data_dirs() {
        let root = Path::new("/var/mulch");
        assert_eq!(records_dir(root), PathBuf::from("/var/mulch/vms"));
        assert_eq!(logs_dir(root, "web1"), PathBuf::from("/var/mulch/logs/web1"));
    }
}
