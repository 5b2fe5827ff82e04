//! Daemon configuration (`mulchd.toml`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use facet::Facet;

use crate::error::MulchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Clone and upload volumes through libvirt storage streams.
    Libvirt,
    /// Copy image files directly between pool directories.
    Direct,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct AppConfig {
    #[facet(default = "qemu:///system")]
    pub libvirt_uri: String,
    #[facet(default = "./var/storage")]
    pub storage_path: String,
    #[facet(default = "./var/data")]
    pub data_path: String,
    /// `libvirt` or `direct`.
    #[facet(default = "libvirt")]
    pub storage_mode: String,
    #[facet(default = "mulch")]
    pub network: String,
    /// First three octets of the /24 used by the VM network.
    #[facet(default = "10.104.0")]
    pub network_subnet: String,
    #[facet(default = "mulch")]
    pub ssh_user: String,
    #[facet(default)]
    pub ssh_private_key: String,
    #[facet(default)]
    pub ssh_public_key: String,
    #[facet(default = 120)]
    pub ip_wait_timeout_s: u64,
    #[facet(default = 300)]
    pub ssh_connect_timeout_s: u64,
    /// Zero disables the per-script timeout.
    #[facet(default)]
    pub script_timeout_s: u64,
    #[facet(default = 30)]
    pub fetch_timeout_s: u64,
    #[facet(default = 10)]
    pub keep_script_logs: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            libvirt_uri: "qemu:///system".into(),
            storage_path: "./var/storage".into(),
            data_path: "./var/data".into(),
            storage_mode: "libvirt".into(),
            network: "mulch".into(),
            network_subnet: "10.104.0".into(),
            ssh_user: "mulch".into(),
            ssh_private_key: String::new(),
            ssh_public_key: String::new(),
            ip_wait_timeout_s: 120,
            ssh_connect_timeout_s: 300,
            script_timeout_s: 0,
            fetch_timeout_s: 30,
            keep_script_logs: 10,
        }
    }
}

impl AppConfig {
    pub fn storage_mode(&self) -> StorageMode {
        match self.storage_mode.as_str() {
            "direct" => StorageMode::Direct,
            _ => StorageMode::Libvirt,
        }
    }

    pub fn storage_root(&self) -> PathBuf {
        PathBuf::from(&self.storage_path)
    }

    pub fn data_root(&self) -> PathBuf {
        PathBuf::from(&self.data_path)
    }

    pub fn ssh_private_key_path(&self) -> PathBuf {
        if self.ssh_private_key.is_empty() {
            self.data_root().join("ssh").join("id_mulch")
        } else {
            PathBuf::from(&self.ssh_private_key)
        }
    }

    pub fn ssh_public_key_path(&self) -> PathBuf {
        if self.ssh_public_key.is_empty() {
            self.data_root().join("ssh").join("id_mulch.pub")
        } else {
            PathBuf::from(&self.ssh_public_key)
        }
    }

    pub fn script_timeout(&self) -> Option<Duration> {
        (self.script_timeout_s > 0).then(|| Duration::from_secs(self.script_timeout_s))
    }

    /// Log a warning for each SSH key file that is missing. VM control
    /// fails later without them, but the daemon can still start.
    pub fn check_ssh_keys(&self) {
        let private = self.ssh_private_key_path();
        if !private.exists() {
            tracing::warn!(
                path = %private.display(),
                "SSH private key not found, VMs cannot be controlled"
            );
        }
        let public = self.ssh_public_key_path();
        if !public.exists() {
            tracing::warn!(
                path = %public.display(),
                "SSH public key not found, VM creation will fail"
            );
        }
    }

    /// The control public key in OpenSSH format, or an empty string when
    /// the file does not exist.
    pub fn control_public_key(&self) -> Result<String, MulchError> {
        let path = self.ssh_public_key_path();
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => {
                return Err(MulchError::Io {
                    context: format!("reading SSH public key {}", path.display()),
                    source: e,
                });
            }
        };
        let invalid = |e: ssh_key::Error| {
            MulchError::validation("ssh_public_key", format!("{}: {e}", path.display()))
        };
        ssh_key::PublicKey::from_openssh(text.trim())
            .map_err(invalid)?
            .to_openssh()
            .map_err(invalid)
    }
}

fn validate_app_config(config: &AppConfig) -> Result<(), MulchError> {
    if config.libvirt_uri.is_empty() {
        return Err(MulchError::validation("libvirt_uri", "must not be empty"));
    }
    if config.storage_path.is_empty() {
        return Err(MulchError::validation("storage_path", "must not be empty"));
    }
    if config.data_path.is_empty() {
        return Err(MulchError::validation("data_path", "must not be empty"));
    }
    if !matches!(config.storage_mode.as_str(), "libvirt" | "direct") {
        return Err(MulchError::validation(
            "storage_mode",
            format!("expected 'libvirt' or 'direct' (got '{}')", config.storage_mode),
        ));
    }
    if !crate::util::is_valid_token(&config.network) {
        return Err(MulchError::validation(
            "network",
            format!("invalid network name '{}'", config.network),
        ));
    }
    let octets: Vec<&str> = config.network_subnet.split('.').collect();
    if octets.len() != 3 || octets.iter().any(|o| o.parse::<u8>().is_err()) {
        return Err(MulchError::validation(
            "network_subnet",
            format!("expected three octets like 10.104.0 (got '{}')", config.network_subnet),
        ));
    }
    if !crate::util::is_valid_token(&config.ssh_user) {
        return Err(MulchError::validation(
            "ssh_user",
            format!("invalid user name '{}'", config.ssh_user),
        ));
    }
    if config.ip_wait_timeout_s == 0 {
        return Err(MulchError::validation("ip_wait_timeout_s", "must be at least 1"));
    }
    Ok(())
}

pub fn parse_app_config(contents: &str, origin: &str) -> Result<AppConfig, MulchError> {
    let config: AppConfig =
        facet_toml::from_str(contents).map_err(|e| MulchError::ConfigParse {
            path: origin.to_string(),
            message: e.to_string(),
        })?;
    validate_app_config(&config)?;
    Ok(config)
}

pub fn load_app_config(path: &Path) -> Result<AppConfig, MulchError> {
    let contents = std::fs::read_to_string(path).map_err(|source| MulchError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;
    parse_app_config(&contents, &path.display().to_string())
}
