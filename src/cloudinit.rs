use facet_value::{VArray, Value, value};

use crate::error::MulchError;
use crate::iso9660::SeedImage;
use crate::util::shell_quote;
use crate::vm_config::VmConfig;

/// Network config v2 for the NoCloud datasource. No outer `network:` key,
/// the file is the network config itself.
const NETWORK_CONFIG: &str =
    "version: 2\nethernets:\n  id0:\n    match:\n      name: \"en*\"\n    dhcp4: true\n";

/// What the guest needs to know on first boot.
pub struct SeedParams<'a> {
    pub config: &'a VmConfig,
    pub revision: u32,
    /// Control account used by the orchestrator over SSH.
    pub control_user: &'a str,
    pub ssh_public_key: &'a str,
}

pub fn meta_data(params: &SeedParams<'_>) -> String {
    let instance = crate::paths::domain_name(&params.config.name, params.revision);
    format!(
        "instance-id: {instance}\nlocal-hostname: {}\n",
        params.config.hostname
    )
}

/// `/etc/environment` body: one `KEY="value"` line per env entry.
fn environment_file(config: &VmConfig) -> String {
    config
        .env
        .iter()
        .map(|(k, v)| format!("{k}={}\n", shell_quote(v)))
        .collect()
}

pub fn user_data(params: &SeedParams<'_>) -> Result<String, MulchError> {
    let config = params.config;

    let control = value!({
        "name": (params.control_user),
        "shell": "/bin/bash",
        "lock_passwd": true,
        "sudo": "ALL=(ALL) NOPASSWD:ALL",
        "ssh_authorized_keys": [(params.ssh_public_key.trim())],
    });
    let app = value!({
        "name": (config.app_user.as_str()),
        "shell": "/bin/bash",
        "lock_passwd": true,
    });

    let mut write_files = VArray::new();
    if !config.env.is_empty() {
        write_files.push(value!({
            "path": "/etc/environment",
            "append": true,
            "content": (environment_file(config).as_str()),
        }));
    }

    let doc = value!({
        "hostname": (config.hostname.as_str()),
        "fqdn": (config.hostname.as_str()),
        "timezone": (config.timezone.as_str()),
        "package_update": (config.init_upgrade),
        "package_upgrade": (config.init_upgrade),
        "users": (Value::from(VArray::from_iter([control, app]))),
        "write_files": (Value::from(write_files)),
    });

    let yaml = facet_yaml::to_string(&doc).map_err(|e| MulchError::Io {
        context: "serializing cloud-init user-data".into(),
        source: std::io::Error::other(e.to_string()),
    })?;
    // cloud-init wants #cloud-config as the very first line
    let yaml = yaml.strip_prefix("---\n").unwrap_or(&yaml);
    Ok(format!("#cloud-config\n{yaml}"))
}

/// Build the `CIDATA` seed image for one revision of a VM.
pub fn seed_iso(params: &SeedParams<'_>) -> Result<Vec<u8>, MulchError> {
    SeedImage::new("CIDATA")
        .file("meta-data", meta_data(params))
        .file("user-data", user_data(params)?)
        .file("network-config", NETWORK_CONFIG)
        .build()
}
