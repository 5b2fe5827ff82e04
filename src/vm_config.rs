//! VM description compiler.
//!
//! Turns an untrusted TOML document into an immutable [`VmConfig`]. Fields
//! are checked in a fixed order and the first violation is reported with
//! the offending field. Lifecycle scripts are probed through a
//! [`ScriptFetcher`]: the compiler confirms each one is reachable and starts
//! with a shebang, nothing more.

use std::collections::BTreeMap;

use facet::Facet;
use tokio::io::AsyncReadExt;

use crate::error::MulchError;
use crate::fetch::ScriptFetcher;
use crate::util::{self, MIB, is_shell_identifier, is_valid_token};

const MIN_DISK_SIZE: u64 = MIB;
const MIN_RAM_SIZE: u64 = MIB;
const MIN_BACKUP_DISK_SIZE: u64 = 32 * MIB;
const DEFAULT_DOMAIN_PORT: u16 = 80;

// ── raw document ──────────────────────────────────────────

#[derive(Debug, Clone, Facet)]
struct RawVmConfig {
    name: String,
    #[facet(default = "localhost.localdomain")]
    hostname: String,
    #[facet(default = "Europe/Paris")]
    timezone: String,
    #[facet(default = "app")]
    app_user: String,
    seed: String,
    #[facet(default = true)]
    init_upgrade: bool,
    disk_size: String,
    ram_size: String,
    #[facet(default = 1)]
    cpu_count: i64,

    #[facet(default)]
    domains: Vec<String>,
    #[facet(default = true)]
    redirect_to_https: bool,
    #[facet(default)]
    redirects: Vec<Vec<String>>,

    #[facet(default)]
    env: Vec<Vec<String>>,

    #[facet(default = "2GB")]
    backup_disk_size: String,
    #[facet(default)]
    restore_backup: String,

    #[facet(default)]
    prepare_prefix_url: String,
    #[facet(default)]
    prepare: Vec<String>,
    #[facet(default)]
    backup_prefix_url: String,
    #[facet(default)]
    backup: Vec<String>,
    #[facet(default)]
    restore_prefix_url: String,
    #[facet(default)]
    restore: Vec<String>,
}

// ── compiled config ───────────────────────────────────────

/// A hostname routed to the VM by the reverse proxy.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct DomainBinding {
    pub name: String,
    pub vm_name: String,
    /// Destination port inside the VM. `None` for redirects.
    pub port: Option<u16>,
    pub redirect_to_https: bool,
    /// Set for redirect entries: the binding this hostname redirects to.
    pub redirect_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct VmScript {
    pub url: String,
    pub run_as: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptCategory {
    Prepare,
    Backup,
    Restore,
}

impl ScriptCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ScriptCategory::Prepare => "prepare",
            ScriptCategory::Backup => "backup",
            ScriptCategory::Restore => "restore",
        }
    }
}

impl std::fmt::Display for ScriptCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct VmConfig {
    /// The document this config was compiled from.
    pub file_content: String,

    pub name: String,
    pub hostname: String,
    pub timezone: String,
    pub app_user: String,
    pub seed: String,
    pub init_upgrade: bool,
    pub disk_size: u64,
    pub ram_size: u64,
    pub cpu_count: u32,

    pub domains: Vec<DomainBinding>,
    pub env: BTreeMap<String, String>,

    pub backup_disk_size: u64,
    pub restore_backup: Option<String>,

    pub prepare: Vec<VmScript>,
    pub backup: Vec<VmScript>,
    pub restore: Vec<VmScript>,
}

impl VmConfig {
    pub fn scripts(&self, category: ScriptCategory) -> &[VmScript] {
        match category {
            ScriptCategory::Prepare => &self.prepare,
            ScriptCategory::Backup => &self.backup,
            ScriptCategory::Restore => &self.restore,
        }
    }

    /// Hostnames served directly by the VM (redirects excluded).
    pub fn bound_domains(&self) -> impl Iterator<Item = &DomainBinding> {
        self.domains.iter().filter(|d| d.redirect_to.is_none())
    }
}

// ── compiler ──────────────────────────────────────────────

/// Compile a VM description. Deterministic for identical input and
/// identical fetch responses.
pub async fn compile(text: &str, fetcher: &dyn ScriptFetcher) -> Result<VmConfig, MulchError> {
    let raw: RawVmConfig = facet_toml::from_str(text).map_err(|e| MulchError::ConfigParse {
        path: "VM config".into(),
        message: e.to_string(),
    })?;

    if !is_valid_token(&raw.name) {
        return Err(MulchError::validation(
            "name",
            format!("invalid VM name '{}'", raw.name),
        ));
    }
    if raw.app_user.is_empty() {
        return Err(MulchError::validation("app_user", "invalid app_user name"));
    }
    if !is_valid_token(&raw.app_user) {
        return Err(MulchError::validation(
            "app_user",
            format!("invalid app_user name '{}'", raw.app_user),
        ));
    }
    if !is_valid_token(&raw.seed) {
        return Err(MulchError::validation(
            "seed",
            format!("invalid seed image '{}'", raw.seed),
        ));
    }

    let disk_size = util::parse_size("disk_size", &raw.disk_size)?;
    if disk_size < MIN_DISK_SIZE {
        return Err(MulchError::validation(
            "disk_size",
            format!("looks like a too small disk ({})", raw.disk_size),
        ));
    }

    let ram_size = util::parse_size("ram_size", &raw.ram_size)?;
    if ram_size < MIN_RAM_SIZE {
        return Err(MulchError::validation(
            "ram_size",
            format!("looks like a too small RAM amount ({})", raw.ram_size),
        ));
    }

    if raw.cpu_count < 1 {
        return Err(MulchError::validation("cpu_count", "need at least one CPU"));
    }
    let cpu_count = u32::try_from(raw.cpu_count)
        .map_err(|_| MulchError::validation("cpu_count", "CPU count out of range"))?;

    let backup_disk_size = util::parse_size("backup_disk_size", &raw.backup_disk_size)?;
    if backup_disk_size < MIN_BACKUP_DISK_SIZE {
        return Err(MulchError::validation(
            "backup_disk_size",
            format!("looks like a too small backup disk ({})", raw.backup_disk_size),
        ));
    }

    let domains = compile_domains(&raw)?;
    if domains.is_empty() {
        tracing::warn!(vm = %raw.name, "no domain defined for this VM");
    }

    let env = compile_env(&raw.env)?;

    let restore_backup = if raw.restore_backup.is_empty() {
        None
    } else if is_valid_token(&raw.restore_backup) {
        Some(raw.restore_backup.clone())
    } else {
        return Err(MulchError::validation(
            "restore_backup",
            format!("invalid backup name '{}'", raw.restore_backup),
        ));
    };

    let prepare = check_scripts(
        ScriptCategory::Prepare,
        &raw.prepare_prefix_url,
        &raw.prepare,
        fetcher,
    )
    .await?;
    let backup =
        check_scripts(ScriptCategory::Backup, &raw.backup_prefix_url, &raw.backup, fetcher)
            .await?;
    let restore = check_scripts(
        ScriptCategory::Restore,
        &raw.restore_prefix_url,
        &raw.restore,
        fetcher,
    )
    .await?;

    Ok(VmConfig {
        file_content: text.to_string(),
        name: raw.name,
        hostname: raw.hostname,
        timezone: raw.timezone,
        app_user: raw.app_user,
        seed: raw.seed,
        init_upgrade: raw.init_upgrade,
        disk_size,
        ram_size,
        cpu_count,
        domains,
        env,
        backup_disk_size,
        restore_backup,
        prepare,
        backup,
        restore,
    })
}

/// Bindings first, in declaration order, then redirects.
fn compile_domains(raw: &RawVmConfig) -> Result<Vec<DomainBinding>, MulchError> {
    let mut domains = Vec::with_capacity(raw.domains.len() + raw.redirects.len());

    for entry in &raw.domains {
        let parts: Vec<&str> = entry.split("->").collect();
        if parts.len() > 2 {
            return Err(MulchError::validation(
                "domains",
                format!("invalid domain string '{entry}'"),
            ));
        }
        let name = parts[0].trim().to_lowercase();
        if name.is_empty() {
            return Err(MulchError::validation(
                "domains",
                format!("invalid domain string '{entry}'"),
            ));
        }
        let port = match parts.get(1) {
            None => DEFAULT_DOMAIN_PORT,
            Some(p) => match p.trim().parse::<u16>() {
                Ok(port) if port > 0 => port,
                _ => {
                    return Err(MulchError::validation(
                        "domains",
                        format!("invalid port number '{}' in '{entry}'", p.trim()),
                    ));
                }
            },
        };
        domains.push(DomainBinding {
            name,
            vm_name: raw.name.clone(),
            port: Some(port),
            redirect_to_https: raw.redirect_to_https,
            redirect_to: None,
        });
    }

    let bound: Vec<String> = domains.iter().map(|d| d.name.clone()).collect();
    for pair in &raw.redirects {
        if pair.len() != 2 {
            return Err(MulchError::validation(
                "redirects",
                format!("invalid redirect {pair:?}, expected [from, to]"),
            ));
        }
        let from = pair[0].trim().to_lowercase();
        let to = pair[1].trim().to_lowercase();
        if !bound.contains(&to) {
            return Err(MulchError::validation(
                "redirects",
                format!("redirect '{from}' -> '{to}': '{to}' is not one of the VM's domains"),
            ));
        }
        domains.push(DomainBinding {
            name: from,
            vm_name: raw.name.clone(),
            port: None,
            redirect_to_https: false,
            redirect_to: Some(to),
        });
    }

    for (i, domain) in domains.iter().enumerate() {
        if domains[..i].iter().any(|d| d.name == domain.name) {
            return Err(MulchError::validation(
                "domains",
                format!("domain '{}' is duplicated in this VM", domain.name),
            ));
        }
    }

    Ok(domains)
}

fn compile_env(lines: &[Vec<String>]) -> Result<BTreeMap<String, String>, MulchError> {
    let mut env = BTreeMap::new();
    for line in lines {
        let [key, value] = line.as_slice() else {
            return Err(MulchError::validation(
                "env",
                format!("invalid env line {line:?}, expected [key, value]"),
            ));
        };
        if !is_shell_identifier(key) {
            return Err(MulchError::validation(
                "env",
                format!("invalid 'env' name '{key}', expected a shell variable name"),
            ));
        }
        if env.insert(key.clone(), value.clone()).is_some() {
            return Err(MulchError::validation(
                "env",
                format!("duplicated 'env' name '{key}'"),
            ));
        }
    }
    Ok(env)
}

async fn check_scripts(
    category: ScriptCategory,
    prefix: &str,
    entries: &[String],
    fetcher: &dyn ScriptFetcher,
) -> Result<Vec<VmScript>, MulchError> {
    let mut scripts = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some((run_as, relative)) = entry.split_once('@') else {
            return Err(MulchError::validation(
                category.as_str(),
                format!("invalid script entry '{entry}', expected user@url"),
            ));
        };
        if !is_valid_token(run_as) {
            return Err(MulchError::validation(
                category.as_str(),
                format!("invalid user '{run_as}' in '{entry}'"),
            ));
        }
        let url = format!("{prefix}{relative}");
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(MulchError::Script {
                url,
                message: "only http:// and https:// scripts are allowed".into(),
            });
        }
        check_shebang(&url, fetcher).await?;
        scripts.push(VmScript {
            url,
            run_as: run_as.to_string(),
        });
    }
    Ok(scripts)
}

/// Read just the first two bytes of the document and require `#!`.
async fn check_shebang(url: &str, fetcher: &dyn ScriptFetcher) -> Result<(), MulchError> {
    let mut stream = fetcher.open(url).await.map_err(|e| MulchError::Script {
        url: url.to_string(),
        message: format!("unable to get script: {e}"),
    })?;

    let mut signature = [0u8; 2];
    stream
        .read_exact(&mut signature)
        .await
        .map_err(|e| MulchError::Script {
            url: url.to_string(),
            message: format!("error reading script: {e}"),
        })?;

    if &signature != b"#!" {
        return Err(MulchError::Script {
            url: url.to_string(),
            message: "no shebang found, is it really a shell script?".into(),
        });
    }
    Ok(())
}
