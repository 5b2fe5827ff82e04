//! Known VMs and the per-name operation guard.
//!
//! Records live in memory behind a `RwLock` for concurrent status reads and
//! are written through to a [`RecordStore`] before the in-memory copy
//! changes. Every mutation requires the [`OpGuard`] of the VM it touches, so
//! two operations on one name can never interleave writes.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use facet::Facet;
use tokio_util::sync::CancellationToken;

use crate::error::MulchError;
use crate::util::unix_now;
use crate::vm_config::VmConfig;
use crate::vm_state::VmState;

// ── records ──────────────────────────────────────────────

/// Hypervisor objects backing the committed revision.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct ActiveResources {
    pub domain: String,
    pub disk_volume: String,
    pub cloud_init_volume: String,
    pub mac: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct RetiredRevision {
    pub revision: u32,
    pub domain: String,
    pub retired_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct BackupRef {
    /// Volume name in the backups pool.
    pub volume: String,
    pub size: u64,
    pub revision: u32,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct VmRecord {
    pub name: String,
    pub revision: u32,
    /// User lock: redefine and delete need `force` while set.
    pub locked: bool,
    pub state: VmState,
    pub active: ActiveResources,
    pub config: VmConfig,
    pub history: Vec<RetiredRevision>,
    pub backups: Vec<BackupRef>,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── persistence ──────────────────────────────────────────

/// Durable storage for records, keyed by VM name.
pub trait RecordStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<VmRecord>, MulchError>;
    fn save(&self, record: &VmRecord) -> Result<(), MulchError>;
    fn remove(&self, name: &str) -> Result<(), MulchError>;
}

/// One JSON file per VM under `<data>/vms/`, replaced atomically.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn open(dir: &Path) -> Result<Self, MulchError> {
        fs::create_dir_all(dir).map_err(|e| MulchError::Io {
            context: format!("creating records directory {}", dir.display()),
            source: e,
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }
}

impl RecordStore for JsonFileStore {
    fn load_all(&self) -> Result<Vec<VmRecord>, MulchError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| MulchError::Io {
            context: format!("reading {}", self.dir.display()),
            source: e,
        })?;

        let mut records = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = fs::read_to_string(&path).map_err(|e| MulchError::Io {
                context: format!("reading {}", path.display()),
                source: e,
            })?;
            let record: VmRecord =
                facet_json::from_str(&text).map_err(|e| MulchError::Store {
                    name: path.display().to_string(),
                    message: e.to_string(),
                })?;
            records.push(record);
        }
        Ok(records)
    }

    fn save(&self, record: &VmRecord) -> Result<(), MulchError> {
        let json = facet_json::to_string(record).map_err(|e| MulchError::Store {
            name: record.name.clone(),
            message: e.to_string(),
        })?;
        let path = self.path(&record.name);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .and_then(|()| fs::rename(&tmp, &path))
            .map_err(|e| MulchError::Io {
                context: format!("writing {}", path.display()),
                source: e,
            })
    }

    fn remove(&self, name: &str) -> Result<(), MulchError> {
        let path = self.path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MulchError::Io {
                context: format!("removing {}", path.display()),
                source: e,
            }),
        }
    }
}

// ── operations in flight ─────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Redefine,
    Backup,
    Delete,
    Lock,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Redefine => "redefine",
            Operation::Backup => "backup",
            Operation::Delete => "delete",
            Operation::Lock => "lock",
        }
    }
}

struct InFlight {
    operation: Operation,
    cancel: CancellationToken,
}

/// Exclusive right to mutate one VM. Released on drop, on every exit path.
pub struct OpGuard {
    inner: Arc<RegistryInner>,
    name: String,
    operation: Operation,
    cancel: CancellationToken,
}

impl OpGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        self.inner
            .ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
        tracing::debug!(vm = %self.name, operation = self.operation.as_str(), "operation guard released");
    }
}

// ── registry ─────────────────────────────────────────────

struct RegistryInner {
    records: RwLock<BTreeMap<String, VmRecord>>,
    ops: Mutex<HashMap<String, InFlight>>,
    store: Box<dyn RecordStore>,
}

#[derive(Clone)]
pub struct VmRegistry {
    inner: Arc<RegistryInner>,
}

impl VmRegistry {
    /// Load every persisted record.
    pub fn open(store: Box<dyn RecordStore>) -> Result<Self, MulchError> {
        let records = store
            .load_all()?
            .into_iter()
            .map(|r| (r.name.clone(), r))
            .collect::<BTreeMap<_, _>>();
        tracing::debug!(count = records.len(), "VM records loaded");
        Ok(Self {
            inner: Arc::new(RegistryInner {
                records: RwLock::new(records),
                ops: Mutex::new(HashMap::new()),
                store,
            }),
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, VmRecord>> {
        self.inner
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, VmRecord>> {
        self.inner
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `name` for `operation`. Never waits: a second caller gets `Busy`.
    pub fn acquire(&self, name: &str, operation: Operation) -> Result<OpGuard, MulchError> {
        let mut ops = self
            .inner
            .ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = ops.get(name) {
            return Err(MulchError::Busy {
                name: name.to_string(),
                operation: current.operation.as_str().to_string(),
            });
        }
        let cancel = CancellationToken::new();
        ops.insert(
            name.to_string(),
            InFlight {
                operation,
                cancel: cancel.clone(),
            },
        );
        Ok(OpGuard {
            inner: Arc::clone(&self.inner),
            name: name.to_string(),
            operation,
            cancel,
        })
    }

    /// Signal the operation in flight on `name`. Returns false when idle.
    pub fn abort(&self, name: &str) -> bool {
        let ops = self
            .inner
            .ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match ops.get(name) {
            Some(op) => {
                op.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn operation_in_flight(&self, name: &str) -> Option<Operation> {
        self.inner
            .ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|op| op.operation)
    }

    pub fn get(&self, name: &str) -> Option<VmRecord> {
        self.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Snapshot of all records, sorted by name.
    pub fn list(&self) -> Vec<VmRecord> {
        self.read().values().cloned().collect()
    }

    fn check_guard(guard: &OpGuard, name: &str) -> Result<(), MulchError> {
        if guard.name != name {
            return Err(MulchError::Store {
                name: name.to_string(),
                message: format!("operation guard is held for '{}'", guard.name),
            });
        }
        Ok(())
    }

    /// Persist and publish a brand new record.
    pub fn insert(&self, guard: &OpGuard, record: VmRecord) -> Result<(), MulchError> {
        Self::check_guard(guard, &record.name)?;
        if self.contains(&record.name) {
            return Err(MulchError::AlreadyExists { name: record.name });
        }
        self.inner.store.save(&record)?;
        self.write().insert(record.name.clone(), record);
        Ok(())
    }

    /// Read-modify-write one record. The store is written first; on failure
    /// the in-memory record is left as it was.
    pub fn update<F>(&self, guard: &OpGuard, mutate: F) -> Result<VmRecord, MulchError>
    where
        F: FnOnce(&mut VmRecord),
    {
        let mut record = self.get(&guard.name).ok_or_else(|| MulchError::NotFound {
            name: guard.name.clone(),
        })?;
        mutate(&mut record);
        record.updated_at = unix_now();
        self.inner.store.save(&record)?;
        self.write().insert(record.name.clone(), record.clone());
        Ok(record)
    }

    pub fn remove(&self, guard: &OpGuard) -> Result<VmRecord, MulchError> {
        let record = self.get(&guard.name).ok_or_else(|| MulchError::NotFound {
            name: guard.name.clone(),
        })?;
        self.inner.store.remove(&guard.name)?;
        self.write().remove(&guard.name);
        Ok(record)
    }
}
