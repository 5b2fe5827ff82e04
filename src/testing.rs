//! In-memory collaborators for unit tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::MulchError;
use crate::executor::RemoteExecutor;
use crate::fetch::{ByteStream, ScriptFetcher};
use crate::hypervisor::{Hypervisor, VolumeInfo, VolumeReader, VolumeWriter, xml};
use crate::paths;
use crate::registry::{RecordStore, VmRecord};

// ── fetcher ────────────────────────────────────────────────

#[derive(Default, Clone)]
pub struct StaticFetcher {
    documents: HashMap<String, Vec<u8>>,
}

impl StaticFetcher {
    pub fn with(mut self, url: &str, body: impl Into<Vec<u8>>) -> Self {
        self.documents.insert(url.to_string(), body.into());
        self
    }
}

#[async_trait]
impl ScriptFetcher for StaticFetcher {
    async fn open(&self, url: &str) -> Result<ByteStream, MulchError> {
        match self.documents.get(url) {
            Some(body) => Ok(Box::pin(std::io::Cursor::new(body.clone()))),
            None => Err(MulchError::Fetch {
                url: url.to_string(),
                message: "404 Not Found".into(),
            }),
        }
    }
}

// ── hypervisor ─────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemVolume {
    pub capacity: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct MemDomain {
    pub xml: String,
    pub active: bool,
    pub devices: Vec<String>,
    pub address: Option<String>,
}

#[derive(Default)]
struct MemState {
    pools: BTreeMap<String, PathBuf>,
    networks: BTreeSet<String>,
    volumes: BTreeMap<(String, String), MemVolume>,
    domains: BTreeMap<String, MemDomain>,
    failures: HashSet<String>,
    /// `(trigger, op)`: `op` starts failing once `trigger` has been called.
    armed: Vec<(String, String)>,
    journal: Vec<String>,
    next_host: u8,
}

impl MemState {
    /// `op` fails for every target, `op:target` for one.
    fn check(&mut self, op: &str, target: &str) -> Result<(), MulchError> {
        self.journal.push(format!("{op} {target}"));
        let fired: Vec<String> = self
            .armed
            .iter()
            .filter(|(trigger, _)| trigger == op)
            .map(|(_, later)| later.clone())
            .collect();
        self.failures.extend(fired);
        self.injected(op, target)
    }

    /// Failure injection without a journal entry, for read-only calls.
    fn injected(&self, op: &str, target: &str) -> Result<(), MulchError> {
        if self.failures.contains(op) || self.failures.contains(&format!("{op}:{target}")) {
            return Err(MulchError::Libvirt {
                message: format!("injected failure: {op} {target}"),
                hint: String::new(),
            });
        }
        Ok(())
    }

    fn pool_path(&self, pool: &str) -> Result<&PathBuf, MulchError> {
        self.pools.get(pool).ok_or_else(|| MulchError::Libvirt {
            message: format!("storage pool '{pool}' not found"),
            hint: String::new(),
        })
    }

    fn info(&self, pool: &str, name: &str) -> Option<VolumeInfo> {
        let vol = self.volumes.get(&(pool.to_string(), name.to_string()))?;
        let root = self.pools.get(pool)?;
        Some(VolumeInfo {
            pool: pool.into(),
            name: name.into(),
            capacity: vol.capacity,
            path: root.join(name),
        })
    }

    fn domain_mut(&mut self, name: &str) -> Result<&mut MemDomain, MulchError> {
        self.domains.get_mut(name).ok_or_else(|| MulchError::Libvirt {
            message: format!("domain '{name}' not found"),
            hint: String::new(),
        })
    }
}

fn missing_volume(pool: &str, name: &str) -> MulchError {
    MulchError::Volume {
        pool: pool.into(),
        name: name.into(),
        message: "lookup failed: no such volume".into(),
    }
}

/// Hypervisor double with the four mulch pools registered under `/mem`.
#[derive(Clone)]
pub struct MemoryHypervisor {
    state: Arc<Mutex<MemState>>,
}

impl Default for MemoryHypervisor {
    fn default() -> Self {
        let mut state = MemState::default();
        for (pool, subdir, _) in paths::POOLS {
            state
                .pools
                .insert(pool.to_string(), Path::new("/mem").join(subdir));
        }
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }
}

impl MemoryHypervisor {
    fn lock(&self) -> std::sync::MutexGuard<'_, MemState> {
        self.state.lock().unwrap()
    }

    pub fn put_volume(&self, pool: &str, name: &str, data: impl Into<Vec<u8>>) {
        let data = data.into();
        let capacity = data.len() as u64;
        self.lock()
            .volumes
            .insert((pool.into(), name.into()), MemVolume { capacity, data });
    }

    pub fn volume(&self, pool: &str, name: &str) -> Option<MemVolume> {
        self.lock()
            .volumes
            .get(&(pool.to_string(), name.to_string()))
            .cloned()
    }

    pub fn volume_names(&self, pool: &str) -> Vec<String> {
        self.lock()
            .volumes
            .keys()
            .filter(|(p, _)| p == pool)
            .map(|(_, n)| n.clone())
            .collect()
    }

    pub fn domain(&self, name: &str) -> Option<MemDomain> {
        self.lock().domains.get(name).cloned()
    }

    pub fn domain_names(&self) -> Vec<String> {
        self.lock().domains.keys().cloned().collect()
    }

    pub fn fail_on(&self, op: &str) {
        self.lock().failures.insert(op.to_string());
    }

    /// Make `op` fail for every target once `trigger` has been called.
    pub fn fail_after(&self, trigger: &str, op: &str) {
        self.lock()
            .armed
            .push((trigger.to_string(), op.to_string()));
    }

    pub fn clear_failures(&self) {
        let mut st = self.lock();
        st.failures.clear();
        st.armed.clear();
    }

    /// Every call made so far, as `"<op> <target>"`.
    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.lock().networks.contains(name)
    }
}

impl Hypervisor for MemoryHypervisor {
    fn ensure_pool(&self, name: &str, path: &Path, _mode: &str) -> Result<(), MulchError> {
        let mut st = self.lock();
        st.check("ensure_pool", name)?;
        st.pools
            .entry(name.to_string())
            .or_insert_with(|| path.to_path_buf());
        Ok(())
    }

    fn ensure_network(&self, name: &str, _subnet: &str) -> Result<(), MulchError> {
        let mut st = self.lock();
        st.check("ensure_network", name)?;
        st.networks.insert(name.to_string());
        Ok(())
    }

    fn pool_root(&self, pool: &str) -> Result<PathBuf, MulchError> {
        self.lock().pool_path(pool).cloned()
    }

    fn lookup_volume(&self, pool: &str, name: &str) -> Result<Option<VolumeInfo>, MulchError> {
        let st = self.lock();
        st.pool_path(pool)?;
        st.injected("lookup_volume", name)?;
        Ok(st.info(pool, name))
    }

    fn create_volume(&self, pool: &str, xml_spec: &str) -> Result<VolumeInfo, MulchError> {
        let def = xml::parse_volume_xml(xml_spec)?;
        let mut st = self.lock();
        st.check("create_volume", &def.name)?;
        st.pool_path(pool)?;
        let key = (pool.to_string(), def.name.clone());
        if st.volumes.contains_key(&key) {
            return Err(MulchError::Volume {
                pool: pool.into(),
                name: def.name,
                message: "create failed: volume already exists".into(),
            });
        }
        st.volumes.insert(
            key,
            MemVolume {
                capacity: def.capacity,
                data: Vec::new(),
            },
        );
        st.info(pool, &def.name)
            .ok_or_else(|| missing_volume(pool, &def.name))
    }

    fn delete_volume(&self, pool: &str, name: &str) -> Result<(), MulchError> {
        let mut st = self.lock();
        st.check("delete_volume", name)?;
        st.volumes
            .remove(&(pool.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| missing_volume(pool, name))
    }

    fn resize_volume(&self, pool: &str, name: &str, capacity: u64) -> Result<(), MulchError> {
        let mut st = self.lock();
        st.check("resize_volume", name)?;
        let vol = st
            .volumes
            .get_mut(&(pool.to_string(), name.to_string()))
            .ok_or_else(|| missing_volume(pool, name))?;
        vol.capacity = capacity;
        Ok(())
    }

    fn download(&self, pool: &str, name: &str) -> Result<Box<dyn VolumeReader>, MulchError> {
        let mut st = self.lock();
        st.check("download", name)?;
        let vol = st
            .volumes
            .get(&(pool.to_string(), name.to_string()))
            .ok_or_else(|| missing_volume(pool, name))?;
        Ok(Box::new(MemReader {
            data: vol.data.clone(),
            pos: 0,
        }))
    }

    fn upload(&self, pool: &str, name: &str) -> Result<Box<dyn VolumeWriter>, MulchError> {
        let mut st = self.lock();
        st.check("upload", name)?;
        let key = (pool.to_string(), name.to_string());
        if !st.volumes.contains_key(&key) {
            return Err(missing_volume(pool, name));
        }
        Ok(Box::new(MemWriter {
            state: Arc::clone(&self.state),
            key,
            buf: Vec::new(),
        }))
    }

    fn define_domain(&self, xml_spec: &str) -> Result<(), MulchError> {
        let name = crate::domain_xml::domain_name_of(xml_spec).ok_or_else(|| {
            MulchError::Libvirt {
                message: "domain XML has no name".into(),
                hint: String::new(),
            }
        })?;
        let mut st = self.lock();
        st.check("define_domain", &name)?;
        st.domains.insert(
            name,
            MemDomain {
                xml: xml_spec.to_string(),
                ..MemDomain::default()
            },
        );
        Ok(())
    }

    fn start_domain(&self, name: &str) -> Result<(), MulchError> {
        let mut st = self.lock();
        st.check("start_domain", name)?;
        st.next_host = st.next_host.wrapping_add(1);
        let address = format!("10.104.0.{}", 100 + u16::from(st.next_host % 150));
        let dom = st.domain_mut(name)?;
        dom.active = true;
        dom.address = Some(address);
        Ok(())
    }

    fn shutdown_domain(&self, name: &str) -> Result<(), MulchError> {
        let mut st = self.lock();
        st.check("shutdown_domain", name)?;
        let dom = st.domain_mut(name)?;
        dom.active = false;
        dom.address = None;
        Ok(())
    }

    fn destroy_domain(&self, name: &str) -> Result<(), MulchError> {
        let mut st = self.lock();
        st.check("destroy_domain", name)?;
        let dom = st.domain_mut(name)?;
        dom.active = false;
        dom.address = None;
        Ok(())
    }

    fn undefine_domain(&self, name: &str) -> Result<(), MulchError> {
        let mut st = self.lock();
        st.check("undefine_domain", name)?;
        st.domains
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| MulchError::Libvirt {
                message: format!("domain '{name}' not found"),
                hint: String::new(),
            })
    }

    fn domain_exists(&self, name: &str) -> Result<bool, MulchError> {
        Ok(self.lock().domains.contains_key(name))
    }

    fn domain_is_active(&self, name: &str) -> Result<bool, MulchError> {
        Ok(self.lock().domains.get(name).is_some_and(|d| d.active))
    }

    fn domain_address(&self, name: &str) -> Result<Option<String>, MulchError> {
        let mut st = self.lock();
        st.check("domain_address", name)?;
        Ok(st.domains.get(name).and_then(|d| d.address.clone()))
    }

    fn attach_device(&self, domain: &str, xml_spec: &str) -> Result<(), MulchError> {
        let mut st = self.lock();
        st.check("attach_device", domain)?;
        st.domain_mut(domain)?.devices.push(xml_spec.to_string());
        Ok(())
    }

    fn detach_device(&self, domain: &str, xml_spec: &str) -> Result<(), MulchError> {
        let mut st = self.lock();
        st.check("detach_device", domain)?;
        st.domain_mut(domain)?.devices.retain(|d| d != xml_spec);
        Ok(())
    }
}

struct MemReader {
    data: Vec<u8>,
    pos: usize,
}

impl VolumeReader for MemReader {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, MulchError> {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn finish(self: Box<Self>) -> Result<(), MulchError> {
        Ok(())
    }
}

struct MemWriter {
    state: Arc<Mutex<MemState>>,
    key: (String, String),
    buf: Vec<u8>,
}

impl VolumeWriter for MemWriter {
    fn send(&mut self, data: &[u8]) -> Result<(), MulchError> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), MulchError> {
        let MemWriter { state, key, buf } = *self;
        let mut st = state.lock().unwrap();
        let vol = st
            .volumes
            .get_mut(&key)
            .ok_or_else(|| missing_volume(&key.0, &key.1))?;
        vol.data = buf;
        Ok(())
    }
}

// ── record store ───────────────────────────────────────

#[derive(Default, Clone)]
pub struct MemoryStore {
    records: Arc<Mutex<BTreeMap<String, VmRecord>>>,
    fail_saves: Arc<std::sync::atomic::AtomicBool>,
}

impl MemoryStore {
    pub fn get(&self, name: &str) -> Option<VmRecord> {
        self.records.lock().unwrap().get(name).cloned()
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

impl RecordStore for MemoryStore {
    fn load_all(&self) -> Result<Vec<VmRecord>, MulchError> {
        Ok(self.records.lock().unwrap().values().cloned().collect())
    }

    fn save(&self, record: &VmRecord) -> Result<(), MulchError> {
        if self.fail_saves.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(MulchError::Store {
                name: record.name.clone(),
                message: "injected save failure".into(),
            });
        }
        self.records
            .lock()
            .unwrap()
            .insert(record.name.clone(), record.clone());
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), MulchError> {
        self.records.lock().unwrap().remove(name);
        Ok(())
    }
}

// ── remote executor ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    pub host: String,
    pub run_as: String,
    pub payload: String,
}

/// Lets a test hold a script run open: `entered` fires when a run starts,
/// the run completes after `release` is notified.
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

#[derive(Default, Clone)]
pub struct ScriptedExecutor {
    calls: Arc<Mutex<Vec<ExecCall>>>,
    failures: Arc<Mutex<Vec<(String, i32)>>>,
    gate: Arc<Mutex<Option<Arc<Gate>>>>,
}

impl ScriptedExecutor {
    /// Runs whose payload contains `pattern` exit with `status`.
    pub fn fail_when(&self, pattern: &str, status: i32) {
        self.failures
            .lock()
            .unwrap()
            .push((pattern.to_string(), status));
    }

    pub fn gate(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn calls(&self) -> Vec<ExecCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn run(
        &self,
        host: &str,
        run_as: &str,
        payload: &[u8],
        on_output: &(dyn for<'o> Fn(&'o str) + Send + Sync),
    ) -> Result<i32, MulchError> {
        let payload = String::from_utf8_lossy(payload).into_owned();
        self.calls.lock().unwrap().push(ExecCall {
            host: host.to_string(),
            run_as: run_as.to_string(),
            payload: payload.clone(),
        });

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        on_output(&format!("running as {run_as} on {host}"));
        let status = self
            .failures
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _)| payload.contains(pattern.as_str()))
            .map(|(_, status)| *status)
            .unwrap_or(0);
        Ok(status)
    }
}
