//! Volume engine.
//!
//! Two interchangeable copy strategies sit behind [`CopyStrategy`]:
//! [`DelegatedClone`] streams volumes through the hypervisor API, and
//! [`DirectCopy`] works on pool directories with plain file I/O. The engine
//! runs them on the blocking pool and adds the resize fallback.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::MulchError;
use crate::hypervisor::{Hypervisor, xml};
use crate::paths;
use crate::util::format_size;

/// Transfer unit for streamed copies.
pub const CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeRef {
    pub pool: String,
    pub name: String,
}

impl VolumeRef {
    pub fn new(pool: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for VolumeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.pool, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeDescriptor {
    pub pool: String,
    pub name: String,
    /// Bytes.
    pub size: u64,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Provisioned {
    pub volume: VolumeDescriptor,
    pub bytes_copied: u64,
    pub elapsed: Duration,
}

fn volume_error(vol: &VolumeRef, message: impl Into<String>) -> MulchError {
    MulchError::Volume {
        pool: vol.pool.clone(),
        name: vol.name.clone(),
        message: message.into(),
    }
}

/// Blocking volume primitives. Callers run these off the async runtime.
pub trait CopyStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn lookup(&self, vol: &VolumeRef) -> Result<Option<VolumeDescriptor>, MulchError>;
    /// Copy `src` into a new volume `dst`, returning bytes transferred.
    fn copy(&self, src: &VolumeRef, dst: &VolumeRef) -> Result<u64, MulchError>;
    fn write(&self, dst: &VolumeRef, data: &[u8]) -> Result<(), MulchError>;
    fn create_blank(&self, dst: &VolumeRef, size: u64) -> Result<(), MulchError>;
    /// Returns `Ok(false)` when there is no native resize path.
    fn resize(&self, vol: &VolumeRef, size: u64) -> Result<bool, MulchError>;
    fn delete(&self, vol: &VolumeRef) -> Result<(), MulchError>;
    fn read(
        &self,
        vol: &VolumeRef,
        sink: &mut dyn FnMut(&[u8]) -> Result<(), MulchError>,
    ) -> Result<u64, MulchError>;
}

// ── delegated clone ────────────────────────────────────────

pub struct DelegatedClone {
    hv: Arc<dyn Hypervisor>,
}

impl DelegatedClone {
    pub fn new(hv: Arc<dyn Hypervisor>) -> Self {
        Self { hv }
    }

    fn create(&self, dst: &VolumeRef, capacity: u64) -> Result<(), MulchError> {
        let path = self.hv.pool_root(&dst.pool)?.join(&dst.name);
        let spec = xml::volume_xml(&dst.name, capacity, &path.display().to_string())?;
        self.hv.create_volume(&dst.pool, &spec)?;
        Ok(())
    }
}

impl CopyStrategy for DelegatedClone {
    fn name(&self) -> &'static str {
        "libvirt"
    }

    fn lookup(&self, vol: &VolumeRef) -> Result<Option<VolumeDescriptor>, MulchError> {
        Ok(self
            .hv
            .lookup_volume(&vol.pool, &vol.name)?
            .map(|info| VolumeDescriptor {
                pool: info.pool,
                name: info.name,
                size: info.capacity,
                path: info.path,
            }))
    }

    fn copy(&self, src: &VolumeRef, dst: &VolumeRef) -> Result<u64, MulchError> {
        let source = self
            .hv
            .lookup_volume(&src.pool, &src.name)?
            .ok_or_else(|| volume_error(src, "source volume not found"))?;
        if self.hv.lookup_volume(&dst.pool, &dst.name)?.is_some() {
            return Err(volume_error(dst, "volume already exists"));
        }
        self.create(dst, source.capacity)?;

        let mut reader = self.hv.download(&src.pool, &src.name)?;
        let mut writer = self.hv.upload(&dst.pool, &dst.name)?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let n = reader.recv(&mut buf)?;
            if n == 0 {
                break;
            }
            writer.send(&buf[..n])?;
            total += n as u64;
        }
        writer.finish()?;
        reader.finish()?;
        Ok(total)
    }

    fn write(&self, dst: &VolumeRef, data: &[u8]) -> Result<(), MulchError> {
        self.create(dst, data.len() as u64)?;
        let mut writer = self.hv.upload(&dst.pool, &dst.name)?;
        for chunk in data.chunks(CHUNK_SIZE) {
            writer.send(chunk)?;
        }
        writer.finish()
    }

    fn create_blank(&self, dst: &VolumeRef, size: u64) -> Result<(), MulchError> {
        self.create(dst, size)
    }

    fn resize(&self, vol: &VolumeRef, size: u64) -> Result<bool, MulchError> {
        self.hv.resize_volume(&vol.pool, &vol.name, size)?;
        Ok(true)
    }

    fn delete(&self, vol: &VolumeRef) -> Result<(), MulchError> {
        self.hv.delete_volume(&vol.pool, &vol.name)
    }

    fn read(
        &self,
        vol: &VolumeRef,
        sink: &mut dyn FnMut(&[u8]) -> Result<(), MulchError>,
    ) -> Result<u64, MulchError> {
        let mut reader = self.hv.download(&vol.pool, &vol.name)?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let n = reader.recv(&mut buf)?;
            if n == 0 {
                break;
            }
            sink(&buf[..n])?;
            total += n as u64;
        }
        reader.finish()?;
        Ok(total)
    }
}

// ── direct copy ────────────────────────────────────────────

/// File-level access to pool directories under the storage root.
pub struct DirectCopy {
    storage_root: PathBuf,
}

impl DirectCopy {
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
        }
    }

    fn path(&self, vol: &VolumeRef) -> PathBuf {
        paths::pool_dir(&self.storage_root, &vol.pool).join(&vol.name)
    }

    fn create_new(&self, vol: &VolumeRef) -> Result<(File, PathBuf), MulchError> {
        let path = self.path(vol);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    volume_error(vol, "volume already exists")
                } else {
                    MulchError::Io {
                        context: format!("creating {}", path.display()),
                        source: e,
                    }
                }
            })?;
        Ok((file, path))
    }
}

/// QCOW2 magic number: the ASCII bytes `QFI` followed by `0xFB`.
const QCOW2_MAGIC: u32 = 0x514649FB;

/// Guest-visible size of the image at `path`. QCOW2 images carry it as a
/// big-endian u64 at header offset 24; anything else is raw and its length
/// is its size.
fn virtual_size(path: &Path, file_len: u64) -> Result<u64, MulchError> {
    let mut header = [0u8; 32];
    if file_len < header.len() as u64 {
        return Ok(file_len);
    }
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut header))
        .map_err(io_err(format!("reading header of {}", path.display())))?;

    let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if magic != QCOW2_MAGIC {
        return Ok(file_len);
    }
    let mut size = [0u8; 8];
    size.copy_from_slice(&header[24..32]);
    Ok(u64::from_be_bytes(size))
}

fn io_err(context: String) -> impl FnOnce(std::io::Error) -> MulchError {
    move |source| MulchError::Io { context, source }
}

impl CopyStrategy for DirectCopy {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn lookup(&self, vol: &VolumeRef) -> Result<Option<VolumeDescriptor>, MulchError> {
        let path = self.path(vol);
        match fs::metadata(&path) {
            Ok(meta) => Ok(Some(VolumeDescriptor {
                pool: vol.pool.clone(),
                name: vol.name.clone(),
                size: virtual_size(&path, meta.len())?,
                path,
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MulchError::Io {
                context: format!("inspecting {}", path.display()),
                source: e,
            }),
        }
    }

    fn copy(&self, src: &VolumeRef, dst: &VolumeRef) -> Result<u64, MulchError> {
        let src_path = self.path(src);
        let input = match File::open(&src_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(volume_error(src, "source volume not found"));
            }
            Err(e) => return Err(io_err(format!("opening {}", src_path.display()))(e)),
        };
        let (output, dst_path) = self.create_new(dst)?;

        let mut reader = BufReader::with_capacity(CHUNK_SIZE, input);
        let mut writer = BufWriter::with_capacity(CHUNK_SIZE, output);
        let bytes = std::io::copy(&mut reader, &mut writer)
            .map_err(io_err(format!("copying to {}", dst_path.display())))?;
        let output = writer
            .into_inner()
            .map_err(|e| io_err(format!("flushing {}", dst_path.display()))(e.into_error()))?;
        output
            .sync_all()
            .map_err(io_err(format!("syncing {}", dst_path.display())))?;
        Ok(bytes)
    }

    fn write(&self, dst: &VolumeRef, data: &[u8]) -> Result<(), MulchError> {
        let (mut file, path) = self.create_new(dst)?;
        file.write_all(data)
            .and_then(|()| file.sync_all())
            .map_err(io_err(format!("writing {}", path.display())))
    }

    fn create_blank(&self, dst: &VolumeRef, size: u64) -> Result<(), MulchError> {
        if xml::volume_format(&dst.name) == "qcow2" {
            let path = self.path(dst);
            if path.exists() {
                return Err(volume_error(dst, "volume already exists"));
            }
            let output = std::process::Command::new("qemu-img")
                .args(["create", "-f", "qcow2"])
                .arg(&path)
                .arg(size.to_string())
                .output()
                .map_err(io_err("running qemu-img".into()))?;
            if !output.status.success() {
                return Err(MulchError::ExternalCommand {
                    command: "qemu-img create".into(),
                    message: String::from_utf8_lossy(&output.stderr).into_owned(),
                });
            }
            return Ok(());
        }

        let (file, path) = self.create_new(dst)?;
        file.set_len(size)
            .map_err(io_err(format!("allocating {}", path.display())))
    }

    fn resize(&self, _vol: &VolumeRef, _size: u64) -> Result<bool, MulchError> {
        Ok(false)
    }

    fn delete(&self, vol: &VolumeRef) -> Result<(), MulchError> {
        let path = self.path(vol);
        fs::remove_file(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                volume_error(vol, "no such volume")
            } else {
                io_err(format!("removing {}", path.display()))(e)
            }
        })
    }

    fn read(
        &self,
        vol: &VolumeRef,
        sink: &mut dyn FnMut(&[u8]) -> Result<(), MulchError>,
    ) -> Result<u64, MulchError> {
        let path = self.path(vol);
        let mut file = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                volume_error(vol, "no such volume")
            } else {
                io_err(format!("opening {}", path.display()))(e)
            }
        })?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let n = file
                .read(&mut buf)
                .map_err(io_err(format!("reading {}", path.display())))?;
            if n == 0 {
                break;
            }
            sink(&buf[..n])?;
            total += n as u64;
        }
        Ok(total)
    }
}

// ── engine ─────────────────────────────────────────────────

#[derive(Clone)]
pub struct VolumeEngine {
    strategy: Arc<dyn CopyStrategy>,
}

impl VolumeEngine {
    pub fn new(strategy: Arc<dyn CopyStrategy>) -> Self {
        Self { strategy }
    }

    pub fn delegated(hv: Arc<dyn Hypervisor>) -> Self {
        Self::new(Arc::new(DelegatedClone::new(hv)))
    }

    pub fn direct(storage_root: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(DirectCopy::new(storage_root)))
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, MulchError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn CopyStrategy) -> Result<T, MulchError> + Send + 'static,
    {
        let strategy = Arc::clone(&self.strategy);
        tokio::task::spawn_blocking(move || f(strategy.as_ref()))
            .await
            .map_err(|e| MulchError::Join {
                message: e.to_string(),
            })?
    }

    pub async fn describe(&self, vol: &VolumeRef) -> Result<Option<VolumeDescriptor>, MulchError> {
        let vol = vol.clone();
        self.blocking(move |s| s.lookup(&vol)).await
    }

    async fn require(&self, vol: &VolumeRef) -> Result<VolumeDescriptor, MulchError> {
        self.describe(vol)
            .await?
            .ok_or_else(|| volume_error(vol, "volume not found after creation"))
    }

    /// Create `dst` as a full copy of `src`.
    pub async fn provision(
        &self,
        src: &VolumeRef,
        dst: &VolumeRef,
    ) -> Result<Provisioned, MulchError> {
        let started = Instant::now();
        let (s, d) = (src.clone(), dst.clone());
        let bytes_copied = self.blocking(move |st| st.copy(&s, &d)).await?;
        let elapsed = started.elapsed();
        tracing::info!(
            strategy = self.strategy_name(),
            src = %src,
            dst = %dst,
            bytes = bytes_copied,
            elapsed_ms = elapsed.as_millis() as u64,
            "volume copied ({})",
            format_size(bytes_copied)
        );
        Ok(Provisioned {
            volume: self.require(dst).await?,
            bytes_copied,
            elapsed,
        })
    }

    /// Create `dst` holding exactly `data`.
    pub async fn write(&self, dst: &VolumeRef, data: Vec<u8>) -> Result<VolumeDescriptor, MulchError> {
        let d = dst.clone();
        self.blocking(move |s| s.write(&d, &data)).await?;
        self.require(dst).await
    }

    pub async fn create_blank(
        &self,
        dst: &VolumeRef,
        size: u64,
    ) -> Result<VolumeDescriptor, MulchError> {
        let d = dst.clone();
        self.blocking(move |s| s.create_blank(&d, size)).await?;
        self.require(dst).await
    }

    /// Grow `vol` to `size` bytes. Shrinking is refused; equal size is a no-op.
    pub async fn resize(&self, vol: &VolumeRef, size: u64) -> Result<(), MulchError> {
        let current = self
            .describe(vol)
            .await?
            .ok_or_else(|| volume_error(vol, "no such volume"))?;
        if size < current.size {
            return Err(MulchError::CannotShrink {
                name: vol.to_string(),
                current: current.size,
                requested: size,
            });
        }
        if size == current.size {
            return Ok(());
        }

        let v = vol.clone();
        match self.blocking(move |s| s.resize(&v, size)).await {
            Ok(true) => {
                tracing::debug!(volume = %vol, size, "volume resized");
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(volume = %vol, "native resize failed, using qemu-img: {e}");
            }
        }
        qemu_img_resize(&current.path, size).await
    }

    pub async fn delete(&self, vol: &VolumeRef) -> Result<(), MulchError> {
        let v = vol.clone();
        self.blocking(move |s| s.delete(&v)).await?;
        tracing::debug!(volume = %vol, "volume deleted");
        Ok(())
    }

    /// Stream the raw contents of `vol` into `out`.
    pub async fn export<W>(&self, vol: &VolumeRef, out: &mut W) -> Result<u64, MulchError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<u8>>(4);
        let v = vol.clone();
        let reader = self.blocking(move |s| {
            s.read(&v, &mut |chunk| {
                tx.blocking_send(chunk.to_vec())
                    .map_err(|_| volume_error(&v, "export receiver closed"))
            })
        });

        let writer = async move {
            let mut written = 0u64;
            while let Some(chunk) = rx.recv().await {
                out.write_all(&chunk)
                    .await
                    .map_err(io_err("writing export stream".into()))?;
                written += chunk.len() as u64;
            }
            out.flush()
                .await
                .map_err(io_err("flushing export stream".into()))?;
            Ok::<u64, MulchError>(written)
        };

        let (read, written) = tokio::join!(reader, writer);
        let read = read?;
        let written = written?;
        debug_assert_eq!(read, written);
        Ok(written)
    }
}

async fn qemu_img_resize(path: &Path, size: u64) -> Result<(), MulchError> {
    let output = tokio::process::Command::new("qemu-img")
        .arg("resize")
        .arg(path)
        .arg(size.to_string())
        .output()
        .await
        .map_err(io_err("running qemu-img".into()))?;

    if !output.status.success() {
        let mut message = String::from_utf8_lossy(&output.stdout).into_owned();
        message.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(MulchError::ExternalCommand {
            command: "qemu-img resize".into(),
            message: message.trim().to_string(),
        });
    }
    tracing::debug!(path = %path.display(), size, "volume resized with qemu-img");
    Ok(())
}
