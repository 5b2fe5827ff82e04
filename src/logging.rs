use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::hub::Hub;
use crate::util::utc_timestamp;

// ── subscriber setup ─────────────────────────────────────

/// Install the global subscriber: stderr, a deferred daemon log file and the
/// Hub bridge. Returns the handle that activates the file once the data
/// directory is known.
pub fn init_tracing(verbose: bool, hub: &Hub) -> DeferredFileHandle {
    let terminal_filter = if verbose {
        EnvFilter::new("mulch=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mulch=info"))
    };
    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter);

    let (file_writer, file_handle) = DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("mulch=debug"));

    let hub_layer = hub.layer().with_filter(EnvFilter::new("mulch=info"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .with(hub_layer)
        .init();

    file_handle
}

// ── DeferredFileWriter ───────────────────────────────────

/// A `MakeWriter` that discards writes until `DeferredFileHandle::set_file`
/// points it at a file.
#[derive(Clone)]
pub struct DeferredFileWriter {
    inner: Arc<Mutex<Option<File>>>,
}

#[derive(Clone)]
pub struct DeferredFileHandle {
    inner: Arc<Mutex<Option<File>>>,
}

impl DeferredFileWriter {
    pub fn new() -> (Self, DeferredFileHandle) {
        let inner = Arc::new(Mutex::new(None));
        (
            Self {
                inner: Arc::clone(&inner),
            },
            DeferredFileHandle { inner },
        )
    }
}

impl DeferredFileHandle {
    /// Start appending to `path`.
    pub fn set_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = Some(file);
        Ok(())
    }
}

pub struct DeferredWriter {
    inner: Arc<Mutex<Option<File>>>,
}

impl Write for DeferredWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            Some(f) => f.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DeferredFileWriter {
    type Writer = DeferredWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DeferredWriter {
            inner: Arc::clone(&self.inner),
        }
    }
}

// ── ScriptLogger ─────────────────────────────────────────

/// Captures one lifecycle script run.
///
/// Creates `<timestamp>_<script>_running.log`; `finish` renames it to
/// `_ok.log` or `_failed.log`. `<script>` is `<category>-<index>`.
pub struct ScriptLogger {
    file: File,
    path: PathBuf,
}

pub fn script_key(category: &str, index: usize) -> String {
    format!("{category}-{index}")
}

impl ScriptLogger {
    pub fn new(logs_dir: &Path, script: &str) -> std::io::Result<Self> {
        fs::create_dir_all(logs_dir)?;
        let path = logs_dir.join(format!("{}_{script}_running.log", utc_timestamp()));
        let file = File::create(&path)?;
        Ok(Self { file, path })
    }

    pub fn write_line(&mut self, line: &str) {
        let _ = writeln!(self.file, "{line}");
    }

    /// Rename to the final status and return the new path.
    pub fn finish(self, success: bool) -> PathBuf {
        let suffix = if success { "_ok.log" } else { "_failed.log" };
        let renamed = self
            .path
            .file_name()
            .and_then(|f| f.to_str())
            .map(|f| self.path.with_file_name(f.replace("_running.log", suffix)));
        match renamed {
            Some(new_path) if fs::rename(&self.path, &new_path).is_ok() => new_path,
            _ => self.path,
        }
    }
}

/// Delete the oldest finished logs of `script`, keeping at most `keep`.
pub fn rotate_logs(logs_dir: &Path, script: &str, keep: usize) {
    let Ok(entries) = fs::read_dir(logs_dir) else {
        return;
    };
    let needle = format!("_{script}_");

    let mut finished: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name().and_then(|f| f.to_str()).is_some_and(|f| {
                f.contains(&needle) && (f.ends_with("_ok.log") || f.ends_with("_failed.log"))
            })
        })
        .collect();

    // timestamp prefix sorts chronologically
    finished.sort();
    if finished.len() > keep {
        for old in &finished[..finished.len() - keep] {
            let _ = fs::remove_file(old);
        }
    }
}

pub struct ScriptLogEntry {
    pub path: PathBuf,
    pub timestamp: String,
    pub script: String,
    pub status: String,
}

/// Finished script logs of one VM, oldest first.
pub fn list_script_logs(logs_dir: &Path) -> Vec<ScriptLogEntry> {
    let Ok(entries) = fs::read_dir(logs_dir) else {
        return Vec::new();
    };

    let mut logs: Vec<ScriptLogEntry> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let path = e.path();
            let stem = path.file_name()?.to_str()?.strip_suffix(".log")?;
            let (timestamp, rest) = stem.split_once('_')?;
            let (script, status) = rest.rsplit_once('_')?;
            if status == "running" {
                return None;
            }
            Some(ScriptLogEntry {
                timestamp: timestamp.to_string(),
                script: script.to_string(),
                status: status.to_string(),
                path,
            })
        })
        .collect();

    logs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.script.cmp(&b.script)));
    logs
}
