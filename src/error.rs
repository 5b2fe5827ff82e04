use miette::Diagnostic;
use thiserror::Error;

/// Coarse error classes the API layer uses to pick a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or out-of-range input. Never retried.
    Validation,
    /// Name taken, VM locked or busy, stale revision. Retry after resolving.
    Conflict,
    /// Hypervisor, fetch, SSH or storage failure.
    Collaborator,
    Internal,
}

#[derive(Debug, Error, Diagnostic)]
pub enum MulchError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("script '{url}': {message}")]
    Script { url: String, message: String },

    #[error("VM '{name}' already exists")]
    AlreadyExists { name: String },

    #[error("VM '{name}' not found")]
    NotFound { name: String },

    #[error("VM '{name}' is locked")]
    #[diagnostic(help("unlock the VM first, or pass --force"))]
    Locked { name: String },

    #[error("VM '{name}' is busy ({operation} in progress)")]
    Busy { name: String, operation: String },

    #[error("stale revision {requested} for VM '{name}' (current revision is {current})")]
    StaleRevision {
        name: String,
        requested: u32,
        current: u32,
    },

    #[error("libvirt error: {message}")]
    Libvirt {
        message: String,
        #[help]
        hint: String,
    },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed: {message}")]
    ExternalCommand { command: String, message: String },

    #[error("failed to fetch '{url}': {message}")]
    Fetch { url: String, message: String },

    #[error("remote execution on {host} failed: {message}")]
    Remote { host: String, message: String },

    #[error("script {url} (as {run_as}) exited with status {status}")]
    ScriptFailed {
        url: String,
        run_as: String,
        status: i32,
    },

    #[error("volume {pool}/{name}: {message}")]
    Volume {
        pool: String,
        name: String,
        message: String,
    },

    #[error("cannot shrink volume {name} from {current} to {requested} bytes")]
    CannotShrink {
        name: String,
        current: u64,
        requested: u64,
    },

    #[error("failed to persist record for VM '{name}': {message}")]
    Store { name: String, message: String },

    #[error("{step} failed for VM '{name}'")]
    BuildFailed {
        name: String,
        step: String,
        #[source]
        source: Box<MulchError>,
    },

    #[error("operation on VM '{name}' was aborted")]
    Aborted { name: String },

    #[error("background task failed: {message}")]
    Join { message: String },
}

impl MulchError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        MulchError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MulchError::Validation { .. }
            | MulchError::Script { .. }
            | MulchError::ConfigParse { .. } => ErrorKind::Validation,
            MulchError::AlreadyExists { .. }
            | MulchError::NotFound { .. }
            | MulchError::Locked { .. }
            | MulchError::Busy { .. }
            | MulchError::StaleRevision { .. } => ErrorKind::Conflict,
            MulchError::Aborted { .. } | MulchError::Join { .. } => ErrorKind::Internal,
            MulchError::BuildFailed { source, .. } => match source.kind() {
                ErrorKind::Internal => ErrorKind::Internal,
                _ => ErrorKind::Collaborator,
            },
            _ => ErrorKind::Collaborator,
        }
    }
}
