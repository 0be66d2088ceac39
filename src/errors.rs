use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Problems with the registry document or process-wide settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Validation(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config already exists at {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("unsupported AI provider: {0}")]
    UnknownProvider(String),
}

/// Why an intent collided with the VM's current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    AlreadyRunning { pid: Option<u32> },
    NotRunning,
    DeleteWhileRunning,
    AlreadyExists,
    SshPortInUse { port: u16, owner: String },
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conflict::AlreadyRunning { pid: Some(pid) } => {
                write!(f, "is already running (PID: {})", pid)
            }
            Conflict::AlreadyRunning { pid: None } => write!(f, "is already running"),
            Conflict::NotRunning => write!(f, "is not running"),
            Conflict::DeleteWhileRunning => write!(f, "is running, stop it before deleting"),
            Conflict::AlreadyExists => write!(f, "already exists"),
            Conflict::SshPortInUse { port, owner } => {
                write!(f, "wants SSH port {} which running VM '{}' already uses", port, owner)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Ram,
    Cpu,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Ram => write!(f, "RAM (MB)"),
            Resource::Cpu => write!(f, "CPU cores"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AvmError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("VM '{vm}' not found")]
    NotFound { vm: String },

    #[error("VM '{vm}' {conflict}")]
    StateConflict { vm: String, conflict: Conflict },

    #[error("VM '{vm}': requested {resource} {requested} exceeds maximum {max}")]
    ResourceLimit {
        vm: String,
        resource: Resource,
        requested: u32,
        max: u32,
    },

    #[error("VM '{vm}': at least one resource (ram or cpu) must be specified")]
    NoChangeRequested { vm: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("VM '{vm}': {message}")]
    Process { vm: String, message: String },
}

impl AvmError {
    pub fn not_found(vm: &str) -> Self {
        AvmError::NotFound { vm: vm.to_string() }
    }

    pub fn conflict(vm: &str, conflict: Conflict) -> Self {
        AvmError::StateConflict {
            vm: vm.to_string(),
            conflict,
        }
    }

    pub fn process(vm: &str, message: impl Into<String>) -> Self {
        AvmError::Process {
            vm: vm.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AvmError>;
