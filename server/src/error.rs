//! Error types for the llamactl server.
//!
//! Errors raised by the lower crates are folded into the variants a caller
//! acts on: a missing model file is `FileNotFound` whether the GGUF reader
//! or the session manager noticed it.

use serde::Serialize;
use thiserror::Error;

use common::ConfigError;
use gguf_loader::GgufError;
use llamactl_hardware::HardwareError;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

#[derive(Error, Debug)]
pub enum ServerError {
    /// Model or projector file missing
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// `llama-server` binary missing
    #[error("Backend binary not found: {0}")]
    BackendNotFound(String),

    /// Device listing failed
    #[error("Device probe failed: {0}")]
    ProbeFailed(String),

    #[error("Port {0} is already in use")]
    PortInUse(u16),

    /// A session for this model id is running or starting
    #[error("Model '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Failed to spawn llama-server: {0}")]
    SpawnFailed(String),

    #[error("Model did not become ready within {secs}s")]
    StartupTimeout { secs: u64, stderr: String },

    #[error("Out of memory. The model requires more RAM or VRAM than available.")]
    OutOfMemory(String),

    #[error("The model's architecture is not supported by this version of the backend.")]
    ModelArchNotSupported(String),

    /// The process stopped before reporting readiness
    #[error("llama-server exited before it was ready")]
    ProcessExited(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No free port available")]
    NoPortAvailable,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("GGUF error: {0}")]
    Gguf(#[source] GgufError),

    #[error("Hardware error: {0}")]
    Hardware(#[source] HardwareError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Classify the captured stderr of a process that died during startup.
    pub fn from_stderr(stderr: &str) -> Self {
        let lower = stderr.to_lowercase();

        let out_of_memory = [
            "out of memory",
            "insufficient memory",
            "erroroutofdevicememory",
            "kiogpucommandbuffercallbackerroroutofmemory",
            "cuda_error_out_of_memory",
        ];
        if out_of_memory.iter().any(|marker| lower.contains(marker)) {
            return Self::OutOfMemory(stderr.to_string());
        }

        if lower.contains("error loading model architecture") {
            return Self::ModelArchNotSupported(stderr.to_string());
        }

        Self::ProcessExited(stderr.to_string())
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::FileNotFound(_) => "FILE_NOT_FOUND",
            Self::BackendNotFound(_) => "BACKEND_NOT_FOUND",
            Self::ProbeFailed(_) => "PROBE_FAILED",
            Self::PortInUse(_) => "PORT_IN_USE",
            Self::AlreadyRunning(_) => "ALREADY_RUNNING",
            Self::SpawnFailed(_) => "SPAWN_FAILED",
            Self::StartupTimeout { .. } => "STARTUP_TIMEOUT",
            Self::OutOfMemory(_) => "OUT_OF_MEMORY",
            Self::ModelArchNotSupported(_) => "MODEL_ARCH_NOT_SUPPORTED",
            Self::ProcessExited(_) => "PROCESS_EXITED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::NoPortAvailable => "NO_PORT_AVAILABLE",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::Gguf(_) => "GGUF_ERROR",
            Self::Hardware(_) => "HARDWARE_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// Process output attached to startup failures
    pub fn details(&self) -> Option<&str> {
        match self {
            Self::StartupTimeout { stderr, .. }
            | Self::OutOfMemory(stderr)
            | Self::ModelArchNotSupported(stderr)
            | Self::ProcessExited(stderr) => Some(stderr),
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a str>,
}

impl Serialize for ServerError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        ErrorBody {
            code: self.code(),
            message: self.to_string(),
            details: self.details(),
        }
        .serialize(serializer)
    }
}

impl From<GgufError> for ServerError {
    fn from(err: GgufError) -> Self {
        match err {
            GgufError::FileNotFound(path) => Self::FileNotFound(path),
            GgufError::InvalidArgument(msg) => Self::InvalidArgument(msg),
            GgufError::Hardware(hw) => hw.into(),
            other => Self::Gguf(other),
        }
    }
}

impl From<HardwareError> for ServerError {
    fn from(err: HardwareError) -> Self {
        match err {
            HardwareError::BackendNotFound(path) => Self::BackendNotFound(path),
            HardwareError::ProbeFailed(msg) => Self::ProbeFailed(msg),
            other => Self::Hardware(other),
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}
