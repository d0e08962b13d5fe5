//! Error types for GGUF inspection, backend resolution and load planning.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GgufError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid GGUF format: {0}")]
    InvalidFormat(String),

    #[error("Truncated GGUF file: {0}")]
    Truncated(String),

    #[error("Missing metadata field: {0}")]
    MissingMetadataField(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Hardware probe failed: {0}")]
    Hardware(#[from] llamactl_hardware::HardwareError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GgufError>;
