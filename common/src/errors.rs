//! Error types for configuration handling.

use thiserror::Error;

/// Errors raised while interpreting a run configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A field holds a value that cannot be turned into server arguments.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An environment override string is malformed.
    #[error("Invalid environment entry: {0}")]
    InvalidEnv(String),
}

/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConfigError::InvalidArgument("version_backend".to_string());
        assert_eq!(err.to_string(), "Invalid argument: version_backend");
    }
}
