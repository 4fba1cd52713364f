//! Configuration error types

use std::fmt;
use std::path::PathBuf;

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read config file {}: {source}", .path.display())]
    Read {
        /// Config file path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Extension does not name a supported format
    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),

    /// `${VAR}` without a default and `VAR` is unset
    #[error("Environment variable '{0}' not set and no default provided")]
    MissingVariable(String),

    /// Text does not parse as the expected format
    #[error("Failed to parse {format}: {reason}")]
    Parse {
        /// Format name
        format: &'static str,
        /// Parser message
        reason: String,
    },

    /// Parsed values are out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

impl ConfigError {
    /// Create a new parse error
    pub fn parse(format: &'static str, reason: impl fmt::Display) -> Self {
        Self::Parse {
            format,
            reason: reason.to_string(),
        }
    }

    /// Create a new validation error
    pub fn invalid(msg: impl fmt::Display) -> Self {
        Self::Invalid(msg.to_string())
    }
}
