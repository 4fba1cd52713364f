//! Plugin SDK error types

use std::fmt;

/// Error raised while reading or writing plugin metadata
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// Manifest is structurally valid JSON but semantically unusable
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    /// Version string could not be parsed
    #[error("Invalid version '{0}'")]
    InvalidVersion(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

/// Result type for plugin SDK operations
pub type Result<T> = std::result::Result<T, PluginError>;

impl PluginError {
    /// Create a new invalid manifest error
    pub fn manifest(msg: impl fmt::Display) -> Self {
        Self::InvalidManifest(msg.to_string())
    }

    /// Create a new invalid version error
    pub fn version(raw: impl fmt::Display) -> Self {
        Self::InvalidVersion(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PluginError::version("one.two");
        assert_eq!(err.to_string(), "Invalid version 'one.two'");

        let err = PluginError::manifest("name is empty");
        assert_eq!(err.to_string(), "Invalid manifest: name is empty");
    }
}
