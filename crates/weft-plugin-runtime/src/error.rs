//! Plugin runtime error types

use semver::Version;
use std::fmt;
use std::path::{Path, PathBuf};

/// Dependency graph failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DependencyError {
    /// Some plugins depend on each other in a loop
    #[error("Circular dependency detected among: {}", .0.join(", "))]
    Cycle(Vec<String>),

    /// A required dependency is not registered
    #[error("Plugin '{plugin}' requires missing dependency '{dependency}'")]
    Missing {
        /// Dependent plugin
        plugin: String,
        /// Absent dependency
        dependency: String,
    },

    /// A required dependency is registered with an unacceptable version
    #[error("Plugin '{plugin}' requires '{dependency}' {required}, found {found}")]
    VersionConstraint {
        /// Dependent plugin
        plugin: String,
        /// Dependency whose version is out of range
        dependency: String,
        /// Accepted range
        required: String,
        /// Registered version
        found: Version,
    },

    /// A plugin lists itself as a dependency
    #[error("Plugin '{0}' depends on itself")]
    SelfDependency(String),
}

impl DependencyError {
    /// Create a new missing dependency error
    pub fn missing(plugin: impl fmt::Display, dependency: impl fmt::Display) -> Self {
        Self::Missing {
            plugin: plugin.to_string(),
            dependency: dependency.to_string(),
        }
    }
}

/// Failure to open or instantiate a loadable unit
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// Path does not name a regular file
    #[error("Invalid plugin path {}: {reason}", .path.display())]
    InvalidPath {
        /// Offending path
        path: PathBuf,
        /// What is wrong with it
        reason: String,
    },

    /// The platform loader refused the file
    #[error("Failed to open {}: {reason}", .path.display())]
    Open {
        /// Unit path
        path: PathBuf,
        /// Loader message
        reason: String,
    },

    /// A required entry point is not exported
    #[error("Symbol '{symbol}' not found in {}: {reason}", .path.display())]
    MissingSymbol {
        /// Unit path
        path: PathBuf,
        /// Missing symbol
        symbol: &'static str,
        /// Loader message
        reason: String,
    },

    /// Manifest text is unusable
    #[error("Invalid manifest in {}: {reason}", .path.display())]
    InvalidManifest {
        /// Unit path
        path: PathBuf,
        /// Parse or validation failure
        reason: String,
    },

    /// Unit was built against a different ABI revision
    #[error("ABI mismatch in {}: host speaks {expected}, unit speaks {found}", .path.display())]
    AbiMismatch {
        /// Unit path
        path: PathBuf,
        /// Host revision
        expected: u32,
        /// Unit revision
        found: u32,
    },

    /// Unit was built by a different compiler than the host
    #[error("Toolchain mismatch in {}: host built by {expected}, unit built by {found}", .path.display())]
    ToolchainMismatch {
        /// Unit path
        path: PathBuf,
        /// Host compiler
        expected: String,
        /// Unit compiler
        found: String,
    },

    /// `instantiate` returned null
    #[error("Instantiation of {} returned no instance", .path.display())]
    NullInstance {
        /// Unit path
        path: PathBuf,
    },

    /// Filesystem failure while preparing the unit
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        /// Path being touched
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

impl LoadError {
    /// Create a new invalid path error
    pub fn invalid_path(path: &Path, reason: impl fmt::Display) -> Self {
        Self::InvalidPath {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    /// Create a new open error
    pub fn open(path: &Path, reason: impl fmt::Display) -> Self {
        Self::Open {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    /// Create a new invalid manifest error
    pub fn manifest(path: &Path, reason: impl fmt::Display) -> Self {
        Self::InvalidManifest {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    /// Create a new I/O error
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Path of the unit that failed
    pub fn path(&self) -> &Path {
        match self {
            Self::InvalidPath { path, .. }
            | Self::Open { path, .. }
            | Self::MissingSymbol { path, .. }
            | Self::InvalidManifest { path, .. }
            | Self::AbiMismatch { path, .. }
            | Self::ToolchainMismatch { path, .. }
            | Self::NullInstance { path }
            | Self::Io { path, .. } => path,
        }
    }
}

/// Plugin runtime error type
#[derive(Debug, thiserror::Error)]
pub enum PluginRuntimeError {
    /// Dependency resolution or validation failed
    #[error(transparent)]
    Dependency(#[from] DependencyError),

    /// A unit could not be loaded
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Plugin not found
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// A plugin with the same name is already registered
    #[error("Plugin already loaded: {0}")]
    PluginAlreadyLoaded(String),

    /// A collaborator required for initialization has not been provided
    #[error("Missing collaborator: {0}")]
    MissingCollaborator(&'static str),

    /// `initialize` returned false
    #[error("Plugin '{0}' failed to initialize")]
    InitializationFailed(String),

    /// A plugin callback panicked
    #[error("Plugin '{plugin}' panicked: {message}")]
    PluginPanicked {
        /// Plugin whose callback panicked
        plugin: String,
        /// Panic payload, when it was a string
        message: String,
    },

    /// The rebuilt unit reports a different plugin name
    #[error("Reloaded unit for '{expected}' identifies itself as '{found}'")]
    IdentityChanged {
        /// Name before the reload
        expected: String,
        /// Name reported by the new build
        found: String,
    },

    /// Reload failed and the previous builds were restored
    #[error("Reload of '{plugin}' failed and was rolled back: {reason}")]
    RolledBack {
        /// Plugin whose reload was requested
        plugin: String,
        /// Why the new build was rejected
        reason: String,
    },

    /// Reload failed and rollback could not restore every affected plugin
    #[error("Reload of '{plugin}' failed ({reason}); left unloaded: {}", .unloaded.join(", "))]
    ReloadFailed {
        /// Plugin whose reload was requested
        plugin: String,
        /// Why the new build was rejected
        reason: String,
        /// Plugins that are no longer registered
        unloaded: Vec<String>,
    },

    /// A mutating operation was invoked from inside a plugin callback
    #[error("'{0}' cannot run while another plugin operation is in progress on this thread")]
    Reentrant(&'static str),

    /// File watching failed
    #[error("Watch error: {0}")]
    Watch(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for plugin runtime operations
pub type Result<T> = std::result::Result<T, PluginRuntimeError>;

impl PluginRuntimeError {
    /// Create a new plugin not found error
    pub fn not_found(name: impl fmt::Display) -> Self {
        Self::PluginNotFound(name.to_string())
    }

    /// Create a new already loaded error
    pub fn already_loaded(name: impl fmt::Display) -> Self {
        Self::PluginAlreadyLoaded(name.to_string())
    }

    /// Create a new initialization failure error
    pub fn initialization_failed(name: impl fmt::Display) -> Self {
        Self::InitializationFailed(name.to_string())
    }

    /// Create a new panic error from a `catch_unwind` payload
    pub fn panicked(plugin: impl fmt::Display, payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::PluginPanicked {
            plugin: plugin.to_string(),
            message,
        }
    }

    /// Create a new watch error
    pub fn watch(msg: impl fmt::Display) -> Self {
        Self::Watch(msg.to_string())
    }
}
