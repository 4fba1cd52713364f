//! # Weft Plugin Runtime
//!
//! Host side of the Weft plugin system.
//!
//! ## Features
//!
//! - **Dependency Resolution**: Priority-aware load order, cycle and version checks
//! - **Dynamic Loading**: Shared libraries opened through `libloading`, with shadow copies
//! - **Lifecycle Management**: Load, initialize, unload in dependency order
//! - **Hot Reload**: Swap a plugin and its dependents in place, with rollback
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use weft_plugin_runtime::prelude::*;
//! use weft_plugin_api::{InMemoryEventBus, InMemoryServiceRegistry, PausableHost};
//!
//! # fn example() -> weft_plugin_runtime::Result<()> {
//! let manager = PluginManager::builder()
//!     .event_bus(Arc::new(InMemoryEventBus::new()))
//!     .services(Arc::new(InMemoryServiceRegistry::new()))
//!     .host(Arc::new(PausableHost::new("app")))
//!     .build();
//!
//! let loaded = manager.load_plugins_from_directory("./plugins");
//! println!("loaded {loaded} plugins");
//!
//! manager.initialize_all()?;
//! manager.enable_hot_reload(Duration::from_secs(1))?;
//!
//! // Later, after rebuilding `counter`
//! manager.reload_plugin("counter")?;
//!
//! manager.unload_all();
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod error;
pub mod hot_reload;
pub mod loader;
pub mod manager;
mod registry;
pub mod resolver;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{DependencyError, LoadError, PluginRuntimeError, Result};
pub use hot_reload::{ChangeCallback, FileChange, FileWatcher, NotifyWatcher, ReloadEvent};
pub use loader::{DynamicLoader, LoadedPlugin, PluginInstance, RetainedUnit, UnitLoader};
pub use manager::{Collaborators, HostCallback, PluginManager, PluginManagerBuilder};
pub use registry::{PluginState, PluginStatus};
pub use resolver::{resolve_dependencies, DependencyNode, DependencyResolver};

// Re-export plugin API types for convenience
pub use weft_plugin_api::{
    DependencyDescriptor, Plugin, PluginContext, PluginError, PluginManifest, PluginMetadata,
};

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::error::{PluginRuntimeError, Result};
    pub use crate::manager::{Collaborators, PluginManager};
    pub use crate::resolver::DependencyResolver;
    pub use weft_plugin_api::prelude::*;
}
