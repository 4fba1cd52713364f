//! # Weft Plugin API
//!
//! The SDK shared by the Weft host and every loadable plugin unit.
//!
//! ## Contents
//!
//! - **Metadata**: [`PluginMetadata`], [`DependencyDescriptor`] and the JSON
//!   manifest format read by the host without instantiating anything
//! - **Lifecycle**: the [`Plugin`] trait and the [`PluginContext`] passed to
//!   `initialize`
//! - **Collaborators**: traits for the event bus, service registry, resource
//!   store and host application, with in-memory implementations
//! - **FFI**: the three-symbol binary contract and [`declare_plugin!`]
//!
//! ## Example
//!
//! ```rust
//! use weft_plugin_api::prelude::*;
//!
//! #[derive(Debug)]
//! struct Hello {
//!     metadata: PluginMetadata,
//!     initialized: bool,
//! }
//!
//! impl Hello {
//!     fn describe() -> PluginMetadata {
//!         PluginMetadata::new("hello", Version::new(1, 0, 0)).with_priority(10)
//!     }
//!
//!     fn new() -> Self {
//!         Self { metadata: Self::describe(), initialized: false }
//!     }
//! }
//!
//! impl Plugin for Hello {
//!     fn metadata(&self) -> &PluginMetadata {
//!         &self.metadata
//!     }
//!
//!     fn initialize(&mut self, ctx: &PluginContext) -> bool {
//!         ctx.subscribe("greet", |_, payload| println!("hello {payload}"));
//!         self.initialized = true;
//!         true
//!     }
//!
//!     fn shutdown(&mut self) {
//!         self.initialized = false;
//!     }
//!
//!     fn is_initialized(&self) -> bool {
//!         self.initialized
//!     }
//! }
//!
//! weft_plugin_api::declare_plugin!(Hello, Hello::new, Hello::describe);
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod context;
pub mod error;
pub mod ffi;
pub mod host;
pub mod memory;
pub mod metadata;
pub mod plugin;

// Re-export commonly used types
pub use context::PluginContext;
pub use error::{PluginError, Result};
pub use host::{ConfigStore, EventBus, EventHandler, Host, Job, ResourceStore, Service, ServiceRegistry, WorkerPool};
pub use memory::{InMemoryEventBus, InMemoryResourceStore, InMemoryServiceRegistry, JsonConfigStore, PausableHost};
pub use metadata::{parse_version, DependencyDescriptor, PluginManifest, PluginMetadata, DEFAULT_LOAD_PRIORITY};
pub use plugin::{AsAny, Plugin};
pub use semver::Version;

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::context::PluginContext;
    pub use crate::host::{EventBus, Host, ResourceStore, ServiceRegistry};
    pub use crate::metadata::{DependencyDescriptor, PluginMetadata};
    pub use crate::plugin::Plugin;
    pub use semver::Version;
}
