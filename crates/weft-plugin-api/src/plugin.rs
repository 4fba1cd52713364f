//! Core plugin trait

use crate::context::PluginContext;
use crate::metadata::PluginMetadata;
use semver::Version;
use std::any::Any;
use std::fmt;

/// Upcast to [`Any`] so hosts can recover a plugin's concrete type
///
/// Implemented for every `'static` type; plugin authors never write it.
pub trait AsAny: Any {
    /// Borrow as `&dyn Any`
    fn as_any(&self) -> &dyn Any;

    /// Borrow as `&mut dyn Any`
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Core plugin trait that every loadable unit's instance implements
///
/// The host drives the lifecycle strictly in this order:
/// `initialize` → (`on_before_reload` → `serialize_state` → `shutdown`
/// → new instance `initialize` → `deserialize_state` → `on_after_reload`)*
/// → `shutdown`.
pub trait Plugin: AsAny + Send + Sync + fmt::Debug {
    /// Metadata describing this plugin
    fn metadata(&self) -> &PluginMetadata;

    /// Plugin name (must be unique within a host)
    fn name(&self) -> &str {
        &self.metadata().name
    }

    /// Plugin version
    fn version(&self) -> &Version {
        &self.metadata().version
    }

    /// Initialize the plugin
    ///
    /// Returning `false` aborts `initialize_all` or triggers a reload
    /// rollback.
    fn initialize(&mut self, ctx: &PluginContext) -> bool;

    /// Release everything acquired in `initialize`
    fn shutdown(&mut self);

    /// Whether `initialize` has succeeded and `shutdown` has not run since
    fn is_initialized(&self) -> bool;

    /// Capture state to carry across a reload
    ///
    /// An empty string means there is nothing to restore.
    fn serialize_state(&self) -> String {
        String::new()
    }

    /// Restore state captured by the previous build's `serialize_state`
    fn deserialize_state(&mut self, _state: &str) {}

    /// Called before the old build is shut down for a reload
    fn on_before_reload(&mut self) {}

    /// Called after the new build is initialized and its state restored
    fn on_after_reload(&mut self) {}
}

impl dyn Plugin {
    /// Downcast to a concrete plugin type
    pub fn downcast_ref<T: Plugin>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Downcast to a concrete plugin type, mutably
    pub fn downcast_mut<T: Plugin>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryEventBus, InMemoryServiceRegistry, PausableHost};
    use std::sync::Arc;

    #[derive(Debug)]
    struct Echo {
        metadata: PluginMetadata,
        initialized: bool,
        greeting: String,
    }

    impl Plugin for Echo {
        fn metadata(&self) -> &PluginMetadata {
            &self.metadata
        }

        fn initialize(&mut self, _ctx: &PluginContext) -> bool {
            self.initialized = true;
            true
        }

        fn shutdown(&mut self) {
            self.initialized = false;
        }

        fn is_initialized(&self) -> bool {
            self.initialized
        }

        fn serialize_state(&self) -> String {
            self.greeting.clone()
        }

        fn deserialize_state(&mut self, state: &str) {
            self.greeting = state.to_string();
        }
    }

    fn echo() -> Echo {
        Echo {
            metadata: PluginMetadata::new("echo", Version::new(1, 4, 0)),
            initialized: false,
            greeting: "hi".to_string(),
        }
    }

    #[test]
    fn test_name_and_version_come_from_metadata() {
        let plugin = echo();
        assert_eq!(plugin.name(), "echo");
        assert_eq!(plugin.version(), &Version::new(1, 4, 0));
    }

    #[test]
    fn test_lifecycle_flags() {
        let ctx = PluginContext::new(
            "echo",
            Arc::new(InMemoryEventBus::new()),
            Arc::new(InMemoryServiceRegistry::new()),
            Arc::new(PausableHost::new("test")),
        );

        let mut plugin = echo();
        assert!(plugin.initialize(&ctx));
        assert!(plugin.is_initialized());
        plugin.shutdown();
        assert!(!plugin.is_initialized());
    }

    #[test]
    fn test_downcast_through_trait_object() {
        let mut boxed: Box<dyn Plugin> = Box::new(echo());

        boxed
            .downcast_mut::<Echo>()
            .unwrap()
            .deserialize_state("hello");
        assert_eq!(boxed.downcast_ref::<Echo>().unwrap().greeting, "hello");
        assert_eq!(boxed.serialize_state(), "hello");
    }
}
