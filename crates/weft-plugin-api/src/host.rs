//! Host collaborator traits
//!
//! The orchestrator only ever calls the per-plugin cleanup hooks
//! (`unsubscribe_plugin`, `unregister_plugin`, `unload_plugin`) and the
//! pause/resume hooks on [`Host`]. The remaining methods exist so plugins
//! have something to talk to.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Handler invoked with `(topic, payload)` for each published event
pub type EventHandler = Arc<dyn Fn(&str, &serde_json::Value) + Send + Sync>;

/// Type-erased service object
pub type Service = Arc<dyn Any + Send + Sync>;

/// Work item submitted to a [`WorkerPool`]
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Publish/subscribe bus shared by all plugins
pub trait EventBus: Send + Sync + fmt::Debug {
    /// Deliver `payload` to every subscriber of `topic`, returning the
    /// number of handlers invoked
    fn publish(&self, topic: &str, payload: &serde_json::Value) -> usize;

    /// Subscribe `handler` to `topic` on behalf of `plugin`
    fn subscribe(&self, plugin: &str, topic: &str, handler: EventHandler);

    /// Drop every subscription owned by `plugin`, returning how many were removed
    fn unsubscribe_plugin(&self, plugin: &str) -> usize;
}

/// Name-keyed service lookup
pub trait ServiceRegistry: Send + Sync + fmt::Debug {
    /// Register `service` under `name`, owned by `plugin`
    fn register(&self, plugin: &str, name: &str, service: Service);

    /// Look up a service by name
    fn resolve(&self, name: &str) -> Option<Service>;

    /// Drop every service owned by `plugin`, returning how many were removed
    fn unregister_plugin(&self, plugin: &str) -> usize;
}

/// Per-plugin resource storage
pub trait ResourceStore: Send + Sync + fmt::Debug {
    /// Store a resource under `(plugin, key)`
    fn insert(&self, plugin: &str, key: &str, resource: Service);

    /// Fetch a resource stored under `(plugin, key)`
    fn get(&self, plugin: &str, key: &str) -> Option<Service>;

    /// Release everything stored for `plugin`, returning how many entries were dropped
    fn unload_plugin(&self, plugin: &str) -> usize;
}

/// The embedding application
pub trait Host: Send + Sync + fmt::Debug {
    /// Application name
    fn name(&self) -> &str;

    /// Suspend work that touches plugins (called before a reload)
    fn pause(&self) {}

    /// Resume work suspended by `pause`
    fn resume(&self) {}
}

/// Background job execution
pub trait WorkerPool: Send + Sync + fmt::Debug {
    /// Queue a job
    fn submit(&self, job: Job);
}

/// Read-only configuration lookup
pub trait ConfigStore: Send + Sync + fmt::Debug {
    /// Fetch the value stored under `key`
    fn get(&self, key: &str) -> Option<serde_json::Value>;
}
