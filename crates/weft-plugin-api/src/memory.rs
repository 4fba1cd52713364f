//! In-process collaborator implementations
//!
//! Good enough for the CLI host and for tests; real applications are
//! expected to bring their own.

use crate::host::{ConfigStore, EventBus, EventHandler, Host, ResourceStore, Service, ServiceRegistry};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

struct Subscription {
    plugin: String,
    topic: String,
    handler: EventHandler,
}

/// Synchronous in-memory event bus
#[derive(Default)]
pub struct InMemoryEventBus {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl fmt::Debug for InMemoryEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryEventBus")
            .field("subscriptions", &self.subscriptions.read().len())
            .finish()
    }
}

impl InMemoryEventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions owned by `plugin`
    pub fn subscription_count(&self, plugin: &str) -> usize {
        self.subscriptions
            .read()
            .iter()
            .filter(|s| s.plugin == plugin)
            .count()
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(&self, topic: &str, payload: &serde_json::Value) -> usize {
        // Handlers may subscribe or publish themselves; never call them under the lock.
        let handlers: Vec<EventHandler> = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.topic == topic)
            .map(|s| s.handler.clone())
            .collect();

        for handler in &handlers {
            handler(topic, payload);
        }
        handlers.len()
    }

    fn subscribe(&self, plugin: &str, topic: &str, handler: EventHandler) {
        self.subscriptions.write().push(Subscription {
            plugin: plugin.to_string(),
            topic: topic.to_string(),
            handler,
        });
    }

    fn unsubscribe_plugin(&self, plugin: &str) -> usize {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.plugin != plugin);
        before - subscriptions.len()
    }
}

/// Concurrent name-keyed service registry
#[derive(Default)]
pub struct InMemoryServiceRegistry {
    services: DashMap<String, (String, Service)>,
}

impl fmt::Debug for InMemoryServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryServiceRegistry")
            .field("services", &self.services.len())
            .finish()
    }
}

impl InMemoryServiceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered services
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether no services are registered
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl ServiceRegistry for InMemoryServiceRegistry {
    fn register(&self, plugin: &str, name: &str, service: Service) {
        self.services
            .insert(name.to_string(), (plugin.to_string(), service));
    }

    fn resolve(&self, name: &str) -> Option<Service> {
        self.services.get(name).map(|entry| entry.value().1.clone())
    }

    fn unregister_plugin(&self, plugin: &str) -> usize {
        let before = self.services.len();
        self.services.retain(|_, (owner, _)| owner.as_str() != plugin);
        before - self.services.len()
    }
}

/// Concurrent per-plugin resource store
#[derive(Default)]
pub struct InMemoryResourceStore {
    resources: DashMap<(String, String), Service>,
}

impl fmt::Debug for InMemoryResourceStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryResourceStore")
            .field("resources", &self.resources.len())
            .finish()
    }
}

impl InMemoryResourceStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResourceStore for InMemoryResourceStore {
    fn insert(&self, plugin: &str, key: &str, resource: Service) {
        self.resources
            .insert((plugin.to_string(), key.to_string()), resource);
    }

    fn get(&self, plugin: &str, key: &str) -> Option<Service> {
        self.resources
            .get(&(plugin.to_string(), key.to_string()))
            .map(|entry| entry.value().clone())
    }

    fn unload_plugin(&self, plugin: &str) -> usize {
        let before = self.resources.len();
        self.resources.retain(|(owner, _), _| owner.as_str() != plugin);
        before - self.resources.len()
    }
}

/// Host that only tracks whether it is paused
#[derive(Debug)]
pub struct PausableHost {
    name: String,
    paused: AtomicBool,
    pauses: AtomicUsize,
    resumes: AtomicUsize,
}

impl PausableHost {
    /// Create a running host
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            paused: AtomicBool::new(false),
            pauses: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
        }
    }

    /// Whether the host is currently paused
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Number of times `pause` was called
    pub fn pause_count(&self) -> usize {
        self.pauses.load(Ordering::Acquire)
    }

    /// Number of times `resume` was called
    pub fn resume_count(&self) -> usize {
        self.resumes.load(Ordering::Acquire)
    }
}

impl Host for PausableHost {
    fn name(&self) -> &str {
        &self.name
    }

    fn pause(&self) {
        self.pauses.fetch_add(1, Ordering::AcqRel);
        self.paused.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.resumes.fetch_add(1, Ordering::AcqRel);
        self.paused.store(false, Ordering::Release);
    }
}

/// Configuration store backed by a JSON object
#[derive(Debug, Clone, Default)]
pub struct JsonConfigStore {
    values: serde_json::Map<String, serde_json::Value>,
}

impl JsonConfigStore {
    /// Wrap a JSON value; anything but an object yields an empty store
    pub fn new(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(values) => Self { values },
            _ => Self::default(),
        }
    }
}

impl ConfigStore for JsonConfigStore {
    // Dotted keys walk nested objects: `counter.step`.
    fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut parts = key.split('.');
        let mut current = self.values.get(parts.next()?)?;
        for part in parts {
            current = current.get(part)?;
        }
        Some(current.clone())
    }
}
