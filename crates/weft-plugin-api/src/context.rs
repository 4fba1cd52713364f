//! Context handed to plugins on initialization

use crate::host::{ConfigStore, EventBus, Host, ResourceStore, ServiceRegistry, WorkerPool};
use std::sync::Arc;

/// Everything a plugin may use while it is initialized
///
/// The event bus, service registry and host are always present. The
/// resource store, worker pool and configuration store are optional.
#[derive(Debug, Clone)]
pub struct PluginContext {
    plugin_name: String,
    event_bus: Arc<dyn EventBus>,
    services: Arc<dyn ServiceRegistry>,
    host: Arc<dyn Host>,
    resources: Option<Arc<dyn ResourceStore>>,
    workers: Option<Arc<dyn WorkerPool>>,
    config: Option<Arc<dyn ConfigStore>>,
}

impl PluginContext {
    /// Create a context with the required collaborators
    pub fn new(
        plugin_name: impl Into<String>,
        event_bus: Arc<dyn EventBus>,
        services: Arc<dyn ServiceRegistry>,
        host: Arc<dyn Host>,
    ) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            event_bus,
            services,
            host,
            resources: None,
            workers: None,
            config: None,
        }
    }

    /// Attach a resource store
    pub fn with_resources(mut self, resources: Arc<dyn ResourceStore>) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Attach a worker pool
    pub fn with_workers(mut self, workers: Arc<dyn WorkerPool>) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Attach a configuration store
    pub fn with_config(mut self, config: Arc<dyn ConfigStore>) -> Self {
        self.config = Some(config);
        self
    }

    /// Name of the plugin this context was built for
    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// Event bus
    pub fn event_bus(&self) -> &Arc<dyn EventBus> {
        &self.event_bus
    }

    /// Service registry
    pub fn services(&self) -> &Arc<dyn ServiceRegistry> {
        &self.services
    }

    /// Host application
    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    /// Resource store, if the host provides one
    pub fn resources(&self) -> Option<&Arc<dyn ResourceStore>> {
        self.resources.as_ref()
    }

    /// Worker pool, if the host provides one
    pub fn workers(&self) -> Option<&Arc<dyn WorkerPool>> {
        self.workers.as_ref()
    }

    /// Configuration store, if the host provides one
    pub fn config(&self) -> Option<&Arc<dyn ConfigStore>> {
        self.config.as_ref()
    }

    /// Subscribe to `topic` on behalf of this plugin
    pub fn subscribe(
        &self,
        topic: &str,
        handler: impl Fn(&str, &serde_json::Value) + Send + Sync + 'static,
    ) {
        self.event_bus
            .subscribe(&self.plugin_name, topic, Arc::new(handler));
    }

    /// Register a service owned by this plugin
    pub fn provide(&self, name: &str, service: crate::host::Service) {
        self.services.register(&self.plugin_name, name, service);
    }
}
