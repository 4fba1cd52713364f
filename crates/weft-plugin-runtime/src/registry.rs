//! Registry of loaded plugins and their lifecycle state

use crate::loader::LoadedPlugin;
use crate::resolver::DependencyResolver;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use weft_plugin_api::PluginMetadata;

/// Plugin state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginState {
    /// Loaded but not initialized
    Loaded,

    /// `initialize` succeeded
    Initialized,

    /// `initialize` returned false
    Failed(String),
}

/// One registered plugin
///
/// `loaded` is `None` while the instance is checked out for a callback or
/// between unload and reload during a hot reload.
pub(crate) struct PluginEntry {
    pub(crate) loaded: Option<LoadedPlugin>,
    pub(crate) metadata: PluginMetadata,
    pub(crate) path: PathBuf,
    pub(crate) state: PluginState,
    pub(crate) fingerprint: Option<String>,
    pub(crate) loaded_at: Instant,
}

impl PluginEntry {
    pub(crate) fn new(path: &Path, loaded: LoadedPlugin) -> Self {
        Self {
            metadata: loaded.metadata().clone(),
            fingerprint: loaded.fingerprint().map(str::to_string),
            path: path.to_path_buf(),
            state: PluginState::Loaded,
            loaded_at: Instant::now(),
            loaded: Some(loaded),
        }
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.state == PluginState::Initialized
    }

    pub(crate) fn status(&self) -> PluginStatus {
        PluginStatus {
            metadata: self.metadata.clone(),
            path: self.path.clone(),
            state: self.state.clone(),
            fingerprint: self.fingerprint.clone(),
            uptime: self.loaded_at.elapsed(),
        }
    }
}

/// Point-in-time view of a registered plugin
#[derive(Debug, Clone)]
pub struct PluginStatus {
    /// Metadata of the running build
    pub metadata: PluginMetadata,

    /// Path the plugin was loaded from
    pub path: PathBuf,

    /// Lifecycle state
    pub state: PluginState,

    /// Content fingerprint of the running build
    pub fingerprint: Option<String>,

    /// Time since the running build was loaded
    pub uptime: Duration,
}

/// Name-keyed entries plus the dependency graph built from them
#[derive(Default)]
pub(crate) struct PluginRegistry {
    entries: HashMap<String, PluginEntry>,
    resolver: DependencyResolver,
    order: Vec<String>,
}

impl PluginRegistry {
    pub(crate) fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub(crate) fn get(&self, name: &str) -> Option<&PluginEntry> {
        self.entries.get(name)
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut PluginEntry> {
        self.entries.get_mut(name)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    /// Register a fresh entry, or swap a new build into an existing one
    pub(crate) fn install(&mut self, path: &Path, loaded: LoadedPlugin) {
        let name = loaded.metadata().name.clone();
        self.resolver.add_plugin(loaded.metadata());
        match self.entries.get_mut(&name) {
            Some(entry) => {
                entry.metadata = loaded.metadata().clone();
                entry.fingerprint = loaded.fingerprint().map(str::to_string);
                entry.state = PluginState::Loaded;
                entry.loaded_at = Instant::now();
                entry.loaded = Some(loaded);
            }
            None => {
                self.entries.insert(name, PluginEntry::new(path, loaded));
            }
        }
        self.refresh_order();
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<PluginEntry> {
        let entry = self.entries.remove(name)?;
        self.resolver.remove_plugin(name);
        self.refresh_order();
        Some(entry)
    }

    /// Names in resolved order, or registration order while the graph
    /// cannot be resolved
    pub(crate) fn order(&self) -> &[String] {
        &self.order
    }

    pub(crate) fn set_order(&mut self, order: Vec<String>) {
        self.order = order;
    }

    pub(crate) fn entry_at(&self, path: &Path) -> Option<&PluginEntry> {
        self.entries.values().find(|entry| entry.path == path)
    }

    pub(crate) fn watched_paths(&self) -> Vec<PathBuf> {
        self.order
            .iter()
            .filter_map(|name| self.entries.get(name))
            .map(|entry| entry.path.clone())
            .collect()
    }

    fn refresh_order(&mut self) {
        self.order = self
            .resolver
            .resolve()
            .unwrap_or_else(|_| self.resolver.plugin_names());
    }
}
