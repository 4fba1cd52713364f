//! Plugin manager: loading, lifecycle and hot reload

use crate::error::{DependencyError, PluginRuntimeError, Result};
use crate::hot_reload::{ChangeCallback, FileChange, FileWatcher, NotifyWatcher, ReloadEvent};
use crate::loader::{read_manifest, DynamicLoader, LoadedPlugin, RetainedUnit, UnitLoader};
use crate::registry::{PluginRegistry, PluginState, PluginStatus};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use weft_plugin_api::{
    ConfigStore, EventBus, Host, Plugin, PluginContext, PluginMetadata, ResourceStore,
    ServiceRegistry, WorkerPool,
};

/// Reload events kept for inspection
const RELOAD_HISTORY: usize = 32;

/// Callback run when a reload starts or finishes
pub type HostCallback = Arc<dyn Fn() + Send + Sync>;

/// Host-side services handed to plugins through their context
///
/// The event bus, service registry and host are required before
/// [`PluginManager::initialize_all`] can run; the rest are optional.
#[derive(Debug, Clone, Default)]
pub struct Collaborators {
    /// Event bus
    pub event_bus: Option<Arc<dyn EventBus>>,

    /// Service registry
    pub services: Option<Arc<dyn ServiceRegistry>>,

    /// Owning host
    pub host: Option<Arc<dyn Host>>,

    /// Resource store
    pub resources: Option<Arc<dyn ResourceStore>>,

    /// Worker pool
    pub workers: Option<Arc<dyn WorkerPool>>,

    /// Configuration store
    pub config: Option<Arc<dyn ConfigStore>>,
}

impl Collaborators {
    /// Wire the three required collaborators
    pub fn new(
        event_bus: Arc<dyn EventBus>,
        services: Arc<dyn ServiceRegistry>,
        host: Arc<dyn Host>,
    ) -> Self {
        Self {
            event_bus: Some(event_bus),
            services: Some(services),
            host: Some(host),
            ..Self::default()
        }
    }

    /// Set resource store
    pub fn with_resources(mut self, resources: Arc<dyn ResourceStore>) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Set worker pool
    pub fn with_workers(mut self, workers: Arc<dyn WorkerPool>) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Set configuration store
    pub fn with_config(mut self, config: Arc<dyn ConfigStore>) -> Self {
        self.config = Some(config);
        self
    }

    fn context_for(&self, plugin: &str) -> Result<PluginContext> {
        let event_bus = self
            .event_bus
            .clone()
            .ok_or(PluginRuntimeError::MissingCollaborator("event bus"))?;
        let services = self
            .services
            .clone()
            .ok_or(PluginRuntimeError::MissingCollaborator("service registry"))?;
        let host = self
            .host
            .clone()
            .ok_or(PluginRuntimeError::MissingCollaborator("host"))?;

        let mut ctx = PluginContext::new(plugin, event_bus, services, host);
        if let Some(resources) = &self.resources {
            ctx = ctx.with_resources(resources.clone());
        }
        if let Some(workers) = &self.workers {
            ctx = ctx.with_workers(workers.clone());
        }
        if let Some(config) = &self.config {
            ctx = ctx.with_config(config.clone());
        }
        Ok(ctx)
    }

    /// Drop every registration tagged with `plugin`
    fn release(&self, plugin: &str) {
        let subscriptions = self
            .event_bus
            .as_ref()
            .map_or(0, |bus| bus.unsubscribe_plugin(plugin));
        let services = self
            .services
            .as_ref()
            .map_or(0, |registry| registry.unregister_plugin(plugin));
        let resources = self
            .resources
            .as_ref()
            .map_or(0, |store| store.unload_plugin(plugin));

        debug!(
            plugin = %plugin,
            subscriptions,
            services,
            resources,
            "Released plugin registrations"
        );
    }
}

#[derive(Clone, Default)]
struct HostHooks {
    pause: Option<HostCallback>,
    resume: Option<HostCallback>,
}

/// Calls the pause hook on creation and the resume hook on drop
struct PauseGuard {
    resume: Option<HostCallback>,
}

impl PauseGuard {
    fn engage(pause: Option<HostCallback>, resume: Option<HostCallback>) -> Self {
        if let Some(pause) = pause {
            debug!("Pausing host for reload");
            pause();
        }
        Self { resume }
    }
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        if let Some(resume) = self.resume.take() {
            debug!("Resuming host after reload");
            resume();
        }
    }
}

/// Held for the duration of one mutating operation
struct OperationGuard<'a> {
    _lock: ReentrantMutexGuard<'a, ()>,
    busy: &'a AtomicBool,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

struct HotReload {
    watcher: Box<dyn FileWatcher>,
    enabled: bool,
}

/// What a reload saved before shutting the affected plugins down
#[derive(Default)]
struct ReloadSession {
    initialized: HashSet<String>,
    states: HashMap<String, String>,
}

/// Plugin manager
///
/// Owns every loaded plugin and drives its lifecycle: loading from disk,
/// initialization in dependency order, hot reload with rollback and
/// unloading. Mutating operations are serialized; lookups can run
/// concurrently with each other and with a reload in progress.
///
/// Plugin callbacks run without any registry lock held, so a plugin may
/// look up other plugins from `initialize` or `shutdown`. Calling a
/// mutating operation from inside a callback fails with
/// [`PluginRuntimeError::Reentrant`].
pub struct PluginManager {
    loader: Arc<dyn UnitLoader>,
    registry: RwLock<PluginRegistry>,
    operation: ReentrantMutex<()>,
    busy: AtomicBool,
    collaborators: RwLock<Collaborators>,
    hooks: RwLock<HostHooks>,
    hot_reload: Mutex<HotReload>,
    history: Mutex<VecDeque<ReloadEvent>>,
    this: Weak<PluginManager>,
}

impl PluginManager {
    /// Create a manager backed by the platform loader
    pub fn new() -> Arc<Self> {
        Self::builder().build()
    }

    /// Start building a manager
    pub fn builder() -> PluginManagerBuilder {
        PluginManagerBuilder::default()
    }

    /// Wire the collaborators handed to plugins
    pub fn set_collaborators(&self, collaborators: Collaborators) {
        *self.collaborators.write() = collaborators;
    }

    /// Currently wired collaborators
    pub fn collaborators(&self) -> Collaborators {
        self.collaborators.read().clone()
    }

    /// Replace the hook run before a reload starts
    ///
    /// Takes precedence over [`Host::pause`].
    pub fn set_pause_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.hooks.write().pause = Some(Arc::new(callback));
    }

    /// Replace the hook run after a reload finishes, successful or not
    ///
    /// Takes precedence over [`Host::resume`].
    pub fn set_resume_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.hooks.write().resume = Some(Arc::new(callback));
    }

    fn begin(&self, operation: &'static str) -> Result<OperationGuard<'_>> {
        let lock = self.operation.lock();
        if self.busy.swap(true, Ordering::AcqRel) {
            warn!(operation, "Rejected re-entrant plugin operation");
            return Err(PluginRuntimeError::Reentrant(operation));
        }
        Ok(OperationGuard {
            _lock: lock,
            busy: &self.busy,
        })
    }

    /// Load the unit at `path` and register it
    ///
    /// Returns the plugin name. The plugin is not initialized; its
    /// dependencies are only checked by [`initialize_all`](Self::initialize_all).
    pub fn load_plugin(&self, path: impl AsRef<Path>) -> Result<String> {
        let _op = self.begin("load_plugin")?;
        self.load_unit(path.as_ref())
    }

    /// Load every plugin unit in `dir`
    ///
    /// Files are visited in path order. A unit that fails to load is
    /// logged and skipped. Returns the number of plugins loaded.
    pub fn load_plugins_from_directory(&self, dir: impl AsRef<Path>) -> usize {
        let dir = dir.as_ref();
        let _op = match self.begin("load_plugins_from_directory") {
            Ok(op) => op,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Directory scan refused");
                return 0;
            }
        };

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Cannot read plugin directory");
                return 0;
            }
        };

        let mut candidates: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && self.loader.is_candidate(path))
            .collect();
        candidates.sort();

        let mut loaded = 0;
        for path in &candidates {
            match self.load_unit(path) {
                Ok(_) => loaded += 1,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping plugin unit");
                }
            }
        }

        info!(
            dir = %dir.display(),
            candidates = candidates.len(),
            loaded,
            "Plugin directory scanned"
        );
        loaded
    }

    fn load_unit(&self, path: &Path) -> Result<String> {
        let manifest = read_manifest(path, &self.loader.describe(path)?)?;
        let name = manifest.metadata.name;

        if self.registry.read().contains(&name) {
            warn!(plugin = %name, path = %path.display(), "A plugin with this name is already loaded");
            return Err(PluginRuntimeError::already_loaded(&name));
        }

        let loaded = self.loader.load(path)?;
        let version = loaded.metadata().version.clone();
        self.install(&name, path, loaded)?;
        self.watch(path);

        info!(plugin = %name, version = %version, path = %path.display(), "Plugin loaded");
        Ok(name)
    }

    /// Initialize every loaded plugin in dependency order
    ///
    /// Plugins that are already initialized are skipped. Stops at the
    /// first plugin whose `initialize` fails; plugins initialized before
    /// it stay initialized.
    pub fn initialize_all(&self) -> Result<()> {
        let _op = self.begin("initialize_all")?;
        let collaborators = self.collaborators.read().clone();
        collaborators.context_for("")?;

        let order = {
            let mut registry = self.registry.write();
            let order = registry.resolver().resolve()?;
            for name in &order {
                if let Some(entry) = registry.get(name) {
                    registry.resolver().validate_metadata(&entry.metadata)?;
                }
            }
            registry.set_order(order.clone());
            order
        };

        info!(plugins = order.len(), order = ?order, "Initializing plugins");
        for name in &order {
            if self.state_of(name) == Some(PluginState::Initialized) {
                continue;
            }
            self.initialize_one(name, &collaborators)?;
        }
        Ok(())
    }

    fn initialize_one(&self, name: &str, collaborators: &Collaborators) -> Result<()> {
        let ctx = collaborators.context_for(name)?;
        let initialized = self
            .with_checked_out(name, |plugin| plugin.initialize(&ctx))
            .map_err(|e| {
                if matches!(e, PluginRuntimeError::PluginPanicked { .. }) {
                    self.set_state(name, PluginState::Failed(e.to_string()));
                    error!(plugin = %name, error = %e, "Plugin panicked during initialization");
                }
                e
            })?;

        if initialized {
            self.set_state(name, PluginState::Initialized);
            info!(plugin = %name, "Plugin initialized");
            Ok(())
        } else {
            self.set_state(name, PluginState::Failed("initialize returned false".to_string()));
            error!(plugin = %name, "Plugin initialization failed");
            Err(PluginRuntimeError::initialization_failed(name))
        }
    }

    /// Replace a plugin's code with the build currently on disk
    ///
    /// The plugin and everything that transitively depends on it are shut
    /// down dependents first, unloaded, loaded again and initialized
    /// dependencies first, with their serialized state handed back. The
    /// host is paused for the duration.
    ///
    /// If anything fails, the previous builds and states are restored and
    /// [`PluginRuntimeError::RolledBack`] is returned. Plugins that cannot
    /// be restored are unloaded and listed in
    /// [`PluginRuntimeError::ReloadFailed`].
    pub fn reload_plugin(&self, name: &str) -> Result<()> {
        let _op = self.begin("reload_plugin")?;

        let affected = {
            let registry = self.registry.read();
            if !registry.contains(name) {
                return Err(PluginRuntimeError::not_found(name));
            }
            let closure = registry.resolver().dependents_closure(name);
            registry.resolver().order_subset(&closure)
        };
        info!(plugin = %name, affected = ?affected, "Reloading plugin");

        let started = Instant::now();
        let outcome = {
            let _paused = self.pause_host();
            self.swap_builds(name, &affected)
        };

        self.record(ReloadEvent::new(name, &affected, started.elapsed(), &outcome));
        outcome
    }

    fn pause_host(&self) -> PauseGuard {
        let hooks = self.hooks.read().clone();
        let host = self.collaborators.read().host.clone();

        let pause = hooks.pause.or_else(|| {
            host.clone()
                .map(|host| Arc::new(move || host.pause()) as HostCallback)
        });
        let resume = hooks
            .resume
            .or_else(|| host.map(|host| Arc::new(move || host.resume()) as HostCallback));
        PauseGuard::engage(pause, resume)
    }

    fn swap_builds(&self, target: &str, affected: &[String]) -> Result<()> {
        let collaborators = self.collaborators.read().clone();
        let mut session = ReloadSession::default();

        for name in affected.iter().rev() {
            if self.state_of(name) == Some(PluginState::Initialized) {
                let state = self
                    .with_checked_out(name, |plugin| {
                        plugin.on_before_reload();
                        let state = plugin.serialize_state();
                        plugin.shutdown();
                        Some(state)
                    })
                    .unwrap_or_else(|e| {
                        warn!(plugin = %name, error = %e, "Shutdown for reload failed, state dropped");
                        None
                    });
                self.set_state(name, PluginState::Loaded);
                session.initialized.insert(name.clone());
                if let Some(state) = state.filter(|state| !state.is_empty()) {
                    session.states.insert(name.clone(), state);
                }
                debug!(plugin = %name, "Plugin shut down for reload");
            }
            collaborators.release(name);
        }

        let retained: Vec<RetainedUnit> = affected
            .iter()
            .filter_map(|name| self.unload_for_reload(name))
            .collect();

        match self.bring_up(&retained, &session, &collaborators) {
            Ok(()) => {
                for unit in &retained {
                    if let Some(snapshot) = &unit.snapshot {
                        self.loader.release_snapshot(snapshot);
                    }
                }
                info!(plugin = %target, reloaded = retained.len(), "Plugin reloaded");
                Ok(())
            }
            Err(reason) => self.roll_back(target, &retained, &session, &collaborators, reason),
        }
    }

    fn unload_for_reload(&self, name: &str) -> Option<RetainedUnit> {
        let (loaded, path, metadata) = {
            let mut registry = self.registry.write();
            let entry = registry.get_mut(name)?;
            (entry.loaded.take(), entry.path.clone(), entry.metadata.clone())
        };

        match loaded {
            Some(mut loaded) => {
                let unit = loaded.retain();
                self.loader.unload(&mut loaded);
                debug!(plugin = %name, "Plugin unit unloaded for reload");
                Some(unit)
            }
            None => Some(RetainedUnit {
                path,
                snapshot: None,
                metadata,
            }),
        }
    }

    fn bring_up(
        &self,
        units: &[RetainedUnit],
        session: &ReloadSession,
        collaborators: &Collaborators,
    ) -> Result<()> {
        for unit in units {
            let loaded = self.loader.load(&unit.path)?;
            self.install(&unit.metadata.name, &unit.path, loaded)?;
        }

        {
            let registry = self.registry.read();
            for unit in units {
                if let Some(entry) = registry.get(&unit.metadata.name) {
                    registry.resolver().validate_metadata(&entry.metadata)?;
                }
            }
        }

        for unit in units {
            self.revive(&unit.metadata.name, session, collaborators)?;
        }
        Ok(())
    }

    /// Initialize a plugin that was running before the reload and hand its
    /// state back
    fn revive(
        &self,
        name: &str,
        session: &ReloadSession,
        collaborators: &Collaborators,
    ) -> Result<()> {
        if !session.initialized.contains(name) {
            return Ok(());
        }

        self.initialize_one(name, collaborators)?;
        let state = session.states.get(name);
        self.with_checked_out(name, |plugin| {
            if let Some(state) = state {
                plugin.deserialize_state(state);
            }
            plugin.on_after_reload();
        })
    }

    fn roll_back(
        &self,
        target: &str,
        retained: &[RetainedUnit],
        session: &ReloadSession,
        collaborators: &Collaborators,
        reason: PluginRuntimeError,
    ) -> Result<()> {
        warn!(plugin = %target, error = %reason, "Reload failed, restoring previous builds");

        for unit in retained.iter().rev() {
            let name = &unit.metadata.name;
            if self.state_of(name) == Some(PluginState::Initialized) {
                if let Err(e) = self.with_checked_out(name, |plugin| plugin.shutdown()) {
                    warn!(plugin = %name, error = %e, "Rejected build failed to shut down");
                }
                self.set_state(name, PluginState::Loaded);
            }
            collaborators.release(name);

            let failed = self
                .registry
                .write()
                .get_mut(name)
                .and_then(|entry| entry.loaded.take());
            if let Some(mut failed) = failed {
                self.loader.discard(&mut failed);
            }
        }

        let mut lost: Vec<String> = Vec::new();
        for unit in retained {
            let name = &unit.metadata.name;
            let orphaned_by = unit
                .metadata
                .required_dependencies()
                .find(|dep| lost.contains(&dep.plugin_name))
                .map(|dep| dep.plugin_name.clone());

            let restored = match orphaned_by {
                Some(dependency) => Err(DependencyError::missing(name, dependency).into()),
                None => self.restore_unit(unit, session, collaborators),
            };

            match restored {
                Ok(()) => debug!(plugin = %name, "Previous build restored"),
                Err(e) => {
                    error!(plugin = %name, error = %e, "Cannot restore previous build, unloading plugin");
                    self.evict(name, unit, collaborators);
                    lost.push(name.clone());
                }
            }
        }

        if lost.is_empty() {
            info!(plugin = %target, "Reload rolled back");
            Err(PluginRuntimeError::RolledBack {
                plugin: target.to_string(),
                reason: reason.to_string(),
            })
        } else {
            error!(plugin = %target, unloaded = ?lost, "Reload rollback incomplete");
            Err(PluginRuntimeError::ReloadFailed {
                plugin: target.to_string(),
                reason: reason.to_string(),
                unloaded: lost,
            })
        }
    }

    fn restore_unit(
        &self,
        unit: &RetainedUnit,
        session: &ReloadSession,
        collaborators: &Collaborators,
    ) -> Result<()> {
        let loaded = self.loader.restore(unit)?;
        self.install(&unit.metadata.name, &unit.path, loaded)?;
        self.revive(&unit.metadata.name, session, collaborators)
    }

    fn evict(&self, name: &str, unit: &RetainedUnit, collaborators: &Collaborators) {
        collaborators.release(name);
        let entry = self.registry.write().remove(name);
        if let Some(mut entry) = entry {
            self.unwatch(&entry.path);
            if let Some(mut loaded) = entry.loaded.take() {
                self.loader.discard(&mut loaded);
            }
        }
        if let Some(snapshot) = &unit.snapshot {
            self.loader.release_snapshot(snapshot);
        }
    }

    /// Register `loaded` under `expected`, refusing a build that reports
    /// another name
    fn install(&self, expected: &str, path: &Path, mut loaded: LoadedPlugin) -> Result<()> {
        if loaded.metadata().name != expected {
            let found = loaded.metadata().name.clone();
            self.loader.discard(&mut loaded);
            return Err(PluginRuntimeError::IdentityChanged {
                expected: expected.to_string(),
                found,
            });
        }
        self.registry.write().install(path, loaded);
        Ok(())
    }

    fn record(&self, event: ReloadEvent) {
        let mut history = self.history.lock();
        if history.len() == RELOAD_HISTORY {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Shut down and unload one plugin
    ///
    /// Returns false if no plugin by that name is loaded.
    pub fn unload_plugin(&self, name: &str) -> bool {
        let _op = match self.begin("unload_plugin") {
            Ok(op) => op,
            Err(e) => {
                warn!(plugin = %name, error = %e, "Unload refused");
                return false;
            }
        };
        self.remove_plugin(name)
    }

    /// Shut down and unload every plugin, dependents first
    pub fn unload_all(&self) {
        let _op = match self.begin("unload_all") {
            Ok(op) => op,
            Err(e) => {
                warn!(error = %e, "Unload refused");
                return;
            }
        };

        let order = self.registry.read().order().to_vec();
        for name in order.iter().rev() {
            self.remove_plugin(name);
        }
        info!(plugins = order.len(), "All plugins unloaded");
    }

    fn remove_plugin(&self, name: &str) -> bool {
        let dependents = {
            let registry = self.registry.read();
            if !registry.contains(name) {
                return false;
            }
            registry.resolver().get_dependents(name)
        };
        if !dependents.is_empty() {
            warn!(plugin = %name, dependents = ?dependents, "Unloading a plugin other plugins depend on");
        }

        let collaborators = self.collaborators.read().clone();
        if self.state_of(name) == Some(PluginState::Initialized) {
            match self.with_checked_out(name, |plugin| plugin.shutdown()) {
                Ok(()) => info!(plugin = %name, "Plugin shut down"),
                Err(e) => warn!(plugin = %name, error = %e, "Plugin shutdown failed"),
            }
            self.set_state(name, PluginState::Loaded);
        }
        collaborators.release(name);

        let entry = self.registry.write().remove(name);
        if let Some(mut entry) = entry {
            self.unwatch(&entry.path);
            if let Some(mut loaded) = entry.loaded.take() {
                self.loader.discard(&mut loaded);
            }
        }

        info!(plugin = %name, "Plugin unloaded");
        true
    }

    /// Watch every loaded plugin's file and reload on change
    ///
    /// Calling this while hot reload is already enabled does nothing.
    pub fn enable_hot_reload(&self, poll_interval: Duration) -> Result<()> {
        let mut hot = self.hot_reload.lock();
        if hot.enabled {
            debug!("Hot reload already enabled");
            return Ok(());
        }

        hot.watcher.set_poll_interval(poll_interval);
        let paths = self.registry.read().watched_paths();
        for path in &paths {
            hot.watcher.add_watch(path, self.change_callback())?;
        }
        hot.watcher.start()?;
        hot.enabled = true;

        info!(interval = ?poll_interval, plugins = paths.len(), "Hot reload enabled");
        Ok(())
    }

    /// Stop watching plugin files
    pub fn disable_hot_reload(&self) {
        let mut hot = self.hot_reload.lock();
        if !hot.enabled {
            return;
        }

        hot.watcher.stop();
        for path in self.registry.read().watched_paths() {
            hot.watcher.remove_watch(&path);
        }
        hot.enabled = false;
        info!("Hot reload disabled");
    }

    /// Whether plugin files are being watched
    pub fn is_hot_reload_enabled(&self) -> bool {
        self.hot_reload.lock().enabled
    }

    fn watch(&self, path: &Path) {
        let mut hot = self.hot_reload.lock();
        if !hot.enabled {
            return;
        }
        if let Err(e) = hot.watcher.add_watch(path, self.change_callback()) {
            warn!(path = %path.display(), error = %e, "Cannot watch plugin file");
        }
    }

    fn unwatch(&self, path: &Path) {
        let mut hot = self.hot_reload.lock();
        if hot.enabled {
            hot.watcher.remove_watch(path);
        }
    }

    fn change_callback(&self) -> ChangeCallback {
        let manager = self.this.clone();
        Arc::new(move |path: &Path, change: FileChange| {
            if let Some(manager) = manager.upgrade() {
                manager.on_file_changed(path, change);
            }
        })
    }

    fn on_file_changed(&self, path: &Path, change: FileChange) {
        if change == FileChange::Deleted {
            debug!(path = %path.display(), "Plugin file removed, keeping the running build");
            return;
        }

        let target = self
            .registry
            .read()
            .entry_at(path)
            .map(|entry| (entry.metadata.name.clone(), entry.fingerprint.clone()));
        let Some((name, fingerprint)) = target else {
            return;
        };

        let current = self.loader.fingerprint(path);
        if current.is_some() && current == fingerprint {
            debug!(plugin = %name, "Plugin file unchanged");
            return;
        }

        info!(plugin = %name, path = %path.display(), change = ?change, "Plugin file changed");
        if let Err(e) = self.reload_plugin(&name) {
            error!(plugin = %name, error = %e, "Hot reload failed");
        }
    }

    /// Borrow a plugin as its concrete type
    ///
    /// `None` if the plugin is missing, is a different type or is in the
    /// middle of one of its own callbacks. `f` must not call mutating
    /// manager operations.
    pub fn with_plugin<T: Plugin, R>(&self, name: &str, f: impl FnOnce(&T) -> R) -> Option<R> {
        let registry = self.registry.read_recursive();
        let plugin = registry.get(name)?.loaded.as_ref()?.plugin()?;
        plugin.downcast_ref::<T>().map(f)
    }

    /// Borrow a plugin mutably as its concrete type
    ///
    /// Holds the registry exclusively while `f` runs; `f` must not call
    /// back into the manager.
    pub fn with_plugin_mut<T: Plugin, R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let mut registry = self.registry.write();
        let plugin = registry.get_mut(name)?.loaded.as_mut()?.plugin_mut()?;
        plugin.downcast_mut::<T>().map(f)
    }

    /// Borrow a plugin through its trait object
    pub fn with_plugin_dyn<R>(&self, name: &str, f: impl FnOnce(&dyn Plugin) -> R) -> Option<R> {
        let registry = self.registry.read_recursive();
        let plugin = registry.get(name)?.loaded.as_ref()?.plugin()?;
        Some(f(plugin))
    }

    /// Metadata of a loaded plugin
    pub fn plugin_metadata(&self, name: &str) -> Option<PluginMetadata> {
        self.registry
            .read_recursive()
            .get(name)
            .map(|entry| entry.metadata.clone())
    }

    /// Lifecycle state of a loaded plugin
    pub fn plugin_state(&self, name: &str) -> Option<PluginState> {
        self.state_of(name)
    }

    /// Point-in-time view of a loaded plugin
    pub fn plugin_status(&self, name: &str) -> Option<PluginStatus> {
        self.registry.read_recursive().get(name).map(|entry| entry.status())
    }

    /// Whether a plugin by that name is loaded
    pub fn is_loaded(&self, name: &str) -> bool {
        self.registry.read_recursive().contains(name)
    }

    /// Whether a plugin is loaded and initialized
    pub fn is_initialized(&self, name: &str) -> bool {
        self.registry
            .read_recursive()
            .get(name)
            .map_or(false, |entry| entry.is_initialized())
    }

    /// Names of loaded plugins, in load order
    pub fn loaded_plugins(&self) -> Vec<String> {
        self.registry.read_recursive().order().to_vec()
    }

    /// Number of loaded plugins
    pub fn plugin_count(&self) -> usize {
        self.registry.read_recursive().len()
    }

    /// Direct dependents of a loaded plugin
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.registry.read_recursive().resolver().get_dependents(name)
    }

    /// Most recent reloads, oldest first
    pub fn recent_reloads(&self) -> Vec<ReloadEvent> {
        self.history.lock().iter().cloned().collect()
    }

    fn state_of(&self, name: &str) -> Option<PluginState> {
        self.registry
            .read_recursive()
            .get(name)
            .map(|entry| entry.state.clone())
    }

    fn set_state(&self, name: &str, state: PluginState) {
        if let Some(entry) = self.registry.write().get_mut(name) {
            entry.state = state;
        }
    }

    /// Run `f` on a plugin with the registry unlocked
    ///
    /// The instance is taken out of its entry for the duration, so lookups
    /// from inside `f` see it as unavailable. A panic in `f` is caught and
    /// returned as [`PluginRuntimeError::PluginPanicked`]; the instance goes
    /// back into its entry either way.
    fn with_checked_out<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut (dyn Plugin + 'static)) -> R,
    ) -> Result<R> {
        let mut loaded = self
            .registry
            .write()
            .get_mut(name)
            .and_then(|entry| entry.loaded.take())
            .ok_or_else(|| PluginRuntimeError::not_found(name))?;
        let result = match loaded.plugin_mut() {
            Some(plugin) => panic::catch_unwind(AssertUnwindSafe(move || f(plugin)))
                .map_err(|payload| PluginRuntimeError::panicked(name, payload.as_ref())),
            None => Err(PluginRuntimeError::not_found(name)),
        };

        let orphan = {
            let mut registry = self.registry.write();
            match registry.get_mut(name) {
                Some(entry) => {
                    entry.loaded = Some(loaded);
                    None
                }
                None => Some(loaded),
            }
        };
        if let Some(mut orphan) = orphan {
            self.loader.discard(&mut orphan);
        }
        result
    }
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManager")
            .field("loader", &self.loader)
            .field("plugins", &self.loaded_plugins())
            .field("hot_reload", &self.is_hot_reload_enabled())
            .finish()
    }
}

impl Drop for PluginManager {
    fn drop(&mut self) {
        self.disable_hot_reload();
        self.unload_all();
    }
}

/// Builder for [`PluginManager`]
#[derive(Default)]
pub struct PluginManagerBuilder {
    loader: Option<Arc<dyn UnitLoader>>,
    watcher: Option<Box<dyn FileWatcher>>,
    collaborators: Collaborators,
    hooks: HostHooks,
}

impl PluginManagerBuilder {
    /// Set unit loader; defaults to [`DynamicLoader`]
    pub fn loader(mut self, loader: impl UnitLoader + 'static) -> Self {
        self.loader = Some(Arc::new(loader));
        self
    }

    /// Set file watcher; defaults to [`NotifyWatcher`]
    pub fn watcher(mut self, watcher: impl FileWatcher + 'static) -> Self {
        self.watcher = Some(Box::new(watcher));
        self
    }

    /// Set all collaborators at once
    pub fn collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    /// Set event bus
    pub fn event_bus(mut self, event_bus: Arc<dyn EventBus>) -> Self {
        self.collaborators.event_bus = Some(event_bus);
        self
    }

    /// Set service registry
    pub fn services(mut self, services: Arc<dyn ServiceRegistry>) -> Self {
        self.collaborators.services = Some(services);
        self
    }

    /// Set owning host
    pub fn host(mut self, host: Arc<dyn Host>) -> Self {
        self.collaborators.host = Some(host);
        self
    }

    /// Set resource store
    pub fn resources(mut self, resources: Arc<dyn ResourceStore>) -> Self {
        self.collaborators.resources = Some(resources);
        self
    }

    /// Set worker pool
    pub fn workers(mut self, workers: Arc<dyn WorkerPool>) -> Self {
        self.collaborators.workers = Some(workers);
        self
    }

    /// Set configuration store
    pub fn config_store(mut self, config: Arc<dyn ConfigStore>) -> Self {
        self.collaborators.config = Some(config);
        self
    }

    /// Set pause callback
    pub fn on_pause(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.pause = Some(Arc::new(callback));
        self
    }

    /// Set resume callback
    pub fn on_resume(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.resume = Some(Arc::new(callback));
        self
    }

    /// Build the manager
    pub fn build(self) -> Arc<PluginManager> {
        let loader = self
            .loader
            .unwrap_or_else(|| Arc::new(DynamicLoader::new()));
        let watcher = self
            .watcher
            .unwrap_or_else(|| Box::new(NotifyWatcher::default()));

        Arc::new_cyclic(|this| PluginManager {
            loader,
            registry: RwLock::new(PluginRegistry::default()),
            operation: ReentrantMutex::new(()),
            busy: AtomicBool::new(false),
            collaborators: RwLock::new(self.collaborators),
            hooks: RwLock::new(self.hooks),
            hot_reload: Mutex::new(HotReload {
                watcher,
                enabled: false,
            }),
            history: Mutex::new(VecDeque::with_capacity(RELOAD_HISTORY)),
            this: this.clone(),
        })
    }
}

impl fmt::Debug for PluginManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManagerBuilder")
            .field("loader", &self.loader)
            .field("watcher", &self.watcher)
            .field("collaborators", &self.collaborators)
            .finish()
    }
}
