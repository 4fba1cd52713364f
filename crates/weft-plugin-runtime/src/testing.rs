//! In-process stand-ins for native units and file watching
//!
//! [`StaticLoader`] serves plugins from factories registered per path, so
//! the full [`PluginManager`](crate::PluginManager) lifecycle, hot reload
//! and rollback included, can be driven without compiling shared
//! libraries. Installing a new [`StaticUnit`] at a path plays the part of
//! a rebuild.

use crate::error::{LoadError, PluginRuntimeError, Result};
use crate::hot_reload::{ChangeCallback, FileChange, FileWatcher};
use crate::loader::{read_manifest, LoadedPlugin, PluginInstance, RetainedUnit, UnitLoader};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use weft_plugin_api::ffi::PluginBox;
use weft_plugin_api::{Plugin, PluginContext, PluginManifest, PluginMetadata};

/// Creates one plugin instance
pub type PluginFactory = Arc<dyn Fn() -> PluginBox + Send + Sync>;

/// One build of a unit: manifest text plus instance factory
#[derive(Clone)]
pub struct StaticUnit {
    manifest: String,
    factory: PluginFactory,
}

impl StaticUnit {
    /// Build whose manifest is generated from `metadata`
    pub fn new(
        metadata: &PluginMetadata,
        factory: impl Fn() -> PluginBox + Send + Sync + 'static,
    ) -> Self {
        let manifest = PluginManifest::new(metadata.clone())
            .to_json()
            .unwrap_or_default();
        Self::with_manifest(manifest, factory)
    }

    /// Build with hand-written manifest text
    pub fn with_manifest(
        manifest: impl Into<String>,
        factory: impl Fn() -> PluginBox + Send + Sync + 'static,
    ) -> Self {
        Self {
            manifest: manifest.into(),
            factory: Arc::new(factory),
        }
    }

    /// Build producing [`ScriptedPlugin`]s that report to `journal`
    pub fn scripted(metadata: PluginMetadata, journal: &Journal) -> Self {
        Self::from_script(metadata, journal, Script::default())
    }

    /// Build whose instances refuse to initialize
    pub fn failing(metadata: PluginMetadata, journal: &Journal) -> Self {
        Self::from_script(
            metadata,
            journal,
            Script {
                fail_initialize: true,
                ..Script::default()
            },
        )
    }

    /// Build producing [`ScriptedPlugin`]s that run `hook` inside `initialize`
    pub fn with_hook(
        metadata: PluginMetadata,
        journal: &Journal,
        hook: impl Fn(&PluginContext) + Send + Sync + 'static,
    ) -> Self {
        Self::from_script(
            metadata,
            journal,
            Script {
                on_initialize: Some(Arc::new(hook)),
                ..Script::default()
            },
        )
    }

    fn from_script(metadata: PluginMetadata, journal: &Journal, script: Script) -> Self {
        let journal = journal.clone();
        let manifest_metadata = metadata.clone();
        Self::new(&manifest_metadata, move || -> PluginBox {
            Box::new(ScriptedPlugin::new(
                metadata.clone(),
                journal.clone(),
                script.clone(),
            ))
        })
    }
}

impl fmt::Debug for StaticUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticUnit")
            .field("manifest", &self.manifest)
            .finish()
    }
}

#[derive(Debug, Default)]
struct StaticState {
    current: HashMap<PathBuf, u64>,
    builds: HashMap<u64, StaticUnit>,
    next_build: u64,
}

/// Loader serving [`StaticUnit`]s registered by path
///
/// Every install gets a new build number, which doubles as the
/// fingerprint. Earlier builds stay restorable until
/// [`forget_previous_builds`](Self::forget_previous_builds) is called.
#[derive(Debug, Clone, Default)]
pub struct StaticLoader {
    state: Arc<Mutex<StaticState>>,
}

impl StaticLoader {
    /// Create an empty loader
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `unit` the build at `path`; returns its build number
    pub fn install(&self, path: impl Into<PathBuf>, unit: StaticUnit) -> u64 {
        let mut state = self.state.lock();
        state.next_build += 1;
        let build = state.next_build;
        state.builds.insert(build, unit);
        state.current.insert(path.into(), build);
        build
    }

    /// Remove whatever is at `path`, as if the file were deleted
    pub fn remove(&self, path: &Path) {
        self.state.lock().current.remove(path);
    }

    /// Drop every build that is not current at some path
    pub fn forget_previous_builds(&self) {
        let mut state = self.state.lock();
        let StaticState {
            current, builds, ..
        } = &mut *state;
        builds.retain(|build, _| current.values().any(|b| b == build));
    }

    fn current(&self, path: &Path) -> Option<(u64, StaticUnit)> {
        let state = self.state.lock();
        let build = *state.current.get(path)?;
        state.builds.get(&build).map(|unit| (build, unit.clone()))
    }

    fn snapshot_path(path: &Path, build: u64) -> PathBuf {
        PathBuf::from(format!("{}#build-{build}", path.display()))
    }

    fn build_of(snapshot: &Path) -> Option<u64> {
        let text = snapshot.to_str()?;
        let (_, build) = text.rsplit_once("#build-")?;
        build.parse().ok()
    }

    fn instantiate(path: &Path, build: u64, unit: &StaticUnit) -> std::result::Result<LoadedPlugin, LoadError> {
        let manifest = read_manifest(path, &unit.manifest)?;
        let instance = PluginInstance::from_boxed((unit.factory)());
        Ok(
            LoadedPlugin::new(path, manifest.metadata, instance, None)
                .with_snapshot(Self::snapshot_path(path, build))
                .with_fingerprint(build.to_string()),
        )
    }
}

impl UnitLoader for StaticLoader {
    fn describe(&self, path: &Path) -> std::result::Result<String, LoadError> {
        self.current(path)
            .map(|(_, unit)| unit.manifest)
            .ok_or_else(|| LoadError::open(path, "not a loadable unit"))
    }

    fn load(&self, path: &Path) -> std::result::Result<LoadedPlugin, LoadError> {
        let (build, unit) = self
            .current(path)
            .ok_or_else(|| LoadError::open(path, "not a loadable unit"))?;
        Self::instantiate(path, build, &unit)
    }

    fn restore(&self, retained: &RetainedUnit) -> std::result::Result<LoadedPlugin, LoadError> {
        let build = retained
            .snapshot
            .as_deref()
            .and_then(Self::build_of)
            .ok_or_else(|| LoadError::open(&retained.path, "no retained build to restore"))?;
        let unit = self
            .state
            .lock()
            .builds
            .get(&build)
            .cloned()
            .ok_or_else(|| LoadError::open(&retained.path, format!("build {build} is gone")))?;
        Self::instantiate(&retained.path, build, &unit)
    }

    fn fingerprint(&self, path: &Path) -> Option<String> {
        self.current(path).map(|(build, _)| build.to_string())
    }
}

/// Lifecycle callback observed on a [`ScriptedPlugin`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// `initialize` ran; the flag is its result
    Initialized(String, bool),
    /// `shutdown` ran
    ShutDown(String),
    /// `on_before_reload` ran
    BeforeReload(String),
    /// `deserialize_state` ran with this state
    StateRestored(String, String),
    /// `on_after_reload` ran
    AfterReload(String),
    /// The instance was destroyed
    Destroyed(String),
}

/// Shared record of lifecycle events, in call order
#[derive(Debug, Clone, Default)]
pub struct Journal {
    events: Arc<Mutex<Vec<LifecycleEvent>>>,
}

impl Journal {
    /// Create an empty journal
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event
    pub fn record(&self, event: LifecycleEvent) {
        self.events.lock().push(event);
    }

    /// Copy of everything recorded so far
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    /// Forget everything recorded so far
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Index of the first occurrence of `event`
    pub fn position(&self, event: &LifecycleEvent) -> Option<usize> {
        self.events.lock().iter().position(|e| e == event)
    }

    /// Number of occurrences of `event`
    pub fn count(&self, event: &LifecycleEvent) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }
}

type InitHook = Arc<dyn Fn(&PluginContext) + Send + Sync>;

#[derive(Clone, Default)]
struct Script {
    fail_initialize: bool,
    on_initialize: Option<InitHook>,
}

/// Plugin with a counter as its reloadable state
///
/// On `initialize` it subscribes to `"<name>.tick"` and provides a
/// `"<name>"` service, so tests can check that reloads and unloads drop
/// plugin-tagged registrations.
pub struct ScriptedPlugin {
    metadata: PluginMetadata,
    initialized: bool,
    counter: u64,
    journal: Journal,
    script: Script,
}

impl ScriptedPlugin {
    fn new(metadata: PluginMetadata, journal: Journal, script: Script) -> Self {
        Self {
            metadata,
            initialized: false,
            counter: 0,
            journal,
            script,
        }
    }

    /// Increment the counter
    pub fn bump(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    /// Current counter value
    pub fn counter(&self) -> u64 {
        self.counter
    }

    fn name_owned(&self) -> String {
        self.metadata.name.clone()
    }
}

impl fmt::Debug for ScriptedPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedPlugin")
            .field("name", &self.metadata.name)
            .field("version", &self.metadata.version.to_string())
            .field("initialized", &self.initialized)
            .field("counter", &self.counter)
            .finish()
    }
}

impl Plugin for ScriptedPlugin {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    fn initialize(&mut self, ctx: &PluginContext) -> bool {
        if let Some(hook) = &self.script.on_initialize {
            hook(ctx);
        }

        let ok = !self.script.fail_initialize;
        if ok {
            ctx.subscribe(&format!("{}.tick", self.metadata.name), |_, _| {});
            ctx.provide(&self.metadata.name, Arc::new(self.metadata.version.clone()));
            self.initialized = true;
        }
        self.journal
            .record(LifecycleEvent::Initialized(self.name_owned(), ok));
        ok
    }

    fn shutdown(&mut self) {
        self.initialized = false;
        self.journal.record(LifecycleEvent::ShutDown(self.name_owned()));
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn serialize_state(&self) -> String {
        if self.counter == 0 {
            String::new()
        } else {
            self.counter.to_string()
        }
    }

    fn deserialize_state(&mut self, state: &str) {
        self.counter = state.parse().unwrap_or_default();
        self.journal.record(LifecycleEvent::StateRestored(
            self.name_owned(),
            state.to_string(),
        ));
    }

    fn on_before_reload(&mut self) {
        self.journal
            .record(LifecycleEvent::BeforeReload(self.name_owned()));
    }

    fn on_after_reload(&mut self) {
        self.journal
            .record(LifecycleEvent::AfterReload(self.name_owned()));
    }
}

impl Drop for ScriptedPlugin {
    fn drop(&mut self) {
        self.journal.record(LifecycleEvent::Destroyed(self.name_owned()));
    }
}

#[derive(Default)]
struct ManualState {
    callbacks: HashMap<PathBuf, ChangeCallback>,
    poll_interval: Option<Duration>,
    running: bool,
}

/// Watcher whose notifications are fired by hand
#[derive(Clone, Default)]
pub struct ManualWatcher {
    state: Arc<Mutex<ManualState>>,
}

impl ManualWatcher {
    /// Create a stopped watcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `change` for `path`, as the poller would
    ///
    /// Returns false if the watcher is stopped or `path` is not watched.
    pub fn trigger(&self, path: &Path, change: FileChange) -> bool {
        let callback = {
            let state = self.state.lock();
            if !state.running {
                return false;
            }
            state.callbacks.get(path).cloned()
        };
        match callback {
            Some(callback) => {
                callback(path, change);
                true
            }
            None => false,
        }
    }

    /// Whether `path` is registered
    pub fn is_watching(&self, path: &Path) -> bool {
        self.state.lock().callbacks.contains_key(path)
    }

    /// Poll interval last configured
    pub fn poll_interval(&self) -> Option<Duration> {
        self.state.lock().poll_interval
    }
}

impl fmt::Debug for ManualWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManualWatcher")
            .field("watches", &state.callbacks.len())
            .field("running", &state.running)
            .finish()
    }
}

impl FileWatcher for ManualWatcher {
    fn add_watch(&mut self, path: &Path, callback: ChangeCallback) -> Result<()> {
        if path.as_os_str().is_empty() {
            return Err(PluginRuntimeError::watch("empty path"));
        }
        self.state
            .lock()
            .callbacks
            .insert(path.to_path_buf(), callback);
        Ok(())
    }

    fn remove_watch(&mut self, path: &Path) {
        self.state.lock().callbacks.remove(path);
    }

    fn set_poll_interval(&mut self, interval: Duration) {
        self.state.lock().poll_interval = Some(interval);
    }

    fn start(&mut self) -> Result<()> {
        self.state.lock().running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.state.lock().running = false;
    }

    fn is_running(&self) -> bool {
        self.state.lock().running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_plugin_api::Version;

    fn meta(name: &str) -> PluginMetadata {
        PluginMetadata::new(name, Version::new(1, 0, 0))
    }

    #[test]
    fn test_static_loader_serves_current_build() {
        let loader = StaticLoader::new();
        let journal = Journal::new();
        let path = Path::new("/plugins/a.so");

        let first = loader.install(path, StaticUnit::scripted(meta("a"), &journal));
        let loaded = loader.load(path).unwrap();
        assert_eq!(loaded.metadata().name, "a");
        assert_eq!(loaded.fingerprint(), Some(first.to_string().as_str()));

        let second = loader.install(path, StaticUnit::scripted(meta("a"), &journal));
        assert_ne!(first, second);
        assert_eq!(loader.fingerprint(path), Some(second.to_string()));
    }

    #[test]
    fn test_restore_brings_back_previous_build() {
        let loader = StaticLoader::new();
        let journal = Journal::new();
        let path = Path::new("/plugins/a.so");

        loader.install(path, StaticUnit::scripted(meta("a"), &journal));
        let retained = loader.load(path).unwrap().retain();

        let newer = PluginMetadata::new("a", Version::new(2, 0, 0));
        loader.install(path, StaticUnit::scripted(newer, &journal));

        let restored = loader.restore(&retained).unwrap();
        assert_eq!(restored.metadata().version, Version::new(1, 0, 0));

        loader.forget_previous_builds();
        assert!(loader.restore(&retained).is_err());
    }

    #[test]
    fn test_unknown_path_is_not_loadable() {
        let loader = StaticLoader::new();
        let path = Path::new("/plugins/missing.so");
        assert!(matches!(loader.describe(path), Err(LoadError::Open { .. })));
        assert!(loader.load(path).is_err());
        assert!(loader.fingerprint(path).is_none());
    }

    #[test]
    fn test_scripted_state_round_trip() {
        let journal = Journal::new();
        let mut plugin = ScriptedPlugin::new(meta("a"), journal.clone(), Script::default());
        assert_eq!(plugin.serialize_state(), "");

        plugin.bump();
        plugin.bump();
        let state = plugin.serialize_state();

        let mut fresh = ScriptedPlugin::new(meta("a"), journal.clone(), Script::default());
        fresh.deserialize_state(&state);
        assert_eq!(fresh.counter(), 2);
        assert_eq!(
            journal.count(&LifecycleEvent::StateRestored("a".into(), "2".into())),
            1
        );
    }

    #[test]
    fn test_manual_watcher_only_fires_when_running() {
        let mut watcher = ManualWatcher::new();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let sink = hits.clone();
        let path = Path::new("/plugins/a.so");

        watcher
            .add_watch(
                path,
                Arc::new(move |p: &Path, change: FileChange| sink.lock().push((p.to_path_buf(), change))),
            )
            .unwrap();
        assert!(!watcher.trigger(path, FileChange::Modified));

        watcher.start().unwrap();
        assert!(watcher.trigger(path, FileChange::Modified));
        assert!(!watcher.trigger(Path::new("/plugins/b.so"), FileChange::Modified));
        assert_eq!(hits.lock().len(), 1);

        watcher.remove_watch(path);
        assert!(!watcher.is_watching(path));
    }
}
