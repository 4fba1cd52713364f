//! Change notification for plugin files

use crate::error::{PluginRuntimeError, Result};
use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Kind of change observed on a watched file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileChange {
    /// Contents or metadata changed
    Modified,
    /// File appeared, typically an atomic replace
    Created,
    /// File disappeared
    Deleted,
}

impl FileChange {
    fn from_kind(kind: &EventKind) -> Option<Self> {
        match kind {
            EventKind::Modify(_) => Some(Self::Modified),
            EventKind::Create(_) => Some(Self::Created),
            EventKind::Remove(_) => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// Callback invoked with the registered path and the change observed
pub type ChangeCallback = Arc<dyn Fn(&Path, FileChange) + Send + Sync>;

/// Source of change notifications for plugin files
pub trait FileWatcher: Send + fmt::Debug {
    /// Start reporting changes to `path`
    fn add_watch(&mut self, path: &Path, callback: ChangeCallback) -> Result<()>;

    /// Stop reporting changes to `path`
    fn remove_watch(&mut self, path: &Path);

    /// How often to look for changes; applies from the next `start`
    fn set_poll_interval(&mut self, interval: Duration);

    /// Begin delivering notifications
    fn start(&mut self) -> Result<()>;

    /// Stop delivering notifications; registered paths are kept
    fn stop(&mut self);

    /// Whether notifications are being delivered
    fn is_running(&self) -> bool;
}

struct WatchTarget {
    path: PathBuf,
    callback: ChangeCallback,
}

type Targets = Arc<RwLock<HashMap<PathBuf, WatchTarget>>>;

fn watch_key(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Polling watcher built on `notify`
///
/// Notify's polling thread only queues events. A separate dispatcher
/// thread debounces them and runs the callbacks, so a callback that
/// triggers a reload never holds up the poller or blocks `add_watch`.
pub struct NotifyWatcher {
    poll_interval: Duration,
    debounce: Duration,
    targets: Targets,
    watcher: Option<PollWatcher>,
    dispatcher: Option<thread::JoinHandle<()>>,
}

impl NotifyWatcher {
    /// Create a stopped watcher polling every `poll_interval`
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            debounce: Duration::from_millis(250),
            targets: Arc::new(RwLock::new(HashMap::new())),
            watcher: None,
            dispatcher: None,
        }
    }

    /// Set debounce duration
    pub fn with_debounce(mut self, duration: Duration) -> Self {
        self.debounce = duration;
        self
    }

    /// Number of registered paths
    pub fn watch_count(&self) -> usize {
        self.targets.read().len()
    }
}

impl Default for NotifyWatcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl fmt::Debug for NotifyWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyWatcher")
            .field("poll_interval", &self.poll_interval)
            .field("debounce", &self.debounce)
            .field("watches", &self.watch_count())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Debounces raw events and hands them to the registered callbacks
struct Dispatcher {
    targets: Targets,
    debounce: Duration,
    last_fired: HashMap<PathBuf, Instant>,
}

impl Dispatcher {
    fn dispatch(&mut self, event: &Event) {
        let Some(change) = FileChange::from_kind(&event.kind) else {
            return;
        };

        for raw in &event.paths {
            let key = watch_key(raw);
            let target = self
                .targets
                .read()
                .get(&key)
                .map(|t| (t.path.clone(), t.callback.clone()));
            let Some((path, callback)) = target else {
                continue;
            };

            let now = Instant::now();
            if let Some(last) = self.last_fired.get(&key) {
                if now.duration_since(*last) < self.debounce {
                    debug!(path = %path.display(), "Debounced file change");
                    continue;
                }
            }
            self.last_fired.insert(key, now);

            debug!(path = %path.display(), change = ?change, "Plugin file changed");
            callback(&path, change);
        }
    }
}

impl FileWatcher for NotifyWatcher {
    fn add_watch(&mut self, path: &Path, callback: ChangeCallback) -> Result<()> {
        let key = watch_key(path);
        if let Some(watcher) = self.watcher.as_mut() {
            watcher
                .watch(&key, RecursiveMode::NonRecursive)
                .map_err(|e| PluginRuntimeError::watch(format!("Failed to watch {}: {e}", path.display())))?;
        }

        self.targets.write().insert(
            key,
            WatchTarget {
                path: path.to_path_buf(),
                callback,
            },
        );
        debug!(path = %path.display(), "Watching plugin file");
        Ok(())
    }

    fn remove_watch(&mut self, path: &Path) {
        let key = watch_key(path);
        if self.targets.write().remove(&key).is_none() {
            return;
        }
        if let Some(watcher) = self.watcher.as_mut() {
            if let Err(e) = watcher.unwatch(&key) {
                debug!(path = %path.display(), error = %e, "Failed to unwatch plugin file");
            }
        }
    }

    fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }

    fn start(&mut self) -> Result<()> {
        if self.watcher.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel::<Event>();
        let mut dispatcher = Dispatcher {
            targets: Arc::clone(&self.targets),
            debounce: self.debounce,
            last_fired: HashMap::new(),
        };
        let handle = thread::Builder::new()
            .name("weft-hot-reload".to_string())
            .spawn(move || {
                for event in rx {
                    dispatcher.dispatch(&event);
                }
            })?;

        let mut watcher = PollWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => warn!(error = %e, "File watcher error"),
            },
            Config::default()
                .with_poll_interval(self.poll_interval)
                .with_compare_contents(true),
        )
        .map_err(|e| PluginRuntimeError::watch(format!("Failed to create file watcher: {e}")))?;

        let keys: Vec<PathBuf> = self.targets.read().keys().cloned().collect();
        for key in keys {
            if let Err(e) = watcher.watch(&key, RecursiveMode::NonRecursive) {
                warn!(path = %key.display(), error = %e, "Failed to watch plugin file");
            }
        }

        self.watcher = Some(watcher);
        self.dispatcher = Some(handle);

        info!(
            interval = ?self.poll_interval,
            watches = self.watch_count(),
            "Hot reload watcher started"
        );
        Ok(())
    }

    fn stop(&mut self) {
        if self.watcher.take().is_none() {
            return;
        }
        // The dispatcher exits once the poller drops its sender; it may be
        // mid-reload, so it is not joined here.
        self.dispatcher = None;
        info!("Hot reload watcher stopped");
    }

    fn is_running(&self) -> bool {
        self.watcher.is_some()
    }
}

impl Drop for NotifyWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Outcome of one reload, kept for inspection
#[derive(Debug, Clone, Serialize)]
pub struct ReloadEvent {
    /// Plugin whose reload was requested
    pub plugin_name: String,

    /// When the reload finished
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Whether the new build is now running
    pub success: bool,

    /// Error message if reload failed
    pub error: Option<String>,

    /// The plugin and its transitive dependents, dependencies first
    pub affected: Vec<String>,

    /// Wall time spent, pause to resume
    pub duration: Duration,
}

impl ReloadEvent {
    pub(crate) fn new(
        plugin_name: &str,
        affected: &[String],
        duration: Duration,
        outcome: &Result<()>,
    ) -> Self {
        Self {
            plugin_name: plugin_name.to_string(),
            timestamp: chrono::Utc::now(),
            success: outcome.is_ok(),
            error: outcome.as_ref().err().map(ToString::to_string),
            affected: affected.to_vec(),
            duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, ModifyKind, RemoveKind};
    use parking_lot::Mutex;
    use std::sync::mpsc::RecvTimeoutError;

    fn recording_callback() -> (ChangeCallback, mpsc::Receiver<(PathBuf, FileChange)>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let callback: ChangeCallback = Arc::new(move |path: &Path, change: FileChange| {
            let _ = tx.lock().send((path.to_path_buf(), change));
        });
        (callback, rx)
    }

    fn dispatcher_for(path: &Path, callback: ChangeCallback, debounce: Duration) -> Dispatcher {
        let targets: Targets = Arc::new(RwLock::new(HashMap::new()));
        targets.write().insert(
            watch_key(path),
            WatchTarget {
                path: path.to_path_buf(),
                callback,
            },
        );
        Dispatcher {
            targets,
            debounce,
            last_fired: HashMap::new(),
        }
    }

    #[test]
    fn test_event_kinds_map_to_changes() {
        assert_eq!(
            FileChange::from_kind(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            Some(FileChange::Modified)
        );
        assert_eq!(
            FileChange::from_kind(&EventKind::Create(CreateKind::File)),
            Some(FileChange::Created)
        );
        assert_eq!(
            FileChange::from_kind(&EventKind::Remove(RemoveKind::File)),
            Some(FileChange::Deleted)
        );
        assert_eq!(FileChange::from_kind(&EventKind::Any), None);
    }

    #[test]
    fn test_dispatch_only_reaches_registered_paths() {
        let dir = tempfile::tempdir().unwrap();
        let watched = dir.path().join("watched.so");
        let other = dir.path().join("other.so");
        std::fs::write(&watched, b"a").unwrap();
        std::fs::write(&other, b"b").unwrap();

        let (callback, rx) = recording_callback();
        let mut dispatcher = dispatcher_for(&watched, callback, Duration::ZERO);

        let event = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(other.clone())
            .add_path(watched.clone());
        dispatcher.dispatch(&event);

        assert_eq!(rx.try_recv().unwrap(), (watched, FileChange::Modified));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dispatch_debounces_bursts() {
        let dir = tempfile::tempdir().unwrap();
        let watched = dir.path().join("unit.so");
        std::fs::write(&watched, b"a").unwrap();

        let (callback, rx) = recording_callback();
        let mut dispatcher = dispatcher_for(&watched, callback, Duration::from_secs(60));

        let event = Event::new(EventKind::Modify(ModifyKind::Any)).add_path(watched.clone());
        dispatcher.dispatch(&event);
        dispatcher.dispatch(&event);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_watcher_start_stop() {
        let mut watcher = NotifyWatcher::new(Duration::from_millis(50));
        assert!(!watcher.is_running());

        watcher.start().unwrap();
        assert!(watcher.is_running());
        watcher.start().unwrap();

        watcher.stop();
        assert!(!watcher.is_running());
    }

    #[test]
    fn test_poll_watcher_reports_modification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unit.so");
        std::fs::write(&path, b"first build").unwrap();

        let (callback, rx) = recording_callback();
        let mut watcher = NotifyWatcher::new(Duration::from_millis(50)).with_debounce(Duration::ZERO);
        watcher.add_watch(&path, callback).unwrap();
        watcher.start().unwrap();

        std::thread::sleep(Duration::from_millis(200));
        std::fs::write(&path, b"second build, longer than the first").unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok((reported, change)) => {
                    assert_eq!(reported, path);
                    assert!(matches!(change, FileChange::Modified | FileChange::Created));
                    break;
                }
                Err(RecvTimeoutError::Timeout) if Instant::now() < deadline => continue,
                Err(e) => panic!("no change notification: {e:?}"),
            }
        }

        watcher.remove_watch(&path);
        assert_eq!(watcher.watch_count(), 0);
        watcher.stop();
    }

    #[test]
    fn test_reload_event_from_outcome() {
        let affected = vec!["a".to_string(), "b".to_string()];
        let ok = ReloadEvent::new("a", &affected, Duration::from_millis(5), &Ok(()));
        assert!(ok.success);
        assert!(ok.error.is_none());

        let failed = ReloadEvent::new(
            "a",
            &affected,
            Duration::from_millis(5),
            &Err(PluginRuntimeError::not_found("a")),
        );
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("Plugin not found: a"));
        assert_eq!(failed.affected, affected);
    }
}
