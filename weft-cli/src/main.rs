//! Weft CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use weft_config::{load_config, HostConfig, LogFormat};
use weft_plugin_api::{
    EventBus, Host, InMemoryEventBus, InMemoryResourceStore, InMemoryServiceRegistry,
    JsonConfigStore, PausableHost,
};
use weft_plugin_runtime::loader::read_manifest;
use weft_plugin_runtime::{DependencyResolver, DynamicLoader, NotifyWatcher, PluginManager, UnitLoader};

#[derive(Parser)]
#[command(name = "weft")]
#[command(about = "Hot-reloadable plugin host", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load, initialize and watch a plugin directory until interrupted
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "weft.yaml", env = "WEFT_CONFIG")]
        config: PathBuf,

        /// Plugin directory (overrides the configuration file)
        #[arg(short, long)]
        plugins: Option<PathBuf>,

        /// Enable hot reload regardless of configuration
        #[arg(long)]
        hot_reload: bool,

        /// Log level or filter (overrides the configuration file)
        #[arg(short, long)]
        log_level: Option<String>,

        /// Publish `host.tick` on the event bus at this interval, e.g. `5s`
        #[arg(long, value_parser = humantime::parse_duration)]
        tick: Option<Duration>,
    },

    /// Print the manifest of a plugin unit without instantiating it
    Inspect {
        /// Path to a plugin unit
        path: PathBuf,
    },

    /// Print the initialization order of every unit in a directory
    Resolve {
        /// Plugin directory
        #[arg(short, long, default_value = "plugins")]
        plugins: PathBuf,
    },

    /// Validate configuration file
    Validate {
        /// Path to configuration file
        #[arg(short, long, default_value = "weft.yaml")]
        config: PathBuf,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            plugins,
            hot_reload,
            log_level,
            tick,
        } => {
            let mut host_config = if config.exists() {
                load_config(&config)
                    .with_context(|| format!("Failed to load {}", config.display()))?
            } else {
                HostConfig::default()
            };

            if let Some(dir) = plugins {
                host_config.plugins.directory = dir;
            }
            if hot_reload {
                host_config.plugins.hot_reload.enabled = true;
            }
            if let Some(level) = log_level {
                host_config.logging.level = level;
            }

            init_tracing(&host_config.logging.level, host_config.logging.format)?;
            if !config.exists() {
                tracing::info!(config = %config.display(), "No configuration file, using defaults");
            }

            run(host_config, tick).await
        }

        Commands::Inspect { path } => {
            init_tracing("warn", LogFormat::Text)?;

            let loader = DynamicLoader::without_shadow_copies();
            let text = loader.describe(&path)?;
            let manifest = read_manifest(&path, &text)?;
            println!("{}", serde_json::to_string_pretty(&manifest.metadata)?);
            Ok(())
        }

        Commands::Resolve { plugins } => {
            init_tracing("warn", LogFormat::Text)?;
            resolve(&plugins)
        }

        Commands::Validate { config } => {
            tracing_subscriber::fmt().with_target(false).init();

            tracing::info!("Validating configuration: {}", config.display());

            match load_config(&config) {
                Ok(cfg) => {
                    tracing::info!("✓ Configuration is valid");
                    tracing::info!("  Plugin directory: {}", cfg.plugins.directory.display());
                    tracing::info!("  Shadow copies: {}", cfg.plugins.shadow_copy);
                    tracing::info!(
                        "  Hot reload: {} (every {:?})",
                        cfg.plugins.hot_reload.enabled,
                        cfg.plugins.hot_reload.poll_interval
                    );
                    Ok(())
                }
                Err(e) => {
                    tracing::error!("✗ Configuration validation failed: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Version => {
            println!("Weft plugin host");
            println!("Version: {}", env!("CARGO_PKG_VERSION"));
            println!("Rust version: {}", env!("CARGO_PKG_RUST_VERSION"));
            println!("Plugin ABI: {}", weft_plugin_api::ffi::ABI_VERSION);
            Ok(())
        }
    }
}

async fn run(config: HostConfig, tick: Option<Duration>) -> Result<()> {
    let plugins = &config.plugins;
    tracing::info!(
        directory = %plugins.directory.display(),
        shadow_copy = plugins.shadow_copy,
        "Starting Weft plugin host"
    );

    let loader = if plugins.shadow_copy {
        DynamicLoader::new()
    } else {
        DynamicLoader::without_shadow_copies()
    };
    let watcher = NotifyWatcher::new(plugins.hot_reload.poll_interval)
        .with_debounce(plugins.hot_reload.debounce);

    let event_bus = Arc::new(InMemoryEventBus::new());
    let host = Arc::new(PausableHost::new("weft"));
    let ticker = Arc::new(Ticker::new(event_bus.clone(), host.clone()));
    let pausing = ticker.clone();
    let resuming = ticker.clone();
    let manager = PluginManager::builder()
        .loader(loader)
        .watcher(watcher)
        .event_bus(event_bus.clone())
        .services(Arc::new(InMemoryServiceRegistry::new()))
        .host(host)
        .resources(Arc::new(InMemoryResourceStore::new()))
        .config_store(Arc::new(JsonConfigStore::new(serde_json::Value::Object(
            plugins.settings.clone(),
        ))))
        .on_pause(move || pausing.pause())
        .on_resume(move || resuming.resume())
        .build();

    let loaded = manager.load_plugins_from_directory(&plugins.directory);
    tracing::info!(loaded, "Plugins loaded");

    manager.initialize_all()?;
    tracing::info!(plugins = ?manager.loaded_plugins(), "Plugins initialized");

    if plugins.hot_reload.enabled {
        manager.enable_hot_reload(plugins.hot_reload.poll_interval)?;
    }

    if let Some(period) = tick {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            let mut count = 0u64;
            loop {
                interval.tick().await;
                match ticker.tick(count + 1) {
                    Some(delivered) => {
                        count += 1;
                        tracing::debug!(count, delivered, "Published host.tick");
                    }
                    None => tracing::debug!("Host paused, tick skipped"),
                }
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    manager.disable_hot_reload();
    for event in manager.recent_reloads() {
        tracing::info!(reload = %serde_json::to_string(&event)?, "Reload history");
    }
    manager.unload_all();

    tracing::info!("Plugin host stopped");
    Ok(())
}

fn resolve(dir: &Path) -> Result<()> {
    let loader = DynamicLoader::without_shadow_copies();
    let mut resolver = DependencyResolver::new();

    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| loader.is_candidate(path))
        .collect();
    entries.sort();

    for path in entries {
        let manifest = match loader
            .describe(&path)
            .and_then(|text| read_manifest(&path, &text))
        {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unit");
                continue;
            }
        };
        resolver.add_plugin(&manifest.metadata);
    }

    let order = resolver.resolve()?;
    for (position, name) in order.iter().enumerate() {
        if let Some(node) = resolver.get_node(name) {
            println!(
                "{:>3}. {} {} (priority {})",
                position + 1,
                name,
                node.version,
                node.priority
            );
        }
    }
    Ok(())
}

/// Publishes `host.tick` while no reload is in progress
///
/// Publishing runs under the read side of `publishing` and pausing takes the
/// write side, so once [`Ticker::pause`] returns no tick handler is running
/// and none starts until [`Ticker::resume`].
struct Ticker {
    bus: Arc<dyn EventBus>,
    host: Arc<PausableHost>,
    publishing: RwLock<()>,
}

impl Ticker {
    fn new(bus: Arc<dyn EventBus>, host: Arc<PausableHost>) -> Self {
        Self {
            bus,
            host,
            publishing: RwLock::new(()),
        }
    }

    fn pause(&self) {
        let _drained = self.publishing.write();
        self.host.pause();
        tracing::info!("Host paused for reload");
    }

    fn resume(&self) {
        self.host.resume();
        tracing::info!("Host resumed");
    }

    /// Publish tick `count`, returning the number of handlers reached, or
    /// `None` while paused
    fn tick(&self, count: u64) -> Option<usize> {
        let _publishing = self.publishing.read();
        if self.host.is_paused() {
            return None;
        }
        Some(self.bus.publish("host.tick", &serde_json::json!({ "count": count })))
    }
}

fn init_tracing(level: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_level(true),
            )
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .init(),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;

    fn tick_of(args: &[&str]) -> Option<Duration> {
        let mut argv = vec!["weft", "run"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Run { tick, .. } => tick,
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_tick_interval_parsing() {
        assert_eq!(tick_of(&["--tick", "250ms"]), Some(Duration::from_millis(250)));
        assert_eq!(tick_of(&["--tick", "1m 30s"]), Some(Duration::from_secs(90)));
        assert_eq!(tick_of(&["--tick", "2h"]), Some(Duration::from_secs(7200)));
        assert_eq!(tick_of(&[]), None);
        assert!(Cli::try_parse_from(["weft", "run", "--tick", "soon"]).is_err());
        assert!(Cli::try_parse_from(["weft", "run", "--tick", "99999999999999999999m"]).is_err());
    }

    #[test]
    fn test_ticker_is_silent_while_paused() {
        let bus = Arc::new(InMemoryEventBus::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        bus.subscribe(
            "counter",
            "host.tick",
            Arc::new(move |_: &str, _: &serde_json::Value| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let host = Arc::new(PausableHost::new("test"));
        let ticker = Ticker::new(bus, host.clone());

        assert_eq!(ticker.tick(1), Some(1));
        ticker.pause();
        assert!(host.is_paused());
        assert_eq!(ticker.tick(2), None);
        ticker.resume();
        assert_eq!(ticker.tick(3), Some(1));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_pause_waits_for_running_tick() {
        let bus = Arc::new(InMemoryEventBus::new());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = parking_lot::Mutex::new(release_rx);
        let finished = Arc::new(AtomicUsize::new(0));
        let done = finished.clone();
        bus.subscribe(
            "counter",
            "host.tick",
            Arc::new(move |_: &str, _: &serde_json::Value| {
                entered_tx.send(()).unwrap();
                release_rx.lock().recv().unwrap();
                done.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let ticker = Arc::new(Ticker::new(bus, Arc::new(PausableHost::new("test"))));

        let publisher = {
            let ticker = ticker.clone();
            thread::spawn(move || ticker.tick(1))
        };
        entered_rx.recv().unwrap();

        let pauser = {
            let ticker = ticker.clone();
            let finished = finished.clone();
            thread::spawn(move || {
                ticker.pause();
                finished.load(Ordering::SeqCst)
            })
        };
        thread::sleep(Duration::from_millis(50));
        release_tx.send(()).unwrap();

        assert_eq!(publisher.join().unwrap(), Some(1));
        assert_eq!(pauser.join().unwrap(), 1);
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::parse_from(["weft", "run", "--plugins", "units", "--hot-reload", "--tick", "2s"]);
        match cli.command {
            Commands::Run {
                plugins,
                hot_reload,
                tick,
                ..
            } => {
                assert_eq!(plugins, Some(PathBuf::from("units")));
                assert!(hot_reload);
                assert_eq!(tick, Some(Duration::from_secs(2)));
            }
            _ => panic!("expected run"),
        }
    }
}
