//! Configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Host configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HostConfig {
    /// Plugin loading and hot reload
    #[serde(default)]
    pub plugins: PluginsConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Plugin loading configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginsConfig {
    /// Directory scanned for plugin units
    #[serde(default = "default_directory")]
    pub directory: PathBuf,

    /// Open private copies of units so a previous build survives an overwrite
    #[serde(default = "default_true", alias = "shadow_copy")]
    pub shadow_copy: bool,

    /// Hot reload
    #[serde(default, alias = "hot_reload")]
    pub hot_reload: HotReloadConfig,

    /// Values exposed to plugins through their configuration store,
    /// usually keyed by plugin name
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            shadow_copy: true,
            hot_reload: HotReloadConfig::default(),
            settings: serde_json::Map::new(),
        }
    }
}

/// Hot reload configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HotReloadConfig {
    /// Watch plugin files and reload on change
    #[serde(default)]
    pub enabled: bool,

    /// How often plugin files are polled
    #[serde(
        default = "default_poll_interval",
        with = "humantime_serde",
        alias = "poll_interval"
    )]
    pub poll_interval: Duration,

    /// Changes to one file closer together than this trigger one reload
    #[serde(default = "default_debounce", with = "humantime_serde")]
    pub debounce: Duration,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval: default_poll_interval(),
            debounce: default_debounce(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level or filter directive, e.g. `info` or `weft=debug`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

// Default functions
fn default_directory() -> PathBuf {
    PathBuf::from("plugins")
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_debounce() -> Duration {
    Duration::from_millis(250)
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.plugins.directory, PathBuf::from("plugins"));
        assert!(config.plugins.shadow_copy);
        assert!(!config.plugins.hot_reload.enabled);
        assert_eq!(config.plugins.hot_reload.poll_interval, Duration::from_secs(1));
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: HostConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, HostConfig::default());
    }

    #[test]
    fn test_snake_case_aliases() {
        let config: HostConfig = serde_json::from_str(
            r#"{"plugins": {"shadow_copy": false, "hot_reload": {"enabled": true, "poll_interval": "250ms"}}}"#,
        )
        .unwrap();
        assert!(!config.plugins.shadow_copy);
        assert!(config.plugins.hot_reload.enabled);
        assert_eq!(
            config.plugins.hot_reload.poll_interval,
            Duration::from_millis(250)
        );
    }
}
