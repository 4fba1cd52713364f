//! Configuration validation

use crate::error::{ConfigError, Result};
use crate::HostConfig;
use std::time::Duration;

/// Shortest accepted hot reload poll interval
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

/// Validate configuration
pub fn validate_config(config: &HostConfig) -> Result<()> {
    validate_plugins(config)?;
    validate_logging(config)?;
    Ok(())
}

fn validate_plugins(config: &HostConfig) -> Result<()> {
    let plugins = &config.plugins;

    if plugins.directory.as_os_str().is_empty() {
        return Err(ConfigError::invalid("plugins.directory cannot be empty"));
    }

    let hot_reload = &plugins.hot_reload;
    if hot_reload.poll_interval < MIN_POLL_INTERVAL {
        return Err(ConfigError::invalid(format!(
            "plugins.hotReload.pollInterval must be at least {}ms (got {:?})",
            MIN_POLL_INTERVAL.as_millis(),
            hot_reload.poll_interval
        )));
    }

    if hot_reload.enabled && !plugins.shadow_copy {
        tracing::warn!(
            "Hot reload without shadow copies cannot roll back to a build that was overwritten"
        );
    }

    if hot_reload.debounce > hot_reload.poll_interval * 10 {
        tracing::warn!(
            debounce = ?hot_reload.debounce,
            poll_interval = ?hot_reload.poll_interval,
            "Hot reload debounce is much longer than the poll interval"
        );
    }

    Ok(())
}

fn validate_logging(config: &HostConfig) -> Result<()> {
    let level = config.logging.level.trim();
    if level.is_empty() {
        return Err(ConfigError::invalid("logging.level cannot be empty"));
    }

    // Accept a bare level or per-target directives such as `weft=debug,info`
    for directive in level.split(',').map(str::trim) {
        let level = directive
            .rsplit_once('=')
            .map_or(directive, |(_, level)| level);
        if !LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::invalid(format!(
                "Unknown log level '{}' (expected one of {})",
                level,
                LOG_LEVELS.join(", ")
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&HostConfig::default()).is_ok());
    }

    #[test]
    fn test_empty_directory() {
        let mut config = HostConfig::default();
        config.plugins.directory = PathBuf::new();

        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_poll_interval_too_short() {
        let mut config = HostConfig::default();
        config.plugins.hot_reload.poll_interval = Duration::from_millis(5);
        assert!(validate_config(&config).is_err());

        config.plugins.hot_reload.poll_interval = MIN_POLL_INTERVAL;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_log_levels() {
        let mut config = HostConfig::default();

        for level in ["debug", "WARN", "weft=debug,info", "weft_plugin_runtime=trace"] {
            config.logging.level = level.to_string();
            assert!(validate_config(&config).is_ok(), "{level} should be accepted");
        }

        for level in ["", "verbose", "weft=loud"] {
            config.logging.level = level.to_string();
            assert!(validate_config(&config).is_err(), "{level} should be rejected");
        }
    }
}
