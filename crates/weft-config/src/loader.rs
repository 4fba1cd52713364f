//! Configuration loading

use crate::error::{ConfigError, Result};
use crate::{ConfigFormat, HostConfig};
use regex::Regex;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;

/// Load configuration from a file
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<HostConfig> {
    let path = path.as_ref();

    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let format = ConfigFormat::from_path(path)?;
    debug!(path = %path.display(), format = ?format, "Loading configuration");

    load_from_str(&content, format)
}

fn env_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}")
            .unwrap_or_else(|e| unreachable!("static pattern is valid: {e}"))
    })
}

/// Expand environment variables in configuration text
///
/// Supports `${VAR}` and `${VAR:-default}`.
pub fn expand_env_vars(content: &str) -> Result<String> {
    let mut result = String::with_capacity(content.len());
    let mut last_match = 0;

    for cap in env_pattern().captures_iter(content) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        let default_value = cap.get(3).map(|m| m.as_str());

        let value = match (env::var(var_name.as_str()), default_value) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.to_string(),
            (Err(_), None) => {
                return Err(ConfigError::MissingVariable(var_name.as_str().to_string()));
            }
        };

        result.push_str(&content[last_match..full_match.start()]);
        result.push_str(&value);
        last_match = full_match.end();
    }

    result.push_str(&content[last_match..]);
    Ok(result)
}

/// Load configuration from a string
pub fn load_from_str(content: &str, format: ConfigFormat) -> Result<HostConfig> {
    let expanded = expand_env_vars(content)?;

    let config = match format {
        ConfigFormat::Yaml => {
            serde_yaml::from_str(&expanded).map_err(|e| ConfigError::parse("YAML", e))?
        }
        ConfigFormat::Toml => {
            toml::from_str(&expanded).map_err(|e| ConfigError::parse("TOML", e))?
        }
        ConfigFormat::Json => {
            serde_json::from_str(&expanded).map_err(|e| ConfigError::parse("JSON", e))?
        }
    };

    Ok(config)
}

/// Load and validate configuration from a file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<HostConfig> {
    let config = load_from_file(path)?;
    crate::validator::validate_config(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LogFormat;
    use std::io::Write;
    use std::time::Duration;

    const YAML_CONFIG: &str = r#"
plugins:
  directory: "/opt/weft/plugins"
  shadowCopy: false
  hotReload:
    enabled: true
    pollInterval: "500ms"
    debounce: "1s"
  settings:
    counter:
      step: 2

logging:
  level: "debug"
  format: "json"
"#;

    #[test]
    fn test_load_yaml() {
        let config = load_from_str(YAML_CONFIG, ConfigFormat::Yaml).unwrap();

        assert_eq!(config.plugins.directory, Path::new("/opt/weft/plugins"));
        assert!(!config.plugins.shadow_copy);
        assert!(config.plugins.hot_reload.enabled);
        assert_eq!(config.plugins.hot_reload.poll_interval, Duration::from_millis(500));
        assert_eq!(config.plugins.hot_reload.debounce, Duration::from_secs(1));
        assert_eq!(config.plugins.settings["counter"]["step"], 2);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_load_toml() {
        let config = load_from_str(
            r#"
[plugins]
directory = "units"

[plugins.hotReload]
enabled = true
pollInterval = "2s"

[logging]
level = "warn"
"#,
            ConfigFormat::Toml,
        )
        .unwrap();

        assert_eq!(config.plugins.directory, Path::new("units"));
        assert_eq!(config.plugins.hot_reload.poll_interval, Duration::from_secs(2));
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_invalid_yaml() {
        let result = load_from_str("plugins: [yaml", ConfigFormat::Yaml);
        assert!(matches!(result, Err(ConfigError::Parse { format: "YAML", .. })));
    }

    #[test]
    fn test_env_var_substitution() {
        env::set_var("WEFT_TEST_PLUGIN_DIR", "/srv/plugins");

        let config = load_from_str(
            "plugins:\n  directory: \"${WEFT_TEST_PLUGIN_DIR}\"\n",
            ConfigFormat::Yaml,
        )
        .unwrap();
        assert_eq!(config.plugins.directory, Path::new("/srv/plugins"));

        env::remove_var("WEFT_TEST_PLUGIN_DIR");
    }

    #[test]
    fn test_env_var_with_default() {
        env::remove_var("WEFT_TEST_UNDEFINED");

        let config = load_from_str(
            "logging:\n  level: \"${WEFT_TEST_UNDEFINED:-trace}\"\n",
            ConfigFormat::Yaml,
        )
        .unwrap();
        assert_eq!(config.logging.level, "trace");
    }

    #[test]
    fn test_missing_env_var_no_default() {
        env::remove_var("WEFT_TEST_MISSING");

        let result = load_from_str(
            "logging:\n  level: \"${WEFT_TEST_MISSING}\"\n",
            ConfigFormat::Yaml,
        );
        let err = result.unwrap_err();
        assert!(err.to_string().contains("WEFT_TEST_MISSING"));
    }

    #[test]
    fn test_multiple_env_vars() {
        env::set_var("WEFT_TEST_ROOT", "/opt");
        env::set_var("WEFT_TEST_NAME", "weft");

        let expanded = expand_env_vars("${WEFT_TEST_ROOT}/${WEFT_TEST_NAME}/plugins").unwrap();
        assert_eq!(expanded, "/opt/weft/plugins");

        env::remove_var("WEFT_TEST_ROOT");
        env::remove_var("WEFT_TEST_NAME");
    }

    #[test]
    fn test_load_config_validates() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"plugins": {{"hotReload": {{"pollInterval": "1ms"}}}}}}"#
        )
        .unwrap();

        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::Invalid(_))
        ));
        assert!(load_from_file(file.path()).is_ok());
    }

    #[test]
    fn test_missing_file() {
        let result = load_from_file("/definitely/not/here.yaml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
