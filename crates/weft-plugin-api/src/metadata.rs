//! Plugin metadata, dependency descriptors and the manifest format

use crate::error::{PluginError, Result};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Load priority assigned when a manifest does not declare one
pub const DEFAULT_LOAD_PRIORITY: i32 = 100;

/// Parse a version string, padding missing components with zeros
///
/// Accepts full semantic versions (`1.2.3`, `1.2.3-beta.1`), an optional
/// leading `v`, and the short forms `1` and `1.2`.
pub fn parse_version(raw: &str) -> Result<Version> {
    let trimmed = raw.trim();
    let core = trimmed.strip_prefix('v').unwrap_or(trimmed);

    if let Ok(version) = Version::parse(core) {
        return Ok(version);
    }

    let mut parts = [0u64; 3];
    for (index, piece) in core.split('.').enumerate() {
        let slot = parts.get_mut(index).ok_or_else(|| PluginError::version(raw))?;
        *slot = piece.parse().map_err(|_| PluginError::version(raw))?;
    }

    Ok(Version::new(parts[0], parts[1], parts[2]))
}

mod lenient_version {
    use super::parse_version;
    use semver::Version;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(version: &Version, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(version)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Version, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_version(&raw).map_err(de::Error::custom)
    }
}

mod version_bound {
    use super::parse_version;
    use semver::Version;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        bound: &Option<Version>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bound {
            Some(version) => serializer.collect_str(version),
            None => serializer.serialize_none(),
        }
    }

    // An empty string is the unbounded marker.
    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Version>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(raw) if !raw.trim().is_empty() => {
                parse_version(&raw).map(Some).map_err(de::Error::custom)
            }
            _ => Ok(None),
        }
    }
}

fn default_required() -> bool {
    true
}

fn default_load_priority() -> i32 {
    DEFAULT_LOAD_PRIORITY
}

/// A dependency on another plugin, constrained to `[min_version, max_version)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyDescriptor {
    /// Name of the plugin depended upon
    #[serde(alias = "plugin_name")]
    pub plugin_name: String,

    /// Inclusive lower bound, unbounded when absent
    #[serde(
        default,
        alias = "min_version",
        with = "version_bound",
        skip_serializing_if = "Option::is_none"
    )]
    pub min_version: Option<Version>,

    /// Exclusive upper bound, unbounded when absent
    #[serde(
        default,
        alias = "max_version",
        with = "version_bound",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_version: Option<Version>,

    /// Whether resolution fails when the dependency is absent
    #[serde(default = "default_required")]
    pub required: bool,
}

impl DependencyDescriptor {
    /// Create a required dependency accepting any version
    pub fn required(plugin_name: impl Into<String>) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            min_version: None,
            max_version: None,
            required: true,
        }
    }

    /// Create an optional dependency accepting any version
    pub fn optional(plugin_name: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(plugin_name)
        }
    }

    /// Set the inclusive lower bound
    pub fn at_least(mut self, min: Version) -> Self {
        self.min_version = Some(min);
        self
    }

    /// Set the exclusive upper bound
    pub fn below(mut self, max: Version) -> Self {
        self.max_version = Some(max);
        self
    }

    /// Check whether `version` lies within `[min_version, max_version)`
    pub fn accepts(&self, version: &Version) -> bool {
        let above_min = self.min_version.as_ref().map_or(true, |min| version >= min);
        let below_max = self.max_version.as_ref().map_or(true, |max| version < max);
        above_min && below_max
    }

    /// Human readable form of the accepted range
    pub fn range(&self) -> String {
        match (&self.min_version, &self.max_version) {
            (None, None) => "any version".to_string(),
            (Some(min), None) => format!(">= {min}"),
            (None, Some(max)) => format!("< {max}"),
            (Some(min), Some(max)) => format!("[{min}, {max})"),
        }
    }
}

impl fmt::Display for DependencyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.plugin_name, self.range())?;
        if !self.required {
            write!(f, " (optional)")?;
        }
        Ok(())
    }
}

/// Descriptive record of a plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginMetadata {
    /// Unique plugin name
    pub name: String,

    /// Plugin version
    #[serde(with = "lenient_version")]
    pub version: Version,

    /// Plugin author
    #[serde(default)]
    pub author: String,

    /// Plugin description
    #[serde(default)]
    pub description: String,

    /// License identifier
    #[serde(default)]
    pub license: String,

    /// Declared dependencies
    #[serde(default)]
    pub dependencies: Vec<DependencyDescriptor>,

    /// Ordering hint; higher values initialize earlier among ready plugins
    #[serde(default = "default_load_priority", alias = "load_priority")]
    pub load_priority: i32,

    /// Free-form key/value pairs
    #[serde(default, alias = "custom_fields", skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_fields: BTreeMap<String, String>,
}

impl PluginMetadata {
    /// Create metadata with the default load priority and no dependencies
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            author: String::new(),
            description: String::new(),
            license: String::new(),
            dependencies: Vec::new(),
            load_priority: DEFAULT_LOAD_PRIORITY,
            custom_fields: BTreeMap::new(),
        }
    }

    /// Set the author
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the license
    pub fn with_license(mut self, license: impl Into<String>) -> Self {
        self.license = license.into();
        self
    }

    /// Set the load priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.load_priority = priority;
        self
    }

    /// Append a dependency
    pub fn with_dependency(mut self, dependency: DependencyDescriptor) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Add a custom field
    pub fn with_custom_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_fields.insert(key.into(), value.into());
        self
    }

    /// Required dependencies only
    pub fn required_dependencies(&self) -> impl Iterator<Item = &DependencyDescriptor> {
        self.dependencies.iter().filter(|dep| dep.required)
    }

    /// Whether any dependency, required or optional, names `plugin`
    pub fn depends_on(&self, plugin: &str) -> bool {
        self.dependencies.iter().any(|dep| dep.plugin_name == plugin)
    }

    /// Reject metadata that cannot be registered
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PluginError::manifest("plugin name must not be empty"));
        }

        if let Some(dep) = self.dependencies.iter().find(|d| d.plugin_name.trim().is_empty()) {
            return Err(PluginError::manifest(format!(
                "plugin '{}' declares a dependency without a name ({dep})",
                self.name
            )));
        }

        Ok(())
    }
}

/// Manifest text returned by a unit's describe entry point
///
/// The manifest is the JSON form of [`PluginMetadata`] plus the optional
/// `abiVersion` and `rustcVersion` stamped by
/// [`declare_plugin!`](crate::declare_plugin).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginManifest {
    /// Plugin metadata
    pub metadata: PluginMetadata,

    /// ABI revision the unit was built against
    pub abi_version: Option<u32>,

    /// Compiler that built the unit, as reported by `rustc -V`
    pub rustc_version: Option<String>,
}

impl PluginManifest {
    /// Wrap metadata, stamping the current ABI revision and compiler
    pub fn new(metadata: PluginMetadata) -> Self {
        Self {
            metadata,
            abi_version: Some(crate::ffi::ABI_VERSION),
            rustc_version: Some(crate::ffi::RUSTC_VERSION.to_string()),
        }
    }

    /// Parse and validate manifest text
    pub fn parse(text: &str) -> Result<Self> {
        let mut value: serde_json::Value = serde_json::from_str(text)?;
        let object = value
            .as_object_mut()
            .ok_or_else(|| PluginError::manifest("manifest must be a JSON object"))?;

        let abi_version = match object.remove("abiVersion").or_else(|| object.remove("abi_version")) {
            None | Some(serde_json::Value::Null) => None,
            Some(raw) => {
                let abi = raw
                    .as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| PluginError::manifest(format!("invalid abiVersion: {raw}")))?;
                Some(abi)
            }
        };

        let rustc_version = match object.remove("rustcVersion").or_else(|| object.remove("rustc_version")) {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(version)) => Some(version),
            Some(raw) => return Err(PluginError::manifest(format!("invalid rustcVersion: {raw}"))),
        };

        let metadata: PluginMetadata = serde_json::from_value(value)?;
        metadata.validate()?;

        Ok(Self {
            metadata,
            abi_version,
            rustc_version,
        })
    }

    /// Render the manifest as JSON
    pub fn to_json(&self) -> Result<String> {
        let mut value = serde_json::to_value(&self.metadata)?;
        if let Some(object) = value.as_object_mut() {
            if let Some(abi) = self.abi_version {
                object.insert("abiVersion".to_string(), abi.into());
            }
            if let Some(rustc) = &self.rustc_version {
                object.insert("rustcVersion".to_string(), rustc.clone().into());
            }
        }
        Ok(serde_json::to_string(&value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version_pads_short_forms() {
        assert_eq!(parse_version("1").unwrap(), Version::new(1, 0, 0));
        assert_eq!(parse_version("1.2").unwrap(), Version::new(1, 2, 0));
        assert_eq!(parse_version("v2.0.1").unwrap(), Version::new(2, 0, 1));
        assert_eq!(
            parse_version("1.0.0-beta.1").unwrap(),
            Version::parse("1.0.0-beta.1").unwrap()
        );
    }

    #[test]
    fn test_parse_version_rejects_garbage() {
        assert!(parse_version("").is_err());
        assert!(parse_version("one.two").is_err());
        assert!(parse_version("1.2.3.4").is_err());
    }

    #[test]
    fn test_range_is_half_open() {
        let dep = DependencyDescriptor::required("a")
            .at_least(Version::new(1, 0, 0))
            .below(Version::new(2, 0, 0));

        assert!(!dep.accepts(&Version::new(0, 5, 0)));
        assert!(dep.accepts(&Version::new(1, 0, 0)));
        assert!(dep.accepts(&Version::new(1, 9, 9)));
        assert!(!dep.accepts(&Version::new(2, 0, 0)));
        assert_eq!(dep.range(), "[1.0.0, 2.0.0)");
    }

    #[test]
    fn test_unbounded_range_accepts_everything() {
        let dep = DependencyDescriptor::optional("a");
        assert!(dep.accepts(&Version::new(0, 0, 1)));
        assert!(dep.accepts(&Version::new(99, 0, 0)));
        assert_eq!(dep.to_string(), "a any version (optional)");
    }

    #[test]
    fn test_manifest_parse_camel_case() {
        let manifest = PluginManifest::parse(
            r#"{
                "name": "reporter",
                "version": "0.3",
                "author": "ops",
                "dependencies": [
                    {"pluginName": "counter", "minVersion": "0.1.0", "maxVersion": "1.0.0"},
                    {"pluginName": "metrics", "minVersion": "", "required": false}
                ],
                "loadPriority": 10,
                "abiVersion": 1,
                "rustcVersion": "rustc 1.80.0 (051478957 2024-07-21)"
            }"#,
        )
        .unwrap();

        let meta = &manifest.metadata;
        assert_eq!(meta.name, "reporter");
        assert_eq!(meta.version, Version::new(0, 3, 0));
        assert_eq!(meta.load_priority, 10);
        assert_eq!(manifest.abi_version, Some(1));
        assert_eq!(
            manifest.rustc_version.as_deref(),
            Some("rustc 1.80.0 (051478957 2024-07-21)")
        );
        assert!(meta.custom_fields.is_empty());
        assert_eq!(meta.dependencies.len(), 2);
        assert!(meta.dependencies[0].required);
        assert_eq!(meta.dependencies[0].max_version, Some(Version::new(1, 0, 0)));
        assert!(!meta.dependencies[1].required);
        assert_eq!(meta.dependencies[1].min_version, None);
    }

    #[test]
    fn test_manifest_accepts_snake_case_and_defaults() {
        let manifest = PluginManifest::parse(
            r#"{"name": "core", "version": "1.0.0",
                "dependencies": [{"plugin_name": "base", "min_version": "1.0"}],
                "load_priority": 5}"#,
        )
        .unwrap();

        assert_eq!(manifest.metadata.load_priority, 5);
        assert_eq!(manifest.abi_version, None);
        assert_eq!(manifest.rustc_version, None);
        assert_eq!(
            manifest.metadata.dependencies[0].min_version,
            Some(Version::new(1, 0, 0))
        );

        let bare = PluginManifest::parse(r#"{"name": "bare", "version": "1"}"#).unwrap();
        assert_eq!(bare.metadata.load_priority, DEFAULT_LOAD_PRIORITY);
        assert!(bare.metadata.dependencies.is_empty());
    }

    #[test]
    fn test_manifest_rejects_invalid_input() {
        assert!(PluginManifest::parse("not json").is_err());
        assert!(PluginManifest::parse("[1, 2]").is_err());
        assert!(PluginManifest::parse(r#"{"name": "", "version": "1.0.0"}"#).is_err());
        assert!(PluginManifest::parse(r#"{"name": "x", "version": "abc"}"#).is_err());
        assert!(PluginManifest::parse(r#"{"name": "x", "version": "1.0.0", "abiVersion": -1}"#).is_err());
        assert!(PluginManifest::parse(r#"{"name": "x", "version": "1.0.0", "rustcVersion": 180}"#).is_err());
    }

    #[test]
    fn test_manifest_json_keeps_everything() {
        let metadata = PluginMetadata::new("reporter", Version::new(0, 2, 0))
            .with_author("ops")
            .with_priority(7)
            .with_custom_field("channel", "stable")
            .with_dependency(
                DependencyDescriptor::required("counter").below(Version::new(1, 0, 0)),
            );
        let manifest = PluginManifest::new(metadata);

        let json = manifest.to_json().unwrap();
        assert!(json.contains("\"loadPriority\":7"));
        assert!(json.contains("\"abiVersion\""));
        assert!(json.contains(&format!("\"rustcVersion\":\"{}\"", crate::ffi::RUSTC_VERSION)));

        assert_eq!(PluginManifest::parse(&json).unwrap(), manifest);
    }

    #[test]
    fn test_required_dependencies_filter() {
        let metadata = PluginMetadata::new("x", Version::new(1, 0, 0))
            .with_dependency(DependencyDescriptor::required("a"))
            .with_dependency(DependencyDescriptor::optional("b"));

        let required: Vec<_> = metadata
            .required_dependencies()
            .map(|d| d.plugin_name.as_str())
            .collect();
        assert_eq!(required, vec!["a"]);
        assert!(metadata.depends_on("b"));
        assert!(!metadata.depends_on("c"));
    }
}
