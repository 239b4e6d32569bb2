//! Plugin manifest parsing and validation.
//!
//! Parses `plugin.toml` files that declare plugin metadata, the WASM
//! module, the commands it exports, an optional theme and the initial
//! configuration.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::command::Capability;
use crate::error::RuntimeError;
use crate::plugins::PluginConfig;

/// Plugin manifest parsed from `plugin.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub plugin: PluginMeta,
    pub build: BuildConfig,
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
    #[serde(default)]
    pub theme: Option<ThemeConfig>,
    #[serde(default)]
    pub config: toml::Table,
}

/// Plugin metadata section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMeta {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub min_host_version: Option<String>,
}

/// Build configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    pub wasm: String,
}

/// One `[[commands]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub usage: Option<String>,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub capability: Capability,
    /// Exported WASM function; defaults to the command name.
    #[serde(default)]
    pub function: Option<String>,
}

fn default_category() -> String {
    "general".to_string()
}

impl CommandSpec {
    pub fn function(&self) -> &str {
        self.function.as_deref().unwrap_or(&self.name)
    }

    pub fn usage(&self) -> &str {
        self.usage.as_deref().unwrap_or(&self.name)
    }
}

/// Theme section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThemeConfig {
    pub file: String,
}

// ─── Validation helpers ─────────────────────────────────────────────

/// Validate a plugin name against `^[a-z][a-z0-9-]{1,63}$`.
fn validate_plugin_name(name: &str) -> Result<(), RuntimeError> {
    let len = name.len();
    if !(2..=64).contains(&len) {
        return Err(RuntimeError::InvalidManifest(format!(
            "plugin name must be 2-64 characters, got {len}"
        )));
    }

    let mut chars = name.chars();
    if let Some(first) = chars.next() {
        if !first.is_ascii_lowercase() {
            return Err(RuntimeError::InvalidManifest(format!(
                "plugin name must start with a lowercase letter, got '{first}'"
            )));
        }
    }

    for ch in chars {
        if !ch.is_ascii_lowercase() && !ch.is_ascii_digit() && ch != '-' {
            return Err(RuntimeError::InvalidManifest(format!(
                "plugin name contains invalid character '{ch}'"
            )));
        }
    }

    Ok(())
}

/// Command names are what the user types: 1-64 characters, no whitespace.
fn validate_command_name(name: &str) -> Result<(), RuntimeError> {
    if name.is_empty() || name.len() > 64 {
        return Err(RuntimeError::InvalidManifest(format!(
            "command name must be 1-64 characters, got {}",
            name.len()
        )));
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(RuntimeError::InvalidManifest(format!(
            "command name must not contain whitespace: '{name}'"
        )));
    }
    Ok(())
}

fn validate_semver(value: &str, field_name: &str) -> Result<semver::Version, RuntimeError> {
    semver::Version::parse(value).map_err(|_| {
        RuntimeError::InvalidManifest(format!("{field_name} is not valid semver: '{value}'"))
    })
}

/// Validate that a path is safe (no `..` components, not absolute).
fn validate_path_safety(path: &str, field_name: &str) -> Result<(), RuntimeError> {
    let p = std::path::Path::new(path);
    if p.is_absolute() {
        return Err(RuntimeError::InvalidManifest(format!(
            "{field_name} must be a relative path, got absolute: '{path}'"
        )));
    }
    if p.components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(RuntimeError::InvalidManifest(format!(
            "{field_name} must not contain '..': '{path}'"
        )));
    }
    Ok(())
}

impl PluginManifest {
    /// Parse a plugin manifest from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, RuntimeError> {
        let manifest: PluginManifest = toml::from_str(toml_str)?;
        Ok(manifest)
    }

    /// Validate all fields of a parsed manifest.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        validate_plugin_name(&self.plugin.name)?;
        validate_semver(&self.plugin.version, "plugin.version")?;

        if self.plugin.description.len() > 500 {
            return Err(RuntimeError::InvalidManifest(format!(
                "plugin.description must be at most 500 characters, got {}",
                self.plugin.description.len()
            )));
        }

        if let Some(ref min_ver) = self.plugin.min_host_version {
            validate_semver(min_ver, "plugin.min_host_version")?;
        }

        validate_path_safety(&self.build.wasm, "build.wasm")?;
        if !self.build.wasm.ends_with(".wasm") {
            return Err(RuntimeError::InvalidManifest(format!(
                "build.wasm must end with '.wasm', got '{}'",
                self.build.wasm
            )));
        }

        let mut seen = HashSet::new();
        for command in &self.commands {
            validate_command_name(&command.name)?;
            if !seen.insert(command.name.to_ascii_lowercase()) {
                return Err(RuntimeError::InvalidManifest(format!(
                    "command '{}' is declared more than once",
                    command.name
                )));
            }
            if command.function().is_empty() {
                return Err(RuntimeError::InvalidManifest(format!(
                    "command '{}' has an empty function name",
                    command.name
                )));
            }
        }

        if let Some(ref theme) = self.theme {
            validate_path_safety(&theme.file, "theme.file")?;
        }

        Ok(())
    }

    /// Parse and validate a plugin manifest from a TOML string.
    pub fn parse_and_validate(toml_str: &str) -> Result<Self, RuntimeError> {
        let manifest = Self::parse(toml_str)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Reject the plugin when it needs a newer host than `host_version`.
    pub fn check_host_version(&self, host_version: &str) -> Result<(), RuntimeError> {
        let Some(ref min) = self.plugin.min_host_version else {
            return Ok(());
        };
        let required = validate_semver(min, "plugin.min_host_version")?;
        let host = semver::Version::parse(host_version)?;
        if host < required {
            return Err(RuntimeError::Load(format!(
                "plugin '{}' requires host {required} or newer, running {host}",
                self.plugin.name
            )));
        }
        Ok(())
    }

    /// The `[config]` table as a plugin configuration.
    pub fn initial_config(&self) -> Result<PluginConfig, RuntimeError> {
        match serde_json::to_value(&self.config)? {
            serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
            _ => Ok(PluginConfig::new()),
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Full valid TOML manifest with all sections populated.
    const FULL_VALID_TOML: &str = r#"
[plugin]
name = "weather"
version = "1.2.3"
description = "Weather lookups"
min_host_version = "0.1.0"

[build]
wasm = "target/weather.wasm"

[[commands]]
name = "forecast"
description = "Show the forecast"
usage = "forecast <city>"
category = "weather"
capability = "async"
function = "run_forecast"

[[commands]]
name = "units"

[theme]
file = "theme.toml"

[config]
units = "metric"
days = 3
"#;

    const MINIMAL_VALID_TOML: &str = r#"
[plugin]
name = "ab"
version = "0.1.0"

[build]
wasm = "plugin.wasm"
"#;

    fn with_plugin_section(name: &str, version: &str) -> String {
        format!(
            "[plugin]\nname = \"{name}\"\nversion = \"{version}\"\n\n[build]\nwasm = \"p.wasm\"\n"
        )
    }

    // ── Parsing ─────────────────────────────────────────────────────

    #[test]
    fn test_parse_valid_manifest() {
        let manifest = PluginManifest::parse_and_validate(FULL_VALID_TOML).unwrap();
        assert_eq!(manifest.plugin.name, "weather");
        assert_eq!(manifest.plugin.min_host_version.as_deref(), Some("0.1.0"));
        assert_eq!(manifest.build.wasm, "target/weather.wasm");
        assert_eq!(manifest.commands.len(), 2);

        let forecast = &manifest.commands[0];
        assert_eq!(forecast.capability, Capability::Async);
        assert_eq!(forecast.function(), "run_forecast");
        assert_eq!(forecast.usage(), "forecast <city>");
        assert_eq!(forecast.category, "weather");

        let units = &manifest.commands[1];
        assert_eq!(units.capability, Capability::Plain);
        assert_eq!(units.function(), "units");
        assert_eq!(units.usage(), "units");
        assert_eq!(units.category, "general");

        assert_eq!(manifest.theme.unwrap().file, "theme.toml");
    }

    #[test]
    fn test_parse_minimal_manifest() {
        let manifest = PluginManifest::parse_and_validate(MINIMAL_VALID_TOML).unwrap();
        assert!(manifest.commands.is_empty());
        assert!(manifest.theme.is_none());
        assert!(manifest.initial_config().unwrap().is_empty());
    }

    #[test]
    fn test_parse_missing_build_section() {
        let err = PluginManifest::parse("[plugin]\nname = \"ab\"\nversion = \"0.1.0\"\n")
            .unwrap_err();
        assert!(matches!(err, RuntimeError::TomlParse(_)));
    }

    #[test]
    fn test_parse_unknown_capability() {
        let toml = format!(
            "{}\n[[commands]]\nname = \"x\"\ncapability = \"root\"\n",
            with_plugin_section("ab", "0.1.0")
        );
        assert!(PluginManifest::parse(&toml).is_err());
    }

    #[test]
    fn test_initial_config_from_table() {
        let manifest = PluginManifest::parse(FULL_VALID_TOML).unwrap();
        let config = manifest.initial_config().unwrap();
        assert_eq!(config["units"], "metric");
        assert_eq!(config["days"], 3);
    }

    // ── Plugin metadata ─────────────────────────────────────────────

    #[test]
    fn test_invalid_plugin_names() {
        for name in ["a", "Weather", "1abc", "has_underscore", "has space"] {
            let manifest = PluginManifest::parse(&with_plugin_section(name, "0.1.0")).unwrap();
            let err = manifest.validate().unwrap_err();
            assert!(
                matches!(err, RuntimeError::InvalidManifest(_)),
                "name {name:?} should be rejected"
            );
        }
        let long = format!("a{}", "b".repeat(64));
        let manifest = PluginManifest::parse(&with_plugin_section(&long, "0.1.0")).unwrap();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_invalid_version() {
        let manifest = PluginManifest::parse(&with_plugin_section("ab", "one")).unwrap();
        let err = manifest.validate().unwrap_err();
        assert!(err.to_string().contains("plugin.version"));
    }

    // ── Paths ───────────────────────────────────────────────────────

    #[test]
    fn test_wasm_path_rules() {
        for wasm in ["../escape.wasm", "/abs/plugin.wasm", "plugin.so"] {
            let toml = format!("[plugin]\nname = \"ab\"\nversion = \"0.1.0\"\n\n[build]\nwasm = \"{wasm}\"\n");
            let manifest = PluginManifest::parse(&toml).unwrap();
            assert!(manifest.validate().is_err(), "{wasm} should be rejected");
        }
    }

    #[test]
    fn test_theme_path_traversal() {
        let toml = format!(
            "{}\n[theme]\nfile = \"../../etc/passwd\"\n",
            with_plugin_section("ab", "0.1.0")
        );
        let manifest = PluginManifest::parse(&toml).unwrap();
        assert!(manifest.validate().unwrap_err().to_string().contains("theme.file"));
    }

    // ── Commands ────────────────────────────────────────────────────

    #[test]
    fn test_duplicate_command_names() {
        let toml = format!(
            "{}\n[[commands]]\nname = \"go\"\n\n[[commands]]\nname = \"GO\"\n",
            with_plugin_section("ab", "0.1.0")
        );
        let err = PluginManifest::parse_and_validate(&toml).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_command_name_with_whitespace() {
        let toml = format!(
            "{}\n[[commands]]\nname = \"two words\"\n",
            with_plugin_section("ab", "0.1.0")
        );
        assert!(PluginManifest::parse_and_validate(&toml).is_err());
    }

    // ── Host version ────────────────────────────────────────────────

    #[test]
    fn test_check_host_version() {
        let manifest = PluginManifest::parse(FULL_VALID_TOML).unwrap();
        assert!(manifest.check_host_version("0.1.0").is_ok());
        assert!(manifest.check_host_version("2.0.0").is_ok());

        let toml = "[plugin]\nname = \"ab\"\nversion = \"0.1.0\"\nmin_host_version = \"9.0.0\"\n\n[build]\nwasm = \"p.wasm\"\n";
        let manifest = PluginManifest::parse(toml).unwrap();
        let err = manifest.check_host_version("0.1.0").unwrap_err();
        assert!(err.to_string().contains("requires host 9.0.0"));

        let manifest = PluginManifest::parse(MINIMAL_VALID_TOML).unwrap();
        assert!(manifest.check_host_version("0.0.1").is_ok());
    }
}
