//! Runtime configuration, read from the environment.

use std::path::PathBuf;

use crate::sandbox::SandboxConfig;

/// Default max WASM binary size: 50 MB.
pub const DEFAULT_MAX_WASM_SIZE_MB: u64 = 50;

/// Version reported to plugins that declare `min_host_version`.
pub const HOST_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Directory scanned for `<name>/plugin.toml` (default: `./plugins`).
    pub plugin_dir: PathBuf,
    /// Maximum accepted WASM binary size in bytes.
    pub max_wasm_size: u64,
    /// Register the host built-in commands.
    pub builtins: bool,
    pub sandbox: SandboxConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from("./plugins"),
            max_wasm_size: DEFAULT_MAX_WASM_SIZE_MB * 1024 * 1024,
            builtins: true,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            plugin_dir: lookup("TERMHOST_PLUGIN_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.plugin_dir),
            max_wasm_size: lookup("TERMHOST_WASM_MAX_SIZE_MB")
                .and_then(|v| v.parse::<u64>().ok())
                .map(|mb| mb * 1024 * 1024)
                .unwrap_or(defaults.max_wasm_size),
            builtins: lookup("TERMHOST_BUILTINS")
                .map(|v| !v.eq_ignore_ascii_case("false") && v != "0")
                .unwrap_or(defaults.builtins),
            sandbox: SandboxConfig::from_lookup(&lookup),
        }
    }
}
