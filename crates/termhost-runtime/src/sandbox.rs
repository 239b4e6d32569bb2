//! WASM plugin sandbox using Extism (wasmtime).
//!
//! Each WASM plugin runs in its own isolated sandbox with a memory limit
//! and a fuel budget per call.

use std::path::Path;

use crate::error::RuntimeError;

// ─── Configuration ──────────────────────────────────────────────────────

/// Configuration for the WASM sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    /// Maximum memory in bytes (default: 32 MB).
    pub memory_limit: usize,
    /// Maximum fuel (instructions) per call (default: 1_000_000).
    pub fuel_limit: u64,
    /// Whether to enable WASI (default: false).
    /// When false, plugins cannot access env vars, filesystem, or stdio.
    pub wasi_enabled: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: 32 * 1024 * 1024,
            fuel_limit: 1_000_000,
            wasi_enabled: false,
        }
    }
}

impl SandboxConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            memory_limit: lookup("PLUGIN_MEMORY_LIMIT_MB")
                .and_then(|v| v.parse::<usize>().ok())
                .map(|mb| mb * 1024 * 1024)
                .unwrap_or(defaults.memory_limit),
            fuel_limit: lookup("PLUGIN_FUEL_LIMIT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.fuel_limit),
            wasi_enabled: lookup("PLUGIN_WASI_ENABLED")
                .unwrap_or_default()
                .eq_ignore_ascii_case("true"),
        }
    }

    /// Memory limit in 64 KiB WASM pages.
    pub fn memory_pages(&self) -> u32 {
        u32::try_from(self.memory_limit / 65536).unwrap_or(u32::MAX)
    }
}

// ─── Sandbox ────────────────────────────────────────────────────────────

/// A loaded WASM module.
///
/// Wraps an Extism plugin with a memory limit and a fuel budget that is
/// refilled at the start of every call.
pub struct PluginSandbox {
    plugin: extism::Plugin,
    config: SandboxConfig,
    plugin_name: String,
}

impl std::fmt::Debug for PluginSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSandbox")
            .field("plugin_name", &self.plugin_name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PluginSandbox {
    /// Load a WASM module from disk.
    pub fn load(wasm_path: &Path, config: SandboxConfig, name: &str) -> Result<Self, RuntimeError> {
        let wasm_bytes = std::fs::read(wasm_path)?;
        Self::from_bytes(wasm_bytes, config, name)
    }

    /// Instantiate an already validated WASM binary.
    pub fn from_bytes(
        wasm_bytes: Vec<u8>,
        config: SandboxConfig,
        name: &str,
    ) -> Result<Self, RuntimeError> {
        let manifest = extism::Manifest::new([extism::Wasm::data(wasm_bytes)])
            .with_memory_max(config.memory_pages());

        if config.wasi_enabled {
            tracing::warn!(
                plugin = %name,
                "WASI enabled for plugin; it can read the host environment"
            );
        }

        let plugin = extism::PluginBuilder::new(manifest)
            .with_wasi(config.wasi_enabled)
            .with_fuel_limit(config.fuel_limit)
            .build()
            .map_err(|e| RuntimeError::Sandbox(e.to_string()))?;

        Ok(Self {
            plugin,
            config,
            plugin_name: name.to_string(),
        })
    }

    /// Call an exported function with raw byte input and output.
    ///
    /// Errors are classified into fuel exhaustion, memory exceeded, or
    /// general sandbox errors.
    pub fn call(&mut self, function_name: &str, input: &[u8]) -> Result<Vec<u8>, RuntimeError> {
        self.plugin
            .call::<&[u8], Vec<u8>>(function_name, input)
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("fuel") {
                    RuntimeError::FuelExhausted(self.plugin_name.clone())
                } else if msg.contains("memory") {
                    RuntimeError::MemoryExceeded(self.plugin_name.clone())
                } else {
                    RuntimeError::Sandbox(msg)
                }
            })
    }

    /// Check if the module exports a function with the given name.
    pub fn has_function(&self, name: &str) -> bool {
        self.plugin.function_exists(name)
    }

    pub fn name(&self) -> &str {
        &self.plugin_name
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
