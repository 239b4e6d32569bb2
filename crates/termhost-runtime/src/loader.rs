//! Plugin sources and the loaders that instantiate them.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::config::{RuntimeConfig, HOST_VERSION};
use crate::error::{panic_message, RuntimeError};
use crate::manifest::PluginManifest;
use crate::plugins::Plugin;
use crate::sandbox::{PluginSandbox, SandboxConfig};
use crate::wasm::{validate_wasm, WasmPlugin};

/// Manifest file expected in every plugin directory.
pub const MANIFEST_FILE: &str = "plugin.toml";

/// Where a plugin comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PluginSource {
    /// An in-process factory registered under this key.
    Static(String),
    /// A directory holding a `plugin.toml` manifest.
    Directory(PathBuf),
}

impl fmt::Display for PluginSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginSource::Static(key) => write!(f, "static:{key}"),
            PluginSource::Directory(path) => write!(f, "dir:{}", path.display()),
        }
    }
}

/// Discovers plugin sources and turns them into plugin instances.
#[async_trait]
pub trait PluginLoader: Send + Sync {
    async fn discover(&self) -> Result<Vec<PluginSource>, RuntimeError>;

    async fn load(&self, source: &PluginSource) -> Result<Box<dyn Plugin>, RuntimeError>;
}

// ─── Static loader ──────────────────────────────────────────────────────

pub type PluginFactory = Box<dyn Fn() -> Result<Box<dyn Plugin>, RuntimeError> + Send + Sync>;

/// Loads plugins compiled into the host, from registered factories.
///
/// Sources are discovered in registration order.
#[derive(Default)]
pub struct StaticLoader {
    factories: Vec<(String, PluginFactory)>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `key`, replacing an earlier one.
    pub fn register<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<Box<dyn Plugin>, RuntimeError> + Send + Sync + 'static,
    {
        let key = key.into();
        self.factories.retain(|(k, _)| *k != key);
        self.factories.push((key, Box::new(factory)));
    }

    pub fn with_plugin<F>(mut self, key: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn Plugin>, RuntimeError> + Send + Sync + 'static,
    {
        self.register(key, factory);
        self
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

#[async_trait]
impl PluginLoader for StaticLoader {
    async fn discover(&self) -> Result<Vec<PluginSource>, RuntimeError> {
        Ok(self
            .factories
            .iter()
            .map(|(key, _)| PluginSource::Static(key.clone()))
            .collect())
    }

    async fn load(&self, source: &PluginSource) -> Result<Box<dyn Plugin>, RuntimeError> {
        let PluginSource::Static(key) = source else {
            return Err(RuntimeError::Load(format!(
                "static loader cannot load {source}"
            )));
        };
        let (_, factory) = self
            .factories
            .iter()
            .find(|(k, _)| k == key)
            .ok_or_else(|| RuntimeError::NotFound(key.clone()))?;

        match catch_unwind(AssertUnwindSafe(factory)) {
            Ok(result) => result,
            Err(panic) => Err(RuntimeError::Load(format!(
                "plugin factory '{key}' panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    }
}

// ─── Directory loader ───────────────────────────────────────────────────

/// Loads WASM plugins from `<plugin_dir>/<name>/plugin.toml`.
#[derive(Debug, Clone)]
pub struct DirectoryLoader {
    plugin_dir: PathBuf,
    sandbox: SandboxConfig,
    max_wasm_size: u64,
    host_version: String,
}

impl DirectoryLoader {
    pub fn new(plugin_dir: impl Into<PathBuf>, sandbox: SandboxConfig) -> Self {
        let defaults = RuntimeConfig::default();
        Self {
            plugin_dir: plugin_dir.into(),
            sandbox,
            max_wasm_size: defaults.max_wasm_size,
            host_version: HOST_VERSION.to_string(),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.plugin_dir.clone(), config.sandbox.clone())
            .with_max_wasm_size(config.max_wasm_size)
    }

    pub fn with_max_wasm_size(mut self, bytes: u64) -> Self {
        self.max_wasm_size = bytes;
        self
    }

    pub fn with_host_version(mut self, version: impl Into<String>) -> Self {
        self.host_version = version.into();
        self
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    /// Read and validate the manifest of one plugin directory.
    pub async fn read_manifest(&self, dir: &Path) -> Result<PluginManifest, RuntimeError> {
        let content = tokio::fs::read_to_string(dir.join(MANIFEST_FILE))
            .await
            .map_err(|e| RuntimeError::Manifest(format!("failed to read {MANIFEST_FILE}: {e}")))?;
        let manifest = PluginManifest::parse_and_validate(&content)?;
        manifest.check_host_version(&self.host_version)?;
        Ok(manifest)
    }

    async fn read_wasm(&self, path: &Path) -> Result<Vec<u8>, RuntimeError> {
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            RuntimeError::WasmValidation(format!("failed to read WASM metadata: {e}"))
        })?;
        if metadata.len() > self.max_wasm_size {
            return Err(RuntimeError::WasmValidation(format!(
                "WASM binary too large: {} bytes (max: {} bytes)",
                metadata.len(),
                self.max_wasm_size
            )));
        }

        let wasm_bytes = tokio::fs::read(path)
            .await
            .map_err(|e| RuntimeError::WasmValidation(format!("failed to read WASM binary: {e}")))?;
        validate_wasm(&wasm_bytes, self.max_wasm_size)?;
        Ok(wasm_bytes)
    }
}

#[async_trait]
impl PluginLoader for DirectoryLoader {
    async fn discover(&self) -> Result<Vec<PluginSource>, RuntimeError> {
        if !tokio::fs::try_exists(&self.plugin_dir).await.unwrap_or(false) {
            tracing::debug!(dir = %self.plugin_dir.display(), "plugin directory does not exist");
            return Ok(Vec::new());
        }

        let mut sources = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.plugin_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if tokio::fs::try_exists(path.join(MANIFEST_FILE)).await.unwrap_or(false) {
                sources.push(PluginSource::Directory(path));
            } else {
                tracing::debug!(dir = %path.display(), "skipping directory without {MANIFEST_FILE}");
            }
        }
        sources.sort();
        Ok(sources)
    }

    async fn load(&self, source: &PluginSource) -> Result<Box<dyn Plugin>, RuntimeError> {
        let PluginSource::Directory(dir) = source else {
            return Err(RuntimeError::Load(format!(
                "directory loader cannot load {source}"
            )));
        };

        let manifest = self.read_manifest(dir).await?;
        let name = manifest.plugin.name.clone();
        let wasm_bytes = self.read_wasm(&dir.join(&manifest.build.wasm)).await?;

        let theme = match manifest.theme {
            Some(ref theme) => Some(
                tokio::fs::read_to_string(dir.join(&theme.file))
                    .await
                    .map_err(|e| RuntimeError::Load(format!("failed to read theme file: {e}")))?,
            ),
            None => None,
        };

        let config = self.sandbox.clone();
        let sandbox_name = name.clone();
        let sandbox = tokio::task::spawn_blocking(move || {
            PluginSandbox::from_bytes(wasm_bytes, config, &sandbox_name)
        })
        .await
        .map_err(|e| RuntimeError::Load(format!("sandbox initialisation aborted: {e}")))??;

        for command in &manifest.commands {
            if !sandbox.has_function(command.function()) {
                return Err(RuntimeError::Load(format!(
                    "plugin '{name}' does not export '{}' for command '{}'",
                    command.function(),
                    command.name
                )));
            }
        }

        tracing::debug!(plugin = %name, dir = %dir.display(), "wasm plugin instantiated");
        Ok(Box::new(WasmPlugin::new(manifest, sandbox, theme)))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
