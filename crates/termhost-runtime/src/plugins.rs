//! Plugin lifecycle manager: loads, configures, disables and unloads plugins.
//!
//! The `PluginManager` owns every plugin instance the loader produced. It
//! changes the set of dispatchable commands only through the
//! [`CommandRegistry`] and reports every lifecycle transition on the
//! [`EventBus`]. A fault in one plugin never stops the others from loading
//! or shutting down.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::command::Command;
use crate::error::{panic_message, RuntimeError};
use crate::events::{
    ConfigChangedPayload, Event, EventBus, EventKind, PluginLifecyclePayload,
    ThemeRegisteredPayload,
};
use crate::loader::{PluginLoader, PluginSource};
use crate::registry::CommandRegistry;
use crate::services::ServiceRegistry;

/// Per-plugin configuration: string keys to JSON values.
pub type PluginConfig = HashMap<String, serde_json::Value>;

/// A dynamically loaded unit contributing commands, configuration and
/// optionally a theme.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "0.0.0"
    }

    /// Commands contributed by this plugin. Called once at load time.
    fn commands(&self) -> Vec<Arc<dyn Command>>;

    /// Opaque theme payload, registered at load time when present.
    fn theme(&self) -> Option<String> {
        None
    }

    /// Configuration applied right after the plugin is instantiated.
    fn initial_config(&self) -> PluginConfig {
        PluginConfig::new()
    }

    /// Apply a configuration mapping. An error keeps the previous mapping.
    fn configure(&mut self, _config: &PluginConfig) -> Result<(), RuntimeError> {
        Ok(())
    }

    /// Called before the plugin's commands are removed.
    fn on_disable(&mut self) -> Result<(), RuntimeError> {
        Ok(())
    }
}

/// Lifecycle state of a managed plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    /// Commands are registered and dispatchable.
    Loaded,
    /// Kept in memory with its configuration; commands are not registered.
    Disabled,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginState::Loaded => f.write_str("loaded"),
            PluginState::Disabled => f.write_str("disabled"),
        }
    }
}

/// Introspection record for one managed plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub state: PluginState,
    pub commands: Vec<String>,
    pub source: String,
}

/// A plugin source that failed to load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadFailure {
    pub source: String,
    pub error: String,
}

/// Outcome of [`PluginManager::load_plugins`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub failed: Vec<LoadFailure>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

struct ManagedPlugin {
    plugin: Box<dyn Plugin>,
    version: String,
    state: PluginState,
    config: PluginConfig,
    /// Kept so that a disabled plugin can be re-enabled without reloading.
    commands: Vec<Arc<dyn Command>>,
    /// Lowercase command names, fixed when the plugin was loaded.
    command_names: Vec<String>,
    source: PluginSource,
}

impl ManagedPlugin {
    fn lifecycle_payload(&self, name: &str, commands: Vec<String>) -> PluginLifecyclePayload {
        PluginLifecyclePayload {
            plugin: name.to_string(),
            version: self.version.clone(),
            commands,
        }
    }
}

/// What a freshly configured plugin contributes.
struct Contribution {
    version: String,
    commands: Vec<Arc<dyn Command>>,
    names: Vec<String>,
    theme: Option<String>,
}

/// Lifecycle events owed for one removed plugin.
struct Retired {
    name: String,
    disabled: Option<PluginLifecyclePayload>,
    unloaded: PluginLifecyclePayload,
}

/// Run a plugin hook, turning an error or a panic into `RuntimeError::Hook`.
fn guard_hook<T>(
    plugin: &str,
    hook: &str,
    f: impl FnOnce() -> Result<T, RuntimeError>,
) -> Result<T, RuntimeError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(RuntimeError::Hook(format!("{plugin}: {hook}: {e}"))),
        Err(panic) => Err(RuntimeError::Hook(format!(
            "{plugin}: {hook} panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

/// Run plugin-supplied code during loading. A panic becomes
/// `RuntimeError::Load`; errors pass through unchanged.
fn contain_panic<T>(
    plugin: &str,
    what: &str,
    f: impl FnOnce() -> Result<T, RuntimeError>,
) -> Result<T, RuntimeError> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|panic| {
        Err(RuntimeError::Load(format!(
            "{plugin}: {what} panicked: {}",
            panic_message(panic.as_ref())
        )))
    })
}

fn config_map(config: &PluginConfig) -> serde_json::Map<String, serde_json::Value> {
    config
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

// ─── Manager ────────────────────────────────────────────────────────────

/// Owns the loaded plugins and keeps the command registry in sync with them.
///
/// Invariant: the registry holds the host built-ins plus the commands of
/// every plugin in [`PluginState::Loaded`], and nothing else. Every change
/// to the registry or the theme table happens under the plugin map's
/// write lock.
pub struct PluginManager {
    /// Plugins indexed by name.
    plugins: RwLock<HashMap<String, ManagedPlugin>>,
    /// Plugin name → opaque theme payload. Locked after `plugins`.
    themes: RwLock<HashMap<String, String>>,
    commands: Arc<CommandRegistry>,
    events: Arc<EventBus>,
    loader: Arc<dyn PluginLoader>,
}

impl PluginManager {
    pub fn new(
        commands: Arc<CommandRegistry>,
        events: Arc<EventBus>,
        loader: Arc<dyn PluginLoader>,
    ) -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
            themes: RwLock::new(HashMap::new()),
            commands,
            events,
            loader,
        }
    }

    /// Build a manager from the registry, bus and loader registered as services.
    pub fn from_services(services: &ServiceRegistry) -> Result<Self, RuntimeError> {
        Ok(Self::new(
            services.resolve::<CommandRegistry>()?,
            services.resolve::<EventBus>()?,
            services.resolve::<dyn PluginLoader>()?,
        ))
    }

    fn emit<P: Serialize>(&self, kind: EventKind, payload: &P) {
        self.events.emit(&Event::with_payload(kind, payload));
    }

    // ── Loading ──────────────────────────────────────────────────────

    /// Discover and load every plugin the loader offers.
    ///
    /// Each source is loaded independently; failures are logged and
    /// reported without affecting the others.
    pub async fn load_plugins(&self) -> LoadReport {
        let mut report = LoadReport::default();

        let sources = match self.loader.discover().await {
            Ok(sources) => sources,
            Err(e) => {
                tracing::error!("failed to discover plugins: {e}");
                report.failed.push(LoadFailure {
                    source: "discovery".to_string(),
                    error: e.to_string(),
                });
                return report;
            }
        };

        for source in sources {
            match self.load_source(&source).await {
                Ok(name) => report.loaded.push(name),
                Err(e) => {
                    tracing::error!(source = %source, "failed to load plugin: {e}");
                    report.failed.push(LoadFailure {
                        source: source.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "plugin loading finished"
        );
        report
    }

    /// Load a single plugin source. Returns the plugin name.
    ///
    /// Every call into the plugin is contained: a panic fails this source
    /// only.
    pub async fn load_source(&self, source: &PluginSource) -> Result<String, RuntimeError> {
        let mut plugin = self.loader.load(source).await?;
        let name = contain_panic(&source.to_string(), "name", || Ok(plugin.name().to_string()))?;
        if name.trim().is_empty() {
            return Err(RuntimeError::Load(format!(
                "plugin from {source} has an empty name"
            )));
        }

        let (version, names, theme_size) = {
            let mut plugins = self.plugins.write().await;
            if plugins.contains_key(&name) {
                return Err(RuntimeError::AlreadyExists(name));
            }

            let config = contain_panic(&name, "initial_config", || Ok(plugin.initial_config()))?;
            guard_hook(&name, "configure", || plugin.configure(&config))?;
            let Contribution {
                version,
                commands,
                names,
                theme,
            } = match self.contribute(&name, plugin.as_ref()) {
                Ok(contribution) => contribution,
                Err(e) => {
                    // Configured but never registered: still owed its cleanup.
                    if let Err(hook_err) = guard_hook(&name, "on_disable", || plugin.on_disable()) {
                        tracing::warn!(plugin = %name, "cleanup after failed load failed: {hook_err}");
                    }
                    return Err(e);
                }
            };

            let theme_size = match theme {
                Some(theme) => {
                    let size = theme.len();
                    self.themes.write().await.insert(name.clone(), theme);
                    Some(size)
                }
                None => None,
            };

            plugins.insert(
                name.clone(),
                ManagedPlugin {
                    plugin,
                    version: version.clone(),
                    state: PluginState::Loaded,
                    config,
                    commands,
                    command_names: names.clone(),
                    source: source.clone(),
                },
            );
            (version, names, theme_size)
        };

        if let Some(size_bytes) = theme_size {
            self.theme_registered(&name, size_bytes);
        }

        tracing::info!(
            plugin = %name,
            version = %version,
            commands = ?names,
            "plugin loaded"
        );
        self.emit(
            EventKind::PluginLoaded,
            &PluginLifecyclePayload {
                plugin: name.clone(),
                version,
                commands: names,
            },
        );
        Ok(name)
    }

    /// Collect a configured plugin's commands, theme and version and
    /// register the commands.
    fn contribute(&self, name: &str, plugin: &dyn Plugin) -> Result<Contribution, RuntimeError> {
        let commands = guard_hook(name, "commands", || Ok(plugin.commands()))?;
        let theme = guard_hook(name, "theme", || Ok(plugin.theme()))?;
        let version = contain_panic(name, "version", || Ok(plugin.version().to_string()))?;
        let names = contain_panic(name, "command registration", || {
            self.commands.register_plugin_commands(name, &commands)
        })?;
        Ok(Contribution {
            version,
            commands,
            names,
            theme,
        })
    }

    // ── Lifecycle transitions ────────────────────────────────────────

    /// Run the disable hook and remove the plugin's commands.
    ///
    /// A failing hook is logged; the commands are removed regardless.
    fn deactivate(&self, name: &str, entry: &mut ManagedPlugin) -> Vec<String> {
        if let Err(e) = guard_hook(name, "on_disable", || entry.plugin.on_disable()) {
            tracing::error!(plugin = %name, "disable hook failed, removing commands anyway: {e}");
        }
        let removed = self.commands.remove_plugin_commands(name);
        entry.state = PluginState::Disabled;
        removed
    }

    /// Deactivate a plugin already taken out of the map.
    fn retire(&self, name: String, mut entry: ManagedPlugin) -> Retired {
        let disabled = if entry.state == PluginState::Loaded {
            let removed = self.deactivate(&name, &mut entry);
            Some(entry.lifecycle_payload(&name, removed))
        } else {
            None
        };
        let unloaded = entry.lifecycle_payload(&name, entry.command_names.clone());
        Retired {
            name,
            disabled,
            unloaded,
        }
    }

    fn announce_retired(&self, retired: Retired) {
        if let Some(payload) = retired.disabled {
            self.emit(EventKind::PluginDisabled, &payload);
        }
        tracing::info!(plugin = %retired.name, "plugin unloaded");
        self.emit(EventKind::PluginUnloaded, &retired.unloaded);
    }

    /// Disable a loaded plugin.
    ///
    /// Returns `false` without side effects when no plugin of that name is
    /// loaded (absent or already disabled).
    pub async fn disable_plugin(&self, name: &str) -> bool {
        let payload = {
            let mut plugins = self.plugins.write().await;
            let Some(entry) = plugins.get_mut(name) else {
                return false;
            };
            if entry.state != PluginState::Loaded {
                return false;
            }
            let removed = self.deactivate(name, entry);
            entry.lifecycle_payload(name, removed)
        };

        tracing::info!(plugin = %name, commands = ?payload.commands, "plugin disabled");
        self.emit(EventKind::PluginDisabled, &payload);
        true
    }

    /// Re-register the commands of a disabled plugin.
    ///
    /// Enabling a plugin that is already loaded is a no-op.
    pub async fn enable_plugin(&self, name: &str) -> Result<(), RuntimeError> {
        let payload = {
            let mut plugins = self.plugins.write().await;
            let entry = plugins
                .get_mut(name)
                .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
            if entry.state == PluginState::Loaded {
                return Ok(());
            }
            let names = self
                .commands
                .register_plugin_commands(name, &entry.commands)?;
            entry.state = PluginState::Loaded;
            entry.lifecycle_payload(name, names)
        };

        tracing::info!(plugin = %name, "plugin enabled");
        self.emit(EventKind::PluginEnabled, &payload);
        Ok(())
    }

    /// Remove a plugin entirely, disabling it first when loaded.
    ///
    /// Returns `false` when no plugin of that name is managed.
    pub async fn unload_plugin(&self, name: &str) -> bool {
        let retired = {
            let mut plugins = self.plugins.write().await;
            let Some(entry) = plugins.remove(name) else {
                return false;
            };
            self.themes.write().await.remove(name);
            self.retire(name.to_string(), entry)
        };
        self.announce_retired(retired);
        true
    }

    /// Unload every plugin. Faults are isolated per plugin.
    ///
    /// The map is drained under one write lock, so a plugin loaded
    /// concurrently is either unloaded here or survives intact.
    pub async fn shutdown(&self) {
        let retired: Vec<Retired> = {
            let mut plugins = self.plugins.write().await;
            let mut drained: Vec<(String, ManagedPlugin)> =
                std::mem::take(&mut *plugins).into_iter().collect();
            drained.sort_by(|a, b| a.0.cmp(&b.0));
            self.themes.write().await.clear();
            drained
                .into_iter()
                .map(|(name, entry)| self.retire(name, entry))
                .collect()
        };
        for entry in retired {
            self.announce_retired(entry);
        }
        tracing::info!("plugin manager shut down");
    }

    // ── Configuration ────────────────────────────────────────────────

    /// Current configuration of a plugin.
    pub async fn plugin_config(&self, name: &str) -> Option<PluginConfig> {
        self.plugins
            .read()
            .await
            .get(name)
            .map(|entry| entry.config.clone())
    }

    /// Replace a plugin's configuration and apply it live.
    ///
    /// The plugin's `configure` hook runs first; when it fails the old
    /// mapping is kept and no event is emitted.
    pub async fn update_plugin_config(
        &self,
        name: &str,
        config: PluginConfig,
    ) -> Result<(), RuntimeError> {
        let payload = {
            let mut plugins = self.plugins.write().await;
            let entry = plugins
                .get_mut(name)
                .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
            guard_hook(name, "configure", || entry.plugin.configure(&config))?;
            let payload = ConfigChangedPayload {
                plugin: name.to_string(),
                config: config_map(&config),
            };
            entry.config = config;
            payload
        };

        tracing::info!(plugin = %name, keys = payload.config.len(), "plugin config updated");
        self.emit(EventKind::ConfigChanged, &payload);
        Ok(())
    }

    /// Set one configuration key, keeping the others.
    pub async fn set_plugin_config_value(
        &self,
        name: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), RuntimeError> {
        let mut config = self
            .plugin_config(name)
            .await
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        config.insert(key.to_string(), value);
        self.update_plugin_config(name, config).await
    }

    // ── Themes ───────────────────────────────────────────────────────

    /// Associate an opaque theme payload with a plugin name.
    pub async fn register_plugin_theme(&self, name: &str, content: String) {
        let size_bytes = content.len();
        self.themes.write().await.insert(name.to_string(), content);
        self.theme_registered(name, size_bytes);
    }

    fn theme_registered(&self, name: &str, size_bytes: usize) {
        tracing::debug!(plugin = %name, size_bytes, "theme registered");
        self.emit(
            EventKind::ThemeRegistered,
            &ThemeRegisteredPayload {
                plugin: name.to_string(),
                size_bytes,
            },
        );
    }

    pub async fn theme(&self, name: &str) -> Option<String> {
        self.themes.read().await.get(name).cloned()
    }

    /// Names of the plugins with a registered theme, sorted.
    pub async fn themes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.themes.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    // ── Query methods ────────────────────────────────────────────────

    /// Every managed plugin, sorted by name.
    pub async fn loaded_plugins(&self) -> Vec<PluginInfo> {
        let mut infos: Vec<PluginInfo> = self
            .plugins
            .read()
            .await
            .iter()
            .map(|(name, entry)| PluginInfo {
                name: name.clone(),
                version: entry.version.clone(),
                state: entry.state,
                commands: entry.command_names.clone(),
                source: entry.source.to_string(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub async fn plugin_state(&self, name: &str) -> Option<PluginState> {
        self.plugins.read().await.get(name).map(|entry| entry.state)
    }

    /// Number of plugins in [`PluginState::Loaded`].
    pub async fn loaded_count(&self) -> usize {
        self.plugins
            .read()
            .await
            .values()
            .filter(|entry| entry.state == PluginState::Loaded)
            .count()
    }

    pub async fn is_loaded(&self, name: &str) -> bool {
        self.plugin_state(name).await == Some(PluginState::Loaded)
    }

    /// Commands a plugin contributes (registered only while loaded).
    pub async fn plugin_commands(&self, name: &str) -> Vec<String> {
        self.plugins
            .read()
            .await
            .get(name)
            .map(|entry| entry.command_names.clone())
            .unwrap_or_default()
    }

    pub fn command_registry(&self) -> &Arc<CommandRegistry> {
        &self.commands
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
