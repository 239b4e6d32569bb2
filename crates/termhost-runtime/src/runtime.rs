//! Runtime facade: wires the bus, registries, chain and plugin manager.

use std::sync::Arc;

use tokio::runtime::Handle;

use crate::builtins::register_builtins;
use crate::chain::{DispatchStats, HandlerChain};
use crate::command::CommandContext;
use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::events::EventBus;
use crate::loader::{DirectoryLoader, PluginLoader};
use crate::plugins::{LoadReport, PluginManager};
use crate::registry::CommandRegistry;
use crate::services::ServiceRegistry;

/// Builder for [`Runtime`].
#[derive(Default)]
pub struct RuntimeBuilder {
    config: Option<RuntimeConfig>,
    loader: Option<Arc<dyn PluginLoader>>,
    handle: Option<Handle>,
}

impl RuntimeBuilder {
    /// Use `config` instead of [`RuntimeConfig::default`].
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use `loader` instead of a [`DirectoryLoader`] over the configured
    /// plugin directory.
    pub fn loader(mut self, loader: impl PluginLoader + 'static) -> Self {
        self.loader = Some(Arc::new(loader));
        self
    }

    /// Tokio runtime used for async commands. Without one, async commands
    /// run on the runtime current at dispatch time.
    pub fn handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn build(self) -> Result<Runtime, RuntimeError> {
        let config = self.config.unwrap_or_default();
        let services = Arc::new(ServiceRegistry::new());

        let events = Arc::new(EventBus::new());
        let stats = Arc::new(DispatchStats::new());
        let commands = Arc::new(CommandRegistry::new());
        let loader = self
            .loader
            .unwrap_or_else(|| Arc::new(DirectoryLoader::from_config(&config)));

        services.register(Arc::new(config.clone()));
        services.register(Arc::clone(&events));
        services.register(Arc::clone(&stats));
        services.register(Arc::clone(&commands));
        services.register::<dyn PluginLoader>(loader);
        if let Some(handle) = self.handle {
            services.register(Arc::new(handle));
        }

        let plugins = Arc::new(PluginManager::from_services(&services)?);
        services.register(Arc::clone(&plugins));

        if config.builtins {
            register_builtins(&commands, Arc::clone(&stats), &plugins)?;
        }

        let chain = HandlerChain::standard(&services)?;
        tracing::debug!(
            stages = ?chain.stage_names(),
            services = ?services.registered(),
            "runtime assembled"
        );

        Ok(Runtime {
            config,
            services,
            events,
            stats,
            commands,
            plugins,
            chain,
        })
    }
}

/// The assembled command runtime.
pub struct Runtime {
    config: RuntimeConfig,
    services: Arc<ServiceRegistry>,
    events: Arc<EventBus>,
    stats: Arc<DispatchStats>,
    commands: Arc<CommandRegistry>,
    plugins: Arc<PluginManager>,
    chain: HandlerChain,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// Discover and load plugins through the configured loader.
    pub async fn load_plugins(&self) -> LoadReport {
        self.plugins.load_plugins().await
    }

    /// A context for `name`, resolved against the current command table.
    pub fn context_for(&self, name: &str, args: Vec<String>) -> CommandContext {
        self.commands.context_for(name, args)
    }

    /// Push a context through the handler chain.
    pub fn dispatch(&self, ctx: &mut CommandContext) -> bool {
        self.chain.dispatch(ctx)
    }

    /// Resolve and dispatch in one step.
    pub fn invoke(&self, name: &str, args: Vec<String>) -> CommandContext {
        let mut ctx = self.context_for(name, args);
        self.dispatch(&mut ctx);
        ctx
    }

    /// Unload every plugin, then drop all listeners and services.
    pub async fn shutdown(&self) {
        self.plugins.shutdown().await;
        self.events.clear();
        self.services.clear();
        tracing::info!("runtime shut down");
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    pub fn commands(&self) -> &Arc<CommandRegistry> {
        &self.commands
    }

    pub fn plugins(&self) -> &Arc<PluginManager> {
        &self.plugins
    }

    pub fn chain(&self) -> &HandlerChain {
        &self.chain
    }
}
