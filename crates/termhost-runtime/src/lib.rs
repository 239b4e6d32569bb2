//! termhost runtime
//!
//! Extensible command execution for terminal-style hosts. Commands are
//! routed through an ordered handler chain (observer, system, async,
//! default, sentinel); plugins contribute commands, configuration and
//! themes at runtime; an event bus reports completions and lifecycle
//! changes to any number of listeners. WASM plugins run in Extism
//! sandboxes with memory and fuel limits.

pub mod builtins;
pub mod chain;
pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod loader;
pub mod manifest;
pub mod plugins;
pub mod registry;
pub mod runtime;
pub mod sandbox;
pub mod services;
pub mod wasm;

pub use chain::{
    ChainBuilder, CommandHandler, DispatchStats, HandlerChain, PendingCommand, StageOutcome,
    StatsSnapshot,
};
pub use command::{Capability, Command, CommandContext, Extensions};
pub use config::RuntimeConfig;
pub use error::RuntimeError;
pub use events::{
    CommandCompletedPayload, CommandFailedPayload, ConfigChangedPayload, Event, EventBus,
    EventKind, PluginLifecyclePayload, SubscriptionId, ThemeRegisteredPayload,
};
pub use loader::{DirectoryLoader, PluginLoader, PluginSource, StaticLoader};
pub use manifest::PluginManifest;
pub use plugins::{LoadReport, Plugin, PluginConfig, PluginInfo, PluginManager, PluginState};
pub use registry::{CommandOwner, CommandRegistry};
pub use runtime::{Runtime, RuntimeBuilder};
pub use sandbox::{PluginSandbox, SandboxConfig};
pub use services::ServiceRegistry;
