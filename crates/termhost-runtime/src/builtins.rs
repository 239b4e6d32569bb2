//! Host built-in commands: `help`, `echo`, `sleep`, `stats` and `plugin`.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;

use crate::chain::DispatchStats;
use crate::command::{Capability, Command, CommandContext, SYSTEM_CATEGORY};
use crate::error::RuntimeError;
use crate::plugins::PluginManager;
use crate::registry::CommandRegistry;

/// Upper bound for `sleep`, in milliseconds.
const MAX_SLEEP_MS: u64 = 60_000;

/// Register every built-in as a host command.
pub fn register_builtins(
    registry: &Arc<CommandRegistry>,
    stats: Arc<DispatchStats>,
    plugins: &Arc<PluginManager>,
) -> Result<(), RuntimeError> {
    let commands: [Arc<dyn Command>; 5] = [
        Arc::new(HelpCommand::new(registry)),
        Arc::new(EchoCommand),
        Arc::new(SleepCommand),
        Arc::new(StatsCommand::new(stats)),
        Arc::new(PluginCommand::new(plugins)),
    ];
    for command in commands {
        registry.register_builtin(command)?;
    }
    tracing::debug!(count = registry.len(), "built-in commands registered");
    Ok(())
}

// ─── help ───────────────────────────────────────────────────────────────

/// Lists the registered commands, or describes one.
pub struct HelpCommand {
    registry: Weak<CommandRegistry>,
}

impl HelpCommand {
    pub fn new(registry: &Arc<CommandRegistry>) -> Self {
        Self {
            registry: Arc::downgrade(registry),
        }
    }
}

impl Command for HelpCommand {
    fn name(&self) -> &str {
        "help"
    }

    fn description(&self) -> &str {
        "List commands, or describe one"
    }

    fn usage(&self) -> &str {
        "help [command]"
    }

    fn execute(&self, ctx: &mut CommandContext) -> Result<(), RuntimeError> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| RuntimeError::Command("command registry is gone".into()))?;
        let table = registry.snapshot();

        if let Some(name) = ctx.arg(0) {
            let entry = table
                .get(name)
                .ok_or_else(|| RuntimeError::InvalidArguments(format!("no such command: {name}")))?;
            let command = &entry.command;
            let text = format!(
                "{}\n  {}\n  category: {}, capability: {}, provided by {}",
                command.usage(),
                command.description(),
                command.category(),
                command.capability(),
                entry.owner
            );
            ctx.set_result(text);
            return Ok(());
        }

        let mut by_category: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
        for entry in table.entries() {
            by_category
                .entry(entry.command.category().to_ascii_lowercase())
                .or_default()
                .push((
                    entry.command.usage().to_string(),
                    entry.command.description().to_string(),
                ));
        }

        let mut lines = Vec::new();
        for (category, mut commands) in by_category {
            commands.sort();
            lines.push(format!("{category}:"));
            for (usage, description) in commands {
                if description.is_empty() {
                    lines.push(format!("  {usage}"));
                } else {
                    lines.push(format!("  {usage:<24} {description}"));
                }
            }
        }
        ctx.set_result(lines.join("\n"));
        Ok(())
    }
}

// ─── echo ───────────────────────────────────────────────────────────────

pub struct EchoCommand;

impl Command for EchoCommand {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Print the arguments"
    }

    fn usage(&self) -> &str {
        "echo <text...>"
    }

    fn execute(&self, ctx: &mut CommandContext) -> Result<(), RuntimeError> {
        let text = ctx.args().join(" ");
        ctx.set_result(text);
        Ok(())
    }
}

// ─── sleep ──────────────────────────────────────────────────────────────

/// Waits in the background; useful to watch async completion events.
pub struct SleepCommand;

impl SleepCommand {
    fn duration(ctx: &CommandContext) -> Result<u64, RuntimeError> {
        let raw = ctx
            .arg(0)
            .ok_or_else(|| RuntimeError::InvalidArguments("usage: sleep <ms>".into()))?;
        let ms: u64 = raw
            .parse()
            .map_err(|_| RuntimeError::InvalidArguments(format!("not a number of milliseconds: {raw}")))?;
        if ms > MAX_SLEEP_MS {
            return Err(RuntimeError::InvalidArguments(format!(
                "sleep is limited to {MAX_SLEEP_MS} ms"
            )));
        }
        Ok(ms)
    }
}

#[async_trait]
impl Command for SleepCommand {
    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Sleep in the background"
    }

    fn usage(&self) -> &str {
        "sleep <ms>"
    }

    fn capability(&self) -> Capability {
        Capability::Async
    }

    fn execute(&self, ctx: &mut CommandContext) -> Result<(), RuntimeError> {
        let ms = Self::duration(ctx)?;
        std::thread::sleep(Duration::from_millis(ms));
        ctx.set_result(format!("slept {ms} ms"));
        Ok(())
    }

    async fn execute_async(&self, ctx: &mut CommandContext) -> Result<(), RuntimeError> {
        let ms = Self::duration(ctx)?;
        tokio::time::sleep(Duration::from_millis(ms)).await;
        ctx.set_result(format!("slept {ms} ms"));
        Ok(())
    }
}

// ─── stats ──────────────────────────────────────────────────────────────

pub struct StatsCommand {
    stats: Arc<DispatchStats>,
}

impl StatsCommand {
    pub fn new(stats: Arc<DispatchStats>) -> Self {
        Self { stats }
    }
}

impl Command for StatsCommand {
    fn name(&self) -> &str {
        "stats"
    }

    fn description(&self) -> &str {
        "Show dispatch counters"
    }

    fn category(&self) -> &str {
        SYSTEM_CATEGORY
    }

    fn capability(&self) -> Capability {
        Capability::System
    }

    fn execute(&self, ctx: &mut CommandContext) -> Result<(), RuntimeError> {
        let s = self.stats.snapshot();
        ctx.set_result(format!(
            "dispatched: {}\ncompleted: {}\nfailed: {}\nunknown: {}\nasync: {}",
            s.observed, s.completed, s.failed, s.unknown, s.async_dispatched
        ));
        Ok(())
    }
}

// ─── plugin ─────────────────────────────────────────────────────────────

/// Drives the plugin manager from the shell.
pub struct PluginCommand {
    plugins: Weak<PluginManager>,
}

impl PluginCommand {
    pub fn new(plugins: &Arc<PluginManager>) -> Self {
        Self {
            plugins: Arc::downgrade(plugins),
        }
    }

    fn required<'a>(ctx: &'a CommandContext, index: usize, what: &str) -> Result<&'a str, RuntimeError> {
        ctx.arg(index)
            .ok_or_else(|| RuntimeError::InvalidArguments(format!("missing {what}")))
    }

    async fn run(&self, manager: &PluginManager, ctx: &CommandContext) -> Result<String, RuntimeError> {
        let sub = ctx.arg(0).unwrap_or("list");
        match sub {
            "list" => {
                let infos = manager.loaded_plugins().await;
                if infos.is_empty() {
                    return Ok("no plugins".to_string());
                }
                Ok(infos
                    .iter()
                    .map(|p| {
                        format!(
                            "{} {} [{}] {}",
                            p.name,
                            p.version,
                            p.state,
                            p.commands.join(", ")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
            "enable" => {
                let name = Self::required(ctx, 1, "plugin name")?;
                manager.enable_plugin(name).await?;
                Ok(format!("enabled {name}"))
            }
            "disable" => {
                let name = Self::required(ctx, 1, "plugin name")?;
                if manager.disable_plugin(name).await {
                    Ok(format!("disabled {name}"))
                } else {
                    Err(RuntimeError::InvalidArguments(format!("{name} is not loaded")))
                }
            }
            "unload" => {
                let name = Self::required(ctx, 1, "plugin name")?;
                if manager.unload_plugin(name).await {
                    Ok(format!("unloaded {name}"))
                } else {
                    Err(RuntimeError::NotFound(name.to_string()))
                }
            }
            "config" => {
                let name = Self::required(ctx, 1, "plugin name")?;
                match (ctx.arg(2), ctx.args().get(3..)) {
                    (Some(key), Some(rest)) if !rest.is_empty() => {
                        let raw = rest.join(" ");
                        let value = serde_json::from_str(&raw)
                            .unwrap_or(serde_json::Value::String(raw));
                        manager.set_plugin_config_value(name, key, value).await?;
                        Ok(format!("{name}.{key} updated"))
                    }
                    (Some(_), _) => Err(RuntimeError::InvalidArguments(
                        "usage: plugin config <name> [<key> <value>]".into(),
                    )),
                    (None, _) => {
                        let config = manager
                            .plugin_config(name)
                            .await
                            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
                        let sorted: BTreeMap<_, _> = config.into_iter().collect();
                        Ok(serde_json::to_string_pretty(&sorted)?)
                    }
                }
            }
            other => Err(RuntimeError::InvalidArguments(format!(
                "unknown subcommand '{other}'; expected list, enable, disable, unload or config"
            ))),
        }
    }
}

#[async_trait]
impl Command for PluginCommand {
    fn name(&self) -> &str {
        "plugin"
    }

    fn description(&self) -> &str {
        "Manage plugins"
    }

    fn usage(&self) -> &str {
        "plugin <list|enable|disable|unload|config> [name] [key value]"
    }

    fn capability(&self) -> Capability {
        Capability::Async
    }

    fn execute(&self, _ctx: &mut CommandContext) -> Result<(), RuntimeError> {
        Err(RuntimeError::Command(
            "plugin must run on the async executor".into(),
        ))
    }

    async fn execute_async(&self, ctx: &mut CommandContext) -> Result<(), RuntimeError> {
        let manager = self
            .plugins
            .upgrade()
            .ok_or_else(|| RuntimeError::Command("plugin manager is no longer available".into()))?;
        let output = self.run(&manager, ctx).await?;
        ctx.set_result(output);
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
