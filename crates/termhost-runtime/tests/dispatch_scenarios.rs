//! End-to-end dispatch scenarios through the assembled runtime.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use termhost_runtime::{
    Capability, Command, CommandCompletedPayload, CommandContext, CommandFailedPayload, Event,
    EventKind, PendingCommand, Plugin, PluginConfig, Runtime, RuntimeConfig, RuntimeError,
    StaticLoader,
};

// ─── Fixtures ───────────────────────────────────────────────────────────

struct Forecast {
    config: Arc<Mutex<PluginConfig>>,
}

impl Command for Forecast {
    fn name(&self) -> &str {
        "forecast"
    }

    fn category(&self) -> &str {
        "weather"
    }

    fn execute(&self, ctx: &mut CommandContext) -> Result<(), RuntimeError> {
        let city = ctx
            .arg(0)
            .ok_or_else(|| RuntimeError::InvalidArguments("missing city".into()))?
            .to_string();
        let units = self
            .config
            .lock()
            .unwrap()
            .get("units")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "metric".to_string());
        ctx.set_result(format!("{city}: sunny ({units})"));
        Ok(())
    }
}

struct Radar;

#[async_trait]
impl Command for Radar {
    fn name(&self) -> &str {
        "radar"
    }

    fn capability(&self) -> Capability {
        Capability::Async
    }

    fn execute(&self, _ctx: &mut CommandContext) -> Result<(), RuntimeError> {
        Err(RuntimeError::Command("radar only runs in the background".into()))
    }

    async fn execute_async(&self, ctx: &mut CommandContext) -> Result<(), RuntimeError> {
        tokio::task::yield_now().await;
        ctx.set_result("no rain");
        Ok(())
    }
}

struct WeatherPlugin {
    config: Arc<Mutex<PluginConfig>>,
}

impl Plugin for WeatherPlugin {
    fn name(&self) -> &str {
        "weather"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn commands(&self) -> Vec<Arc<dyn Command>> {
        vec![
            Arc::new(Forecast {
                config: Arc::clone(&self.config),
            }),
            Arc::new(Radar),
        ]
    }

    fn configure(&mut self, config: &PluginConfig) -> Result<(), RuntimeError> {
        *self.config.lock().unwrap() = config.clone();
        Ok(())
    }
}

struct Boom;

impl Command for Boom {
    fn name(&self) -> &str {
        "boom"
    }

    fn execute(&self, _ctx: &mut CommandContext) -> Result<(), RuntimeError> {
        panic!("boom went the command")
    }
}

/// Declares both a system category and the async capability.
struct Reindex;

impl Command for Reindex {
    fn name(&self) -> &str {
        "reindex"
    }

    fn category(&self) -> &str {
        "system"
    }

    fn capability(&self) -> Capability {
        Capability::Async
    }

    fn execute(&self, ctx: &mut CommandContext) -> Result<(), RuntimeError> {
        ctx.set_result("reindexed");
        Ok(())
    }
}

struct ToolsPlugin;

impl Plugin for ToolsPlugin {
    fn name(&self) -> &str {
        "tools"
    }

    fn commands(&self) -> Vec<Arc<dyn Command>> {
        vec![Arc::new(Boom), Arc::new(Reindex)]
    }
}

fn runtime() -> Runtime {
    let loader = StaticLoader::new()
        .with_plugin("weather", || {
            Ok(Box::new(WeatherPlugin {
                config: Arc::new(Mutex::new(PluginConfig::new())),
            }))
        })
        .with_plugin("tools", || Ok(Box::new(ToolsPlugin)));
    Runtime::builder()
        .config(RuntimeConfig::default())
        .loader(loader)
        .build()
        .expect("runtime builds")
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn record(runtime: &Runtime, kind: EventKind) -> Arc<Mutex<Vec<Event>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    runtime
        .events()
        .subscribe(kind, move |e| sink.lock().unwrap().push(e.clone()));
    seen
}

// ─── Scenarios ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_weather_load_dispatch_disable() {
    let runtime = runtime();
    let report = runtime.load_plugins().await;
    assert_eq!(report.loaded, vec!["weather", "tools"]);

    let ctx = runtime.invoke("forecast", args(&["Oslo"]));
    assert!(ctx.is_handled());
    assert_eq!(ctx.result(), "Oslo: sunny (metric)");
    assert_eq!(ctx.handled_by(), Some("default"));

    assert!(runtime.plugins().disable_plugin("weather").await);
    let ctx = runtime.invoke("forecast", args(&["Oslo"]));
    assert!(ctx.is_handled());
    assert_eq!(ctx.result(), "unknown command: forecast");
    assert_eq!(ctx.handled_by(), Some("sentinel"));

    // Other plugins are untouched.
    assert!(runtime.commands().resolve("boom").is_some());
}

#[tokio::test]
async fn test_config_update_is_live() {
    let runtime = runtime();
    runtime.load_plugins().await;

    runtime
        .plugins()
        .set_plugin_config_value("weather", "units", serde_json::json!("imperial"))
        .await
        .unwrap();
    let ctx = runtime.invoke("forecast", args(&["Boston"]));
    assert_eq!(ctx.result(), "Boston: sunny (imperial)");
}

#[tokio::test]
async fn test_faulting_command_is_contained() {
    let runtime = runtime();
    runtime.load_plugins().await;
    let failed = record(&runtime, EventKind::CommandFailed);

    let ctx = runtime.invoke("boom", vec![]);
    assert!(ctx.is_handled());
    assert!(ctx.result().starts_with("error:"));
    assert!(ctx.result().contains("boom went the command"));

    let failed = failed.lock().unwrap();
    let payload: CommandFailedPayload = failed[0].decode().unwrap();
    assert_eq!(payload.command, "boom");

    // The runtime keeps dispatching.
    assert_eq!(runtime.invoke("echo", args(&["still", "here"])).result(), "still here");
}

#[tokio::test]
async fn test_missing_argument_is_error_result() {
    let runtime = runtime();
    runtime.load_plugins().await;
    let ctx = runtime.invoke("forecast", vec![]);
    assert!(ctx.is_handled());
    assert_eq!(ctx.result(), "error: invalid arguments: missing city");
}

#[tokio::test]
async fn test_system_category_beats_async_capability() {
    let runtime = runtime();
    runtime.load_plugins().await;
    let ctx = runtime.invoke("reindex", vec![]);
    assert_eq!(ctx.handled_by(), Some("system"));
    assert_eq!(ctx.result(), "reindexed");
}

#[tokio::test]
async fn test_async_plugin_command_reports_completion() {
    let runtime = runtime();
    runtime.load_plugins().await;
    let completed = record(&runtime, EventKind::CommandCompleted);

    let mut ctx = runtime.invoke("radar", vec![]);
    assert!(ctx.is_handled());
    assert_eq!(ctx.handled_by(), Some("async"));

    let pending = ctx.extensions_mut().remove::<PendingCommand>().unwrap();
    let done = pending.wait().await.unwrap();
    assert_eq!(done.result(), "no rain");

    let completed = completed.lock().unwrap();
    let payload: CommandCompletedPayload = completed
        .iter()
        .filter_map(|e| e.decode::<CommandCompletedPayload>())
        .find(|p| p.invocation_id == ctx.id())
        .unwrap();
    assert_eq!(payload.result, "no rain");
}

#[tokio::test]
async fn test_every_context_ends_handled() {
    let runtime = runtime();
    runtime.load_plugins().await;
    for name in ["forecast", "radar", "boom", "reindex", "help", "stats", "nosuch", ""] {
        let ctx = runtime.invoke(name, args(&["x"]));
        assert!(ctx.is_handled(), "{name:?} was left unhandled");
    }
}

#[tokio::test]
async fn test_plugin_command_through_chain() {
    let runtime = runtime();
    runtime.load_plugins().await;

    let mut ctx = runtime.invoke("plugin", args(&["disable", "weather"]));
    let done = ctx
        .extensions_mut()
        .remove::<PendingCommand>()
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(done.result(), "disabled weather");
    assert_eq!(runtime.invoke("forecast", args(&["Oslo"])).result(), "unknown command: forecast");

    let stats = runtime.invoke("stats", vec![]);
    assert_eq!(stats.handled_by(), Some("system"));
    assert!(stats.result().contains("unknown: 1"));
}

#[tokio::test]
async fn test_shutdown_unloads_plugins() {
    let runtime = runtime();
    runtime.load_plugins().await;
    let unloaded = record(&runtime, EventKind::PluginUnloaded);

    runtime.shutdown().await;
    assert_eq!(unloaded.lock().unwrap().len(), 2);
    assert!(runtime.plugins().loaded_plugins().await.is_empty());
    assert!(runtime.commands().resolve("forecast").is_none());
}
