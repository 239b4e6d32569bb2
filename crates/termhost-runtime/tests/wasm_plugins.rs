//! WASM plugins loaded from a plugin directory and run in the Extism sandbox.

use std::path::Path;

use termhost_runtime::{
    DirectoryLoader, PendingCommand, PluginLoader, PluginSource, Runtime, RuntimeConfig,
    RuntimeError, SandboxConfig,
};

/// Echoes its input for `forecast`, fails for `broken`, rejects
/// configurations over 64 bytes and refuses to be disabled.
const WEATHER_WAT: &str = r#"
(module
  (import "extism:host/env" "input_length" (func $input_length (result i64)))
  (import "extism:host/env" "input_load_u8" (func $input_load_u8 (param i64) (result i32)))
  (import "extism:host/env" "alloc" (func $alloc (param i64) (result i64)))
  (import "extism:host/env" "store_u8" (func $store_u8 (param i64 i32)))
  (import "extism:host/env" "output_set" (func $output_set (param i64 i64)))

  (func $echo (result i32)
    (local $len i64) (local $off i64) (local $i i64)
    (local.set $len (call $input_length))
    (local.set $off (call $alloc (local.get $len)))
    (block $done
      (loop $copy
        (br_if $done (i64.ge_u (local.get $i) (local.get $len)))
        (call $store_u8
          (i64.add (local.get $off) (local.get $i))
          (call $input_load_u8 (local.get $i)))
        (local.set $i (i64.add (local.get $i) (i64.const 1)))
        (br $copy)))
    (call $output_set (local.get $off) (local.get $len))
    (i32.const 0))

  (func $on_configure (result i32)
    (if (result i32) (i64.gt_u (call $input_length) (i64.const 64))
      (then (i32.const 1))
      (else (i32.const 0))))

  (func $fail (result i32)
    (i32.const 1))

  (export "forecast" (func $echo))
  (export "broken" (func $fail))
  (export "on_configure" (func $on_configure))
  (export "on_disable" (func $fail)))
"#;

const WEATHER_MANIFEST: &str = r#"
[plugin]
name = "weather"
version = "1.0.0"
description = "Echoes what the host sends it"

[build]
wasm = "weather.wasm"

[[commands]]
name = "forecast"
description = "Show the forecast"
usage = "forecast <city>"
category = "weather"

[[commands]]
name = "radar"
capability = "async"
function = "forecast"

[[commands]]
name = "broken"

[theme]
file = "theme.toml"

[config]
units = "metric"
"#;

const THEME: &str = "background = \"#101010\"\n";

async fn write_weather(root: &Path) -> std::path::PathBuf {
    let dir = root.join("weather");
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(dir.join("plugin.toml"), WEATHER_MANIFEST).await.unwrap();
    tokio::fs::write(dir.join("weather.wasm"), wat::parse_str(WEATHER_WAT).unwrap())
        .await
        .unwrap();
    tokio::fs::write(dir.join("theme.toml"), THEME).await.unwrap();
    dir
}

async fn runtime(root: &Path) -> Runtime {
    write_weather(root).await;
    let config = RuntimeConfig {
        plugin_dir: root.to_path_buf(),
        ..RuntimeConfig::default()
    };
    let runtime = Runtime::builder().config(config).build().unwrap();
    let report = runtime.load_plugins().await;
    assert!(report.is_clean(), "{:?}", report.failed);
    assert_eq!(report.loaded, vec!["weather"]);
    runtime
}

fn echoed(result: &str) -> serde_json::Value {
    serde_json::from_str(result).unwrap_or_else(|e| panic!("not JSON ({e}): {result}"))
}

// ── Loading ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_directory_loader_instantiates_plugin() {
    let root = tempfile::tempdir().unwrap();
    let dir = write_weather(root.path()).await;
    let loader = DirectoryLoader::new(root.path(), SandboxConfig::default());

    let sources = loader.discover().await.unwrap();
    assert_eq!(sources, vec![PluginSource::Directory(dir)]);

    let plugin = loader.load(&sources[0]).await.unwrap();
    assert_eq!(plugin.name(), "weather");
    assert_eq!(plugin.version(), "1.0.0");
    assert_eq!(plugin.theme().as_deref(), Some(THEME));
    assert_eq!(plugin.initial_config()["units"], "metric");
    let names: Vec<String> = plugin.commands().iter().map(|c| c.name().to_string()).collect();
    assert_eq!(names, vec!["forecast", "radar", "broken"]);
}

#[tokio::test]
async fn test_loaded_plugin_registers_commands_and_theme() {
    let root = tempfile::tempdir().unwrap();
    let runtime = runtime(root.path()).await;

    assert_eq!(runtime.plugins().theme("weather").await.as_deref(), Some(THEME));
    let forecast = runtime.commands().resolve("forecast").unwrap();
    assert_eq!(forecast.category(), "weather");
    assert_eq!(forecast.usage(), "forecast <city>");
}

// ── Dispatch ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_wasm_command_sees_args_and_config() {
    let root = tempfile::tempdir().unwrap();
    let runtime = runtime(root.path()).await;

    let ctx = runtime.invoke("forecast", vec!["Oslo".into()]);
    assert_eq!(ctx.handled_by(), Some("default"));
    let input = echoed(ctx.result());
    assert_eq!(input["args"], serde_json::json!(["Oslo"]));
    assert_eq!(input["config"]["units"], "metric");
}

#[tokio::test]
async fn test_config_update_reaches_next_call_without_reload() {
    let root = tempfile::tempdir().unwrap();
    let runtime = runtime(root.path()).await;

    runtime
        .plugins()
        .set_plugin_config_value("weather", "units", serde_json::json!("imperial"))
        .await
        .unwrap();
    let input = echoed(runtime.invoke("forecast", vec!["Boston".into()]).result());
    assert_eq!(input["config"]["units"], "imperial");
}

#[tokio::test]
async fn test_configure_export_can_reject_mapping() {
    let root = tempfile::tempdir().unwrap();
    let runtime = runtime(root.path()).await;

    let err = runtime
        .plugins()
        .set_plugin_config_value("weather", "note", serde_json::json!("x".repeat(80)))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Hook(_)));

    let input = echoed(runtime.invoke("forecast", vec![]).result());
    assert!(input["config"].get("note").is_none());
}

#[tokio::test]
async fn test_async_wasm_command_completes_in_background() {
    let root = tempfile::tempdir().unwrap();
    let runtime = runtime(root.path()).await;

    let mut ctx = runtime.invoke("radar", vec!["north".into()]);
    assert_eq!(ctx.handled_by(), Some("async"));
    let done = ctx
        .extensions_mut()
        .remove::<PendingCommand>()
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(echoed(done.result())["args"], serde_json::json!(["north"]));
}

#[tokio::test]
async fn test_failing_export_becomes_error_result() {
    let root = tempfile::tempdir().unwrap();
    let runtime = runtime(root.path()).await;

    let ctx = runtime.invoke("broken", vec![]);
    assert!(ctx.is_handled());
    assert!(ctx.result().starts_with("error:"), "{}", ctx.result());
}

// ── Disable ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_disable_calls_export_and_removes_commands() {
    let root = tempfile::tempdir().unwrap();
    let dir = write_weather(root.path()).await;
    let loader = DirectoryLoader::new(root.path(), SandboxConfig::default());
    let mut plugin = loader.load(&PluginSource::Directory(dir)).await.unwrap();
    // The fixture's on_disable export always fails, so an error proves it ran.
    assert!(plugin.on_disable().is_err());

    let runtime = runtime(root.path()).await;
    assert!(runtime.plugins().disable_plugin("weather").await);
    assert_eq!(
        runtime.invoke("forecast", vec![]).result(),
        "unknown command: forecast"
    );
}
