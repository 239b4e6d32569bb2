//! WASM-backed plugins: binary validation and the command adapter.
//!
//! A WASM plugin is described by a [`PluginManifest`]. Every declared
//! command calls one export of the module with a JSON input
//! `{"args": [...], "config": {...}}` and uses the UTF-8 output as its
//! result. All commands of a plugin share one sandbox.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use serde::Serialize;

use crate::command::{Capability, Command, CommandContext};
use crate::error::RuntimeError;
use crate::manifest::{CommandSpec, PluginManifest};
use crate::plugins::{Plugin, PluginConfig};
use crate::sandbox::PluginSandbox;

/// WASM magic bytes: `\0asm`
const WASM_MAGIC: &[u8; 4] = b"\0asm";

/// Allowed WASM import namespaces. Imports outside these are rejected.
const ALLOWED_IMPORT_NAMESPACES: &[&str] = &[
    "env",                    // Extism host functions
    "extism:host/env",        // Extism host functions (component model)
    "wasi_snapshot_preview1", // WASI preview 1
    "wasi_unstable",          // Legacy WASI
];

/// Optional export called with the new configuration before it is applied.
const CONFIGURE_EXPORT: &str = "on_configure";

/// Optional export called when the plugin is disabled.
const DISABLE_EXPORT: &str = "on_disable";

// ─── Validation ─────────────────────────────────────────────────────────

/// Validate a WASM binary.
///
/// Checks:
/// 1. Size within `max_size`
/// 2. Magic bytes (0x00 0x61 0x73 0x6D = "\0asm")
/// 3. Import analysis: only allowed namespaces
pub fn validate_wasm(wasm_bytes: &[u8], max_size: u64) -> Result<(), RuntimeError> {
    let size = wasm_bytes.len() as u64;
    if size > max_size {
        return Err(RuntimeError::WasmValidation(format!(
            "WASM binary too large: {size} bytes (max: {max_size} bytes)"
        )));
    }

    if wasm_bytes.len() < 4 || &wasm_bytes[..4] != WASM_MAGIC {
        return Err(RuntimeError::WasmValidation(
            "invalid WASM binary: magic bytes mismatch".into(),
        ));
    }

    validate_wasm_imports(wasm_bytes)
}

/// Validate WASM imports against the allowed namespace list.
fn validate_wasm_imports(wasm_bytes: &[u8]) -> Result<(), RuntimeError> {
    use wasmparser::{Parser, Payload};

    for payload in Parser::new(0).parse_all(wasm_bytes) {
        let payload = payload
            .map_err(|e| RuntimeError::WasmValidation(format!("failed to parse WASM: {e}")))?;

        if let Payload::ImportSection(reader) = payload {
            for import in reader {
                let import = import.map_err(|e| {
                    RuntimeError::WasmValidation(format!("failed to read import: {e}"))
                })?;

                if !ALLOWED_IMPORT_NAMESPACES.contains(&import.module) {
                    return Err(RuntimeError::WasmValidation(format!(
                        "unauthorized import namespace: '{}' (function: '{}'); \
                         allowed namespaces: {:?}",
                        import.module, import.name, ALLOWED_IMPORT_NAMESPACES
                    )));
                }
            }
        }
    }

    Ok(())
}

// ─── Plugin ─────────────────────────────────────────────────────────────

type SharedSandbox = Arc<Mutex<PluginSandbox>>;
type SharedConfig = Arc<RwLock<PluginConfig>>;

#[derive(Serialize)]
struct CommandInput<'a> {
    args: &'a [String],
    config: &'a PluginConfig,
}

fn call_export(sandbox: &SharedSandbox, function: &str, input: &[u8]) -> Result<Vec<u8>, RuntimeError> {
    sandbox
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .call(function, input)
}

/// A plugin whose commands run inside a WASM sandbox.
pub struct WasmPlugin {
    manifest: PluginManifest,
    sandbox: SharedSandbox,
    config: SharedConfig,
    theme: Option<String>,
}

impl WasmPlugin {
    pub fn new(manifest: PluginManifest, sandbox: PluginSandbox, theme: Option<String>) -> Self {
        Self {
            manifest,
            sandbox: Arc::new(Mutex::new(sandbox)),
            config: Arc::new(RwLock::new(PluginConfig::new())),
            theme,
        }
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    fn has_export(&self, name: &str) -> bool {
        self.sandbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .has_function(name)
    }
}

impl Plugin for WasmPlugin {
    fn name(&self) -> &str {
        &self.manifest.plugin.name
    }

    fn version(&self) -> &str {
        &self.manifest.plugin.version
    }

    fn commands(&self) -> Vec<Arc<dyn Command>> {
        self.manifest
            .commands
            .iter()
            .map(|spec| {
                Arc::new(WasmCommand {
                    spec: spec.clone(),
                    plugin: self.manifest.plugin.name.clone(),
                    sandbox: Arc::clone(&self.sandbox),
                    config: Arc::clone(&self.config),
                }) as Arc<dyn Command>
            })
            .collect()
    }

    fn theme(&self) -> Option<String> {
        self.theme.clone()
    }

    fn initial_config(&self) -> PluginConfig {
        self.manifest.initial_config().unwrap_or_else(|e| {
            tracing::warn!(plugin = %self.name(), "ignoring unreadable [config] table: {e}");
            PluginConfig::new()
        })
    }

    fn configure(&mut self, config: &PluginConfig) -> Result<(), RuntimeError> {
        if self.has_export(CONFIGURE_EXPORT) {
            let input = serde_json::to_vec(config)?;
            call_export(&self.sandbox, CONFIGURE_EXPORT, &input)?;
        }
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config.clone();
        Ok(())
    }

    fn on_disable(&mut self) -> Result<(), RuntimeError> {
        if self.has_export(DISABLE_EXPORT) {
            call_export(&self.sandbox, DISABLE_EXPORT, b"{}")?;
        }
        Ok(())
    }
}

// ─── Command ────────────────────────────────────────────────────────────

/// One manifest command bound to its plugin's sandbox.
pub struct WasmCommand {
    spec: CommandSpec,
    plugin: String,
    sandbox: SharedSandbox,
    config: SharedConfig,
}

impl WasmCommand {
    fn input(&self, ctx: &CommandContext) -> Result<Vec<u8>, RuntimeError> {
        let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
        Ok(serde_json::to_vec(&CommandInput {
            args: ctx.args(),
            config: &*config,
        })?)
    }

    fn finish(&self, ctx: &mut CommandContext, output: Vec<u8>) {
        tracing::debug!(
            plugin = %self.plugin,
            command = %self.spec.name,
            bytes = output.len(),
            "wasm command returned"
        );
        ctx.set_result(String::from_utf8_lossy(&output).into_owned());
    }
}

#[async_trait]
impl Command for WasmCommand {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn description(&self) -> &str {
        &self.spec.description
    }

    fn usage(&self) -> &str {
        self.spec.usage()
    }

    fn category(&self) -> &str {
        &self.spec.category
    }

    fn capability(&self) -> Capability {
        self.spec.capability
    }

    fn execute(&self, ctx: &mut CommandContext) -> Result<(), RuntimeError> {
        let input = self.input(ctx)?;
        let output = call_export(&self.sandbox, self.spec.function(), &input)?;
        self.finish(ctx, output);
        Ok(())
    }

    /// Runs the sandbox call on the blocking pool.
    async fn execute_async(&self, ctx: &mut CommandContext) -> Result<(), RuntimeError> {
        let input = self.input(ctx)?;
        let sandbox = Arc::clone(&self.sandbox);
        let function = self.spec.function().to_string();
        let output = tokio::task::spawn_blocking(move || call_export(&sandbox, &function, &input))
            .await
            .map_err(|e| RuntimeError::Executor(e.to_string()))??;
        self.finish(ctx, output);
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u64 = 50 * 1024 * 1024;

    #[test]
    fn test_wasm_magic_bytes() {
        assert_eq!(WASM_MAGIC, &[0x00, 0x61, 0x73, 0x6D]);
    }

    #[test]
    fn test_allowed_import_namespaces() {
        assert!(ALLOWED_IMPORT_NAMESPACES.contains(&"env"));
        assert!(ALLOWED_IMPORT_NAMESPACES.contains(&"extism:host/env"));
        assert!(!ALLOWED_IMPORT_NAMESPACES.contains(&"evil"));
    }

    // ── Size and magic ────────────────────────────────────────────────

    #[test]
    fn test_validate_wasm_too_large() {
        let mut data = vec![0x00u8, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00];
        data.extend(vec![0u8; 100]);
        let err = validate_wasm(&data, 50).unwrap_err();
        assert!(matches!(err, RuntimeError::WasmValidation(_)));
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_validate_wasm_invalid_magic() {
        // ELF magic bytes
        let data = [0x7Fu8, 0x45, 0x4C, 0x46, 0x01, 0x00, 0x00, 0x00];
        let err = validate_wasm(&data, MAX).unwrap_err();
        assert!(err.to_string().contains("magic bytes"));
    }

    #[test]
    fn test_validate_wasm_too_short() {
        let err = validate_wasm(&[0x00u8, 0x61], MAX).unwrap_err();
        assert!(err.to_string().contains("magic bytes"));
    }

    // ── Imports ───────────────────────────────────────────────────────

    #[test]
    fn test_validate_wasm_imports_valid_env() {
        // (module (import "env" "memory" (memory 1)))
        let wasm = [
            0x00, 0x61, 0x73, 0x6D, // magic
            0x01, 0x00, 0x00, 0x00, // version
            0x02, 0x0F, // import section, 15 bytes
            0x01, // 1 import
            0x03, b'e', b'n', b'v', // module: "env"
            0x06, b'm', b'e', b'm', b'o', b'r', b'y', // name: "memory"
            0x02, 0x00, 0x01, // memory, limits: min=1
        ];
        assert!(validate_wasm(&wasm, MAX).is_ok());
    }

    #[test]
    fn test_validate_wasm_imports_forbidden_namespace() {
        let wasm = [
            0x00, 0x61, 0x73, 0x6D, // magic
            0x01, 0x00, 0x00, 0x00, // version
            0x02, 0x0D, // import section, 13 bytes
            0x01, // 1 import
            0x04, b'e', b'v', b'i', b'l', // module: "evil"
            0x04, b'f', b'u', b'n', b'c', // name: "func"
            0x00, 0x00, // function, type index 0
        ];
        let err = validate_wasm(&wasm, MAX).unwrap_err();
        assert!(err.to_string().contains("unauthorized import namespace"));
        assert!(err.to_string().contains("evil"));
    }

    #[test]
    fn test_validate_wasm_no_imports() {
        let wasm = [0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00];
        assert!(validate_wasm(&wasm, MAX).is_ok());
    }

    // ── Command input ─────────────────────────────────────────────────

    #[test]
    fn test_command_input_shape() {
        let args = vec!["Oslo".to_string()];
        let config = PluginConfig::from([("units".to_string(), serde_json::json!("metric"))]);
        let value = serde_json::to_value(CommandInput {
            args: &args,
            config: &config,
        })
        .unwrap();
        assert_eq!(
            value,
            serde_json::json!({"args": ["Oslo"], "config": {"units": "metric"}})
        );
    }
}
