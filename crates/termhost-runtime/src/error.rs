//! Runtime error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("plugin already exists: {0}")]
    AlreadyExists(String),

    #[error("plugin load error: {0}")]
    Load(String),

    #[error("plugin hook failed: {0}")]
    Hook(String),

    #[error("command '{command}' is already registered by {owner}")]
    CommandConflict { command: String, owner: String },

    #[error("command failed: {0}")]
    Command(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("service not registered: {0}")]
    ServiceNotRegistered(&'static str),

    #[error("no async executor available: {0}")]
    Executor(String),

    #[error("WASM validation error: {0}")]
    WasmValidation(String),

    #[error("execution timeout: plugin {0} exceeded fuel limit")]
    FuelExhausted(String),

    #[error("memory limit exceeded: plugin {0}")]
    MemoryExceeded(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("semver error: {0}")]
    Semver(#[from] semver::Error),
}

/// Render a caught panic payload as a message.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
