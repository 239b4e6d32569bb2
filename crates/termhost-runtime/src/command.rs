//! Command trait and per-invocation context.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RuntimeError;

/// Category tag that routes a command to the system stage.
pub const SYSTEM_CATEGORY: &str = "system";

/// How a command is dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Runs synchronously on the dispatch thread.
    #[default]
    Plain,
    /// Handed to a background task; completion is reported on the event bus.
    Async,
    /// Privileged; claimed by the system stage ahead of everything else.
    System,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Plain => "plain",
            Capability::Async => "async",
            Capability::System => "system",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" => Ok(Capability::Plain),
            "async" => Ok(Capability::Async),
            "system" => Ok(Capability::System),
            other => Err(RuntimeError::InvalidManifest(format!(
                "unknown command capability '{other}'; expected plain, async or system"
            ))),
        }
    }
}

/// A single executable command.
///
/// Implementations write their output into the context with
/// [`CommandContext::set_result`] and report faults by returning an error.
/// The handler stage that runs the command owns the `handled` flag.
#[async_trait]
pub trait Command: Send + Sync {
    /// The command name (what the user types).
    fn name(&self) -> &str;

    /// One-line description for `help`.
    fn description(&self) -> &str {
        ""
    }

    /// Usage string (e.g. "forecast <city>").
    fn usage(&self) -> &str {
        self.name()
    }

    /// Category for grouping in `help` output.
    fn category(&self) -> &str {
        "general"
    }

    fn capability(&self) -> Capability {
        Capability::Plain
    }

    /// Whether the system stage claims this command.
    fn is_system(&self) -> bool {
        self.capability() == Capability::System
            || self.category().eq_ignore_ascii_case(SYSTEM_CATEGORY)
    }

    /// Run the command synchronously.
    fn execute(&self, ctx: &mut CommandContext) -> Result<(), RuntimeError>;

    /// Run the command on a background task. Defaults to [`Command::execute`].
    async fn execute_async(&self, ctx: &mut CommandContext) -> Result<(), RuntimeError> {
        self.execute(ctx)
    }
}

// ─── Extensions ─────────────────────────────────────────────────────────

/// Type-keyed storage for handler-specific data attached to a context.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    /// Insert a value, returning the previous value of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok().map(|b| *b))
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|b| b.downcast_ref::<T>())
    }

    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|b| b.downcast_mut::<T>())
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|b| b.downcast::<T>().ok().map(|b| *b))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.map.len())
            .finish()
    }
}

// ─── Context ────────────────────────────────────────────────────────────

/// Mutable state of one command invocation.
///
/// Once the context is marked handled its result is frozen: later writes
/// are refused, and the handler chain stops advancing.
pub struct CommandContext {
    id: Uuid,
    command: Option<Arc<dyn Command>>,
    name: String,
    args: Vec<String>,
    result: String,
    handled: bool,
    handled_by: Option<&'static str>,
    extensions: Extensions,
}

impl CommandContext {
    /// Create a context for a command that has not been resolved.
    pub fn new(name: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            command: None,
            name: name.into(),
            args,
            result: String::new(),
            handled: false,
            handled_by: None,
            extensions: Extensions::default(),
        }
    }

    /// Create a context for a resolved command.
    pub fn for_command(command: Arc<dyn Command>, args: Vec<String>) -> Self {
        let name = command.name().to_string();
        Self::new(name, args).with_command(Some(command))
    }

    /// Attach (or clear) the resolved command.
    pub fn with_command(mut self, command: Option<Arc<dyn Command>>) -> Self {
        self.command = command;
        self
    }

    /// Reuse the id of an earlier invocation.
    pub(crate) fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Unique id of this invocation, carried by completion events.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn command(&self) -> Option<&Arc<dyn Command>> {
        self.command.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Positional argument `index`, if present.
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    pub fn result(&self) -> &str {
        &self.result
    }

    pub fn is_handled(&self) -> bool {
        self.handled
    }

    /// Name of the stage that claimed the context.
    pub fn handled_by(&self) -> Option<&'static str> {
        self.handled_by
    }

    /// Replace the result. Refused (returns `false`) once handled.
    pub fn set_result(&mut self, result: impl Into<String>) -> bool {
        if self.handled {
            tracing::warn!(
                command = %self.name,
                stage = ?self.handled_by,
                "refusing to overwrite the result of a handled context"
            );
            return false;
        }
        self.result = result.into();
        true
    }

    /// Append a line to the result. Refused (returns `false`) once handled.
    pub fn push_line(&mut self, line: impl AsRef<str>) -> bool {
        if self.handled {
            return false;
        }
        if !self.result.is_empty() {
            self.result.push('\n');
        }
        self.result.push_str(line.as_ref());
        true
    }

    /// Mark the context handled by `stage`. The first claim wins.
    pub fn mark_handled(&mut self, stage: &'static str) -> bool {
        if self.handled {
            return false;
        }
        self.handled = true;
        self.handled_by = Some(stage);
        true
    }

    /// Set the result and mark the context handled in one step.
    pub fn complete(&mut self, stage: &'static str, result: impl Into<String>) -> bool {
        self.set_result(result) && self.mark_handled(stage)
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Move the invocation into a fresh context owned by a background task.
    ///
    /// The new context keeps the id, command, name, arguments and
    /// extensions; this context keeps the id and name only.
    pub(crate) fn detach(&mut self) -> CommandContext {
        CommandContext {
            id: self.id,
            command: self.command.clone(),
            name: self.name.clone(),
            args: std::mem::take(&mut self.args),
            result: String::new(),
            handled: false,
            handled_by: None,
            extensions: std::mem::take(&mut self.extensions),
        }
    }
}

impl fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("resolved", &self.command.is_some())
            .field("args", &self.args)
            .field("result", &self.result)
            .field("handled", &self.handled)
            .field("handled_by", &self.handled_by)
            .field("extensions", &self.extensions)
            .finish()
    }
}
