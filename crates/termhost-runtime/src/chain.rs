//! Handler chain: ordered dispatch stages for command contexts.
//!
//! A chain is a fixed list of [`CommandHandler`] stages followed by a
//! sentinel. [`HandlerChain::dispatch`] offers the context to each stage in
//! turn and stops at the first one that claims it; the sentinel claims
//! whatever is left, so every dispatched context ends up handled.
//!
//! The standard order is observer → system → async → default → sentinel.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::command::{Capability, Command, CommandContext};
use crate::error::{panic_message, RuntimeError};
use crate::events::{CommandCompletedPayload, CommandFailedPayload, Event, EventBus, EventKind};
use crate::services::ServiceRegistry;

/// What a stage did with a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage resolved the context; the chain stops.
    Handled,
    /// The context is passed unchanged to the next stage.
    Delegate,
}

/// One stage of the handler chain.
///
/// A stage either resolves the context (sets the result, marks it handled
/// and returns [`StageOutcome::Handled`]) or returns
/// [`StageOutcome::Delegate`] without touching it. Stages must not keep a
/// reference to the context past their own call.
pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn handle(&self, ctx: &mut CommandContext) -> StageOutcome;
}

// ─── Telemetry ──────────────────────────────────────────────────────────

/// Dispatch counters shared by the stages of a chain.
#[derive(Debug, Default)]
pub struct DispatchStats {
    observed: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    unknown: AtomicU64,
    async_dispatched: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub observed: u64,
    pub completed: u64,
    pub failed: u64,
    pub unknown: u64,
    pub async_dispatched: u64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            observed: self.observed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
            async_dispatched: self.async_dispatched.load(Ordering::Relaxed),
        }
    }
}

/// Event bus and counters used by the executing stages.
#[derive(Clone)]
pub struct Telemetry {
    events: Arc<EventBus>,
    stats: Arc<DispatchStats>,
}

impl Telemetry {
    pub fn new(events: Arc<EventBus>, stats: Arc<DispatchStats>) -> Self {
        Self { events, stats }
    }

    fn completed(&self, ctx: &CommandContext, stage: &str) {
        self.stats.completed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(command = %ctx.name(), stage, "command completed");
        self.events.emit(&Event::with_payload(
            EventKind::CommandCompleted,
            &CommandCompletedPayload {
                invocation_id: ctx.id(),
                command: ctx.name().to_string(),
                stage: stage.to_string(),
                result: ctx.result().to_string(),
            },
        ));
    }

    fn failed(&self, invocation_id: Uuid, command: &str, stage: &str, error: &str) {
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(command = %command, stage, "command failed: {error}");
        self.events.emit(&Event::with_payload(
            EventKind::CommandFailed,
            &CommandFailedPayload {
                invocation_id,
                command: command.to_string(),
                stage: stage.to_string(),
                error: error.to_string(),
            },
        ));
    }
}

/// Run a command synchronously, converting errors and panics to a message.
fn run_guarded(command: &Arc<dyn Command>, ctx: &mut CommandContext) -> Result<(), String> {
    match catch_unwind(AssertUnwindSafe(|| command.execute(ctx))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => Err(format!("panicked: {}", panic_message(panic.as_ref()))),
    }
}

/// Shared body of the synchronous executing stages.
fn execute_sync(
    stage: &'static str,
    error_prefix: &str,
    telemetry: &Telemetry,
    command: Arc<dyn Command>,
    ctx: &mut CommandContext,
) -> StageOutcome {
    match run_guarded(&command, ctx) {
        Ok(()) => {
            ctx.mark_handled(stage);
            telemetry.completed(ctx, stage);
        }
        Err(msg) => {
            ctx.set_result(format!("{error_prefix}: {msg}"));
            ctx.mark_handled(stage);
            telemetry.failed(ctx.id(), ctx.name(), stage, &msg);
        }
    }
    StageOutcome::Handled
}

// ─── Stages ─────────────────────────────────────────────────────────────

/// Records every context and always delegates.
pub struct ObserverStage {
    stats: Arc<DispatchStats>,
}

impl ObserverStage {
    pub fn new(stats: Arc<DispatchStats>) -> Self {
        Self { stats }
    }
}

impl CommandHandler for ObserverStage {
    fn name(&self) -> &'static str {
        "observer"
    }

    fn handle(&self, ctx: &mut CommandContext) -> StageOutcome {
        self.stats.observed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            invocation = %ctx.id(),
            command = %ctx.name(),
            resolved = ctx.command().is_some(),
            capability = ?ctx.command().map(|c| c.capability()),
            args = ctx.args().len(),
            "dispatching command"
        );
        StageOutcome::Delegate
    }
}

/// Claims system commands and runs them synchronously.
pub struct SystemStage {
    telemetry: Telemetry,
}

impl SystemStage {
    pub fn new(telemetry: Telemetry) -> Self {
        Self { telemetry }
    }
}

impl CommandHandler for SystemStage {
    fn name(&self) -> &'static str {
        "system"
    }

    fn handle(&self, ctx: &mut CommandContext) -> StageOutcome {
        match ctx.command() {
            Some(command) if command.is_system() => {
                let command = Arc::clone(command);
                execute_sync(self.name(), "system error", &self.telemetry, command, ctx)
            }
            _ => StageOutcome::Delegate,
        }
    }
}

/// Handle to an async command running in the background.
///
/// Inserted into the caller's context extensions by the async stage.
#[derive(Debug)]
pub struct PendingCommand {
    invocation_id: Uuid,
    handle: JoinHandle<CommandContext>,
}

impl PendingCommand {
    pub fn invocation_id(&self) -> Uuid {
        self.invocation_id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the background work and return its final context.
    pub async fn wait(self) -> Result<CommandContext, RuntimeError> {
        self.handle
            .await
            .map_err(|e| RuntimeError::Executor(e.to_string()))
    }
}

/// Claims async commands and hands them to a tokio task.
pub struct AsyncStage {
    telemetry: Telemetry,
    runtime: Option<Handle>,
}

impl AsyncStage {
    /// Spawn on `runtime`, or on the runtime current at dispatch time when
    /// `None`.
    pub fn new(telemetry: Telemetry, runtime: Option<Handle>) -> Self {
        Self { telemetry, runtime }
    }

    fn spawn(
        &self,
        runtime: &Handle,
        command: Arc<dyn Command>,
        mut task_ctx: CommandContext,
    ) -> JoinHandle<CommandContext> {
        let stage = self.name();
        let telemetry = self.telemetry.clone();
        let invocation_id = task_ctx.id();
        let name = task_ctx.name().to_string();

        let work = runtime.spawn(async move {
            let outcome = command.execute_async(&mut task_ctx).await;
            (task_ctx, outcome)
        });

        runtime.spawn(async move {
            match work.await {
                Ok((mut ctx, Ok(()))) => {
                    ctx.mark_handled(stage);
                    telemetry.completed(&ctx, stage);
                    ctx
                }
                Ok((mut ctx, Err(e))) => {
                    let msg = e.to_string();
                    ctx.set_result(format!("error: {msg}"));
                    ctx.mark_handled(stage);
                    telemetry.failed(invocation_id, &name, stage, &msg);
                    ctx
                }
                Err(join_err) => {
                    let msg = if join_err.is_panic() {
                        format!("panicked: {}", panic_message(join_err.into_panic().as_ref()))
                    } else {
                        "background task was cancelled".to_string()
                    };
                    let mut ctx = CommandContext::new(name.clone(), Vec::new()).with_id(invocation_id);
                    ctx.complete(stage, format!("error: {msg}"));
                    telemetry.failed(invocation_id, &name, stage, &msg);
                    ctx
                }
            }
        })
    }
}

impl CommandHandler for AsyncStage {
    fn name(&self) -> &'static str {
        "async"
    }

    fn handle(&self, ctx: &mut CommandContext) -> StageOutcome {
        let command = match ctx.command() {
            Some(command) if command.capability() == Capability::Async => Arc::clone(command),
            _ => return StageOutcome::Delegate,
        };

        let runtime = match self.runtime.clone().or_else(|| Handle::try_current().ok()) {
            Some(runtime) => runtime,
            None => {
                let err = RuntimeError::Executor("no tokio runtime to run async commands".into());
                ctx.set_result(format!("error: {err}"));
                ctx.mark_handled(self.name());
                self.telemetry
                    .failed(ctx.id(), ctx.name(), self.name(), &err.to_string());
                return StageOutcome::Handled;
            }
        };

        let task_ctx = ctx.detach();
        match catch_unwind(AssertUnwindSafe(|| self.spawn(&runtime, command, task_ctx))) {
            Ok(handle) => {
                self.telemetry
                    .stats
                    .async_dispatched
                    .fetch_add(1, Ordering::Relaxed);
                let invocation_id = ctx.id();
                ctx.extensions_mut().insert(PendingCommand {
                    invocation_id,
                    handle,
                });
                let started = format!("{}: started in background", ctx.name());
                ctx.complete(self.name(), started);
                tracing::debug!(invocation = %ctx.id(), command = %ctx.name(), "async command dispatched");
            }
            Err(panic) => {
                let msg = format!("failed to spawn: {}", panic_message(panic.as_ref()));
                ctx.set_result(format!("error: {msg}"));
                ctx.mark_handled(self.name());
                self.telemetry.failed(ctx.id(), ctx.name(), self.name(), &msg);
            }
        }
        StageOutcome::Handled
    }
}

/// Claims any remaining resolved command and runs it synchronously.
pub struct DefaultStage {
    telemetry: Telemetry,
}

impl DefaultStage {
    pub fn new(telemetry: Telemetry) -> Self {
        Self { telemetry }
    }
}

impl CommandHandler for DefaultStage {
    fn name(&self) -> &'static str {
        "default"
    }

    fn handle(&self, ctx: &mut CommandContext) -> StageOutcome {
        match ctx.command() {
            Some(command) => {
                let command = Arc::clone(command);
                execute_sync(self.name(), "error", &self.telemetry, command, ctx)
            }
            None => StageOutcome::Delegate,
        }
    }
}

/// Terminal stage: claims whatever no other stage did.
struct SentinelStage {
    stats: Arc<DispatchStats>,
}

impl CommandHandler for SentinelStage {
    fn name(&self) -> &'static str {
        "sentinel"
    }

    fn handle(&self, ctx: &mut CommandContext) -> StageOutcome {
        let message = if ctx.command().is_none() {
            self.stats.unknown.fetch_add(1, Ordering::Relaxed);
            format!("unknown command: {}", ctx.name())
        } else {
            format!("unhandled command: {}", ctx.name())
        };
        tracing::debug!(command = %ctx.name(), "{message}");
        ctx.complete(self.name(), message);
        StageOutcome::Handled
    }
}

// ─── Chain ──────────────────────────────────────────────────────────────

/// Composes stages in order. The sentinel is appended by [`ChainBuilder::build`].
pub struct ChainBuilder {
    stats: Arc<DispatchStats>,
    stages: Vec<Box<dyn CommandHandler>>,
}

impl ChainBuilder {
    pub fn stage(mut self, stage: impl CommandHandler + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn build(self) -> HandlerChain {
        HandlerChain {
            stages: self.stages,
            sentinel: SentinelStage { stats: self.stats },
        }
    }
}

/// Immutable, ordered sequence of stages ending in a sentinel.
pub struct HandlerChain {
    stages: Vec<Box<dyn CommandHandler>>,
    sentinel: SentinelStage,
}

impl HandlerChain {
    pub fn builder(stats: Arc<DispatchStats>) -> ChainBuilder {
        ChainBuilder {
            stats,
            stages: Vec::new(),
        }
    }

    /// Build the standard chain from the services it depends on.
    ///
    /// Requires `Arc<EventBus>` and `Arc<DispatchStats>`; uses a registered
    /// tokio [`Handle`] for async commands when one is present.
    pub fn standard(services: &ServiceRegistry) -> Result<Self, RuntimeError> {
        let events = services.resolve::<EventBus>()?;
        let stats = services.resolve::<DispatchStats>()?;
        let runtime = if services.contains::<Handle>() {
            let handle: Arc<Handle> = services.resolve::<Handle>()?;
            Some(Handle::clone(&handle))
        } else {
            None
        };

        let telemetry = Telemetry::new(events, Arc::clone(&stats));
        Ok(Self::builder(Arc::clone(&stats))
            .stage(ObserverStage::new(stats))
            .stage(SystemStage::new(telemetry.clone()))
            .stage(AsyncStage::new(telemetry.clone(), runtime))
            .stage(DefaultStage::new(telemetry))
            .build())
    }

    /// Push a context through the stages until one claims it.
    ///
    /// Always returns `true`: the sentinel claims any context the other
    /// stages leave.
    pub fn dispatch(&self, ctx: &mut CommandContext) -> bool {
        if ctx.is_handled() {
            tracing::warn!(command = %ctx.name(), "context was already handled; not dispatching");
            return true;
        }

        for stage in &self.stages {
            match stage.handle(ctx) {
                StageOutcome::Handled => {
                    ctx.mark_handled(stage.name());
                    return true;
                }
                StageOutcome::Delegate if ctx.is_handled() => {
                    tracing::error!(
                        stage = stage.name(),
                        command = %ctx.name(),
                        "stage marked the context handled but delegated; stopping"
                    );
                    return true;
                }
                StageOutcome::Delegate => {}
            }
        }

        self.sentinel.handle(ctx);
        ctx.is_handled()
    }

    /// Stage names in dispatch order, sentinel last.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages
            .iter()
            .map(|stage| stage.name())
            .chain(std::iter::once(self.sentinel.name()))
            .collect()
    }
}
