//! Line-oriented shell over a [`Runtime`].

use std::io::Write;

use termhost_runtime::{
    CommandCompletedPayload, CommandFailedPayload, ConfigChangedPayload, Event, EventKind,
    PendingCommand, PluginLifecyclePayload, Runtime, SubscriptionId, ThemeRegisteredPayload,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

pub const PROMPT: &str = "termhost> ";

/// One parsed input line.
#[derive(Debug, PartialEq, Eq)]
pub enum Line {
    Empty,
    Exit,
    Command { name: String, args: Vec<String> },
}

/// Split a line on whitespace into a command name and its arguments.
pub fn parse_line(line: &str) -> Line {
    let mut words = line.split_whitespace().map(str::to_string);
    match words.next() {
        None => Line::Empty,
        Some(name) if name == "exit" || name == "quit" => Line::Exit,
        Some(name) => Line::Command {
            name,
            args: words.collect(),
        },
    }
}

/// Human-readable notice for a bus event, if the shell shows that kind.
///
/// Only completions from the async stage are shown; synchronous results
/// are already printed inline.
pub fn describe_event(event: &Event) -> Option<String> {
    match event.kind {
        EventKind::CommandCompleted => {
            let p: CommandCompletedPayload = event.decode()?;
            (p.stage == "async").then(|| format!("[done] {}: {}", p.command, p.result))
        }
        EventKind::CommandFailed => {
            let p: CommandFailedPayload = event.decode()?;
            (p.stage == "async").then(|| format!("[failed] {}: {}", p.command, p.error))
        }
        EventKind::PluginLoaded
        | EventKind::PluginEnabled
        | EventKind::PluginDisabled
        | EventKind::PluginUnloaded => {
            let p: PluginLifecyclePayload = event.decode()?;
            let verb = match event.kind {
                EventKind::PluginLoaded => "loaded",
                EventKind::PluginEnabled => "enabled",
                EventKind::PluginDisabled => "disabled",
                _ => "unloaded",
            };
            Some(format!("[plugin] {} {} {verb}", p.plugin, p.version))
        }
        EventKind::ConfigChanged => {
            let p: ConfigChangedPayload = event.decode()?;
            Some(format!("[config] {} ({} keys)", p.plugin, p.config.len()))
        }
        EventKind::ThemeRegistered => {
            let p: ThemeRegisteredPayload = event.decode()?;
            Some(format!("[theme] {} ({} bytes)", p.plugin, p.size_bytes))
        }
    }
}

/// Print bus notices to stdout. Returns the subscriptions made.
pub fn print_events(runtime: &Runtime, kinds: &[EventKind]) -> Vec<(EventKind, SubscriptionId)> {
    kinds
        .iter()
        .map(|&kind| {
            let id = runtime.events().subscribe(kind, |event| {
                if let Some(notice) = describe_event(event) {
                    println!("{notice}");
                }
            });
            (kind, id)
        })
        .collect()
}

/// Reads commands from an input stream and writes results to an output.
pub struct Shell<'a> {
    runtime: &'a Runtime,
    /// Await background commands and print their final result inline.
    wait_async: bool,
    prompt: Option<&'static str>,
}

impl<'a> Shell<'a> {
    /// Interactive shell: prompts, async results arrive through the bus.
    pub fn interactive(runtime: &'a Runtime) -> Self {
        Self {
            runtime,
            wait_async: false,
            prompt: Some(PROMPT),
        }
    }

    /// Scripted shell: no prompt, background commands are awaited so
    /// output follows input order.
    pub fn scripted(runtime: &'a Runtime) -> Self {
        Self {
            runtime,
            wait_async: true,
            prompt: None,
        }
    }

    /// Run until EOF or `exit`. Returns the number of commands executed.
    pub async fn run<R, W>(&self, input: R, out: &mut W) -> std::io::Result<usize>
    where
        R: AsyncBufRead + Unpin,
        W: Write,
    {
        let mut lines = input.lines();
        let mut executed = 0;
        loop {
            if let Some(prompt) = self.prompt {
                write!(out, "{prompt}")?;
                out.flush()?;
            }
            let Some(line) = lines.next_line().await? else {
                break;
            };
            match parse_line(&line) {
                Line::Empty => continue,
                Line::Exit => break,
                Line::Command { name, args } => {
                    let output = self.execute(&name, args).await;
                    if !output.is_empty() {
                        writeln!(out, "{output}")?;
                    }
                    executed += 1;
                }
            }
        }
        tracing::debug!(executed, "shell input finished");
        Ok(executed)
    }

    async fn execute(&self, name: &str, args: Vec<String>) -> String {
        let mut ctx = self.runtime.invoke(name, args);
        if !self.wait_async {
            return ctx.result().to_string();
        }
        match ctx.extensions_mut().remove::<PendingCommand>() {
            Some(pending) => match pending.wait().await {
                Ok(done) => done.result().to_string(),
                Err(e) => format!("error: {e}"),
            },
            None => ctx.result().to_string(),
        }
    }
}
