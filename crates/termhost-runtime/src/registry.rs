//! Command registry: the table of commands visible to the handler chain.
//!
//! The table is copy-on-write: writers build a complete new table and swap
//! it in under the write lock, readers clone the current `Arc`. A dispatch
//! therefore sees either all of a plugin's commands or none of them, never
//! a half-applied registration or removal.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::command::{Command, CommandContext};
use crate::error::RuntimeError;

/// Who registered a command.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CommandOwner {
    /// Host built-in.
    Host,
    /// Contributed by the named plugin.
    Plugin(String),
}

impl fmt::Display for CommandOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandOwner::Host => f.write_str("host"),
            CommandOwner::Plugin(name) => write!(f, "plugin '{name}'"),
        }
    }
}

/// A registered command and its owner.
#[derive(Clone)]
pub struct CommandEntry {
    pub command: Arc<dyn Command>,
    pub owner: CommandOwner,
}

impl fmt::Debug for CommandEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandEntry")
            .field("name", &self.command.name())
            .field("capability", &self.command.capability())
            .field("owner", &self.owner)
            .finish()
    }
}

/// Immutable snapshot of the registered commands. Names are case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    entries: HashMap<String, CommandEntry>,
}

impl CommandTable {
    pub fn get(&self, name: &str) -> Option<&CommandEntry> {
        self.entries.get(&name.to_ascii_lowercase())
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Command>> {
        self.get(name).map(|entry| Arc::clone(&entry.command))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Sorted command names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Sorted names of the commands registered by `owner`.
    pub fn owned_by(&self, owner: &CommandOwner) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| &entry.owner == owner)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn entries(&self) -> impl Iterator<Item = &CommandEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Shared registry of host and plugin commands.
#[derive(Default)]
pub struct CommandRegistry {
    table: RwLock<Arc<CommandTable>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current table.
    pub fn snapshot(&self) -> Arc<CommandTable> {
        Arc::clone(&self.table.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Command>> {
        self.snapshot().resolve(name)
    }

    /// Build a context for `name`, resolved against the current table.
    pub fn context_for(&self, name: &str, args: Vec<String>) -> CommandContext {
        CommandContext::new(name, args).with_command(self.resolve(name))
    }

    /// Register a host built-in. Replaces an earlier built-in of the same
    /// name but never a plugin command.
    pub fn register_builtin(&self, command: Arc<dyn Command>) -> Result<(), RuntimeError> {
        let key = command.name().to_ascii_lowercase();
        self.update(|table| {
            if let Some(existing) = table.entries.get(&key) {
                if existing.owner != CommandOwner::Host {
                    return Err(RuntimeError::CommandConflict {
                        command: key.clone(),
                        owner: existing.owner.to_string(),
                    });
                }
            }
            table.entries.insert(
                key.clone(),
                CommandEntry {
                    command,
                    owner: CommandOwner::Host,
                },
            );
            Ok(())
        })
    }

    /// Register every command of a plugin, all or nothing.
    ///
    /// Fails without touching the table when a name is already taken by
    /// another owner or appears twice in `commands`. Returns the registered
    /// names.
    pub fn register_plugin_commands(
        &self,
        plugin: &str,
        commands: &[Arc<dyn Command>],
    ) -> Result<Vec<String>, RuntimeError> {
        let owner = CommandOwner::Plugin(plugin.to_string());
        self.update(|table| {
            let mut names = Vec::with_capacity(commands.len());
            for command in commands {
                let key = command.name().to_ascii_lowercase();
                if key.is_empty() {
                    return Err(RuntimeError::Load(format!(
                        "plugin '{plugin}' contributes a command with an empty name"
                    )));
                }
                if names.contains(&key) {
                    return Err(RuntimeError::CommandConflict {
                        command: key,
                        owner: owner.to_string(),
                    });
                }
                if let Some(existing) = table.entries.get(&key) {
                    if existing.owner != owner {
                        return Err(RuntimeError::CommandConflict {
                            command: key,
                            owner: existing.owner.to_string(),
                        });
                    }
                }
                names.push(key);
            }

            for (key, command) in names.iter().zip(commands) {
                table.entries.insert(
                    key.clone(),
                    CommandEntry {
                        command: Arc::clone(command),
                        owner: owner.clone(),
                    },
                );
            }
            Ok(names)
        })
    }

    /// Remove every command registered by `owner`. Returns the removed names.
    pub fn remove_owner(&self, owner: &CommandOwner) -> Vec<String> {
        let removed: Result<Vec<String>, RuntimeError> = self.update(|table| {
            let names = table.owned_by(owner);
            for name in &names {
                table.entries.remove(name);
            }
            Ok(names)
        });
        removed.unwrap_or_default()
    }

    /// Remove every command contributed by `plugin`.
    pub fn remove_plugin_commands(&self, plugin: &str) -> Vec<String> {
        self.remove_owner(&CommandOwner::Plugin(plugin.to_string()))
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Apply `f` to a copy of the table and publish the copy if `f` succeeds.
    fn update<T>(
        &self,
        f: impl FnOnce(&mut CommandTable) -> Result<T, RuntimeError>,
    ) -> Result<T, RuntimeError> {
        let mut guard = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = CommandTable::clone(&guard);
        let out = f(&mut next)?;
        *guard = Arc::new(next);
        Ok(out)
    }
}
