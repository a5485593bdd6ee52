//! Command storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::types::{Scope, StoredCommand};
use crate::{KettleError, Result};

/// Persistent storage for custom commands.
///
/// Lookups are the only suspension points on the dispatch path.
#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Find a command by exact (case-sensitive) name.
    async fn get(&self, scope: Scope, name: &str) -> Result<Option<StoredCommand>>;

    /// All commands in a scope, ordered by name.
    async fn list(&self, scope: Scope) -> Result<Vec<StoredCommand>>;

    /// Add a command. Fails with `AlreadyExists` when the name is taken.
    async fn insert(&self, command: StoredCommand) -> Result<()>;

    /// Insert or replace the command with the same scope and name.
    async fn put(&self, command: StoredCommand) -> Result<()>;

    /// Remove a command. Returns whether it existed.
    async fn delete(&self, scope: Scope, name: &str) -> Result<bool>;
}

type CommandMap = HashMap<(Scope, String), StoredCommand>;

/// In-memory command store.
///
/// Writers copy the current map, apply their change and publish the copy.
/// Readers clone the published `Arc` and never observe a half-applied
/// write.
#[derive(Default)]
pub struct MemoryCommandStore {
    commands: RwLock<Arc<CommandMap>>,
}

impl MemoryCommandStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The currently published map.
    pub fn snapshot(&self) -> Arc<CommandMap> {
        // A poisoned lock still guards a complete map: writes only swap the Arc.
        let guard = self.commands.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Copy, modify and publish.
    fn update<T>(&self, f: impl FnOnce(&mut CommandMap) -> Result<T>) -> Result<T> {
        let mut guard = self.commands.write().unwrap_or_else(|e| e.into_inner());
        let mut next = CommandMap::clone(&guard);
        let result = f(&mut next)?;
        *guard = Arc::new(next);
        Ok(result)
    }
}

#[async_trait]
impl CommandStore for MemoryCommandStore {
    async fn get(&self, scope: Scope, name: &str) -> Result<Option<StoredCommand>> {
        Ok(self.snapshot().get(&(scope, name.to_string())).cloned())
    }

    async fn list(&self, scope: Scope) -> Result<Vec<StoredCommand>> {
        let mut commands: Vec<StoredCommand> = self
            .snapshot()
            .values()
            .filter(|c| c.scope == scope)
            .cloned()
            .collect();
        commands.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(commands)
    }

    async fn insert(&self, command: StoredCommand) -> Result<()> {
        self.update(|map| {
            let key = (command.scope, command.name.clone());
            if map.contains_key(&key) {
                return Err(KettleError::AlreadyExists(format!(
                    "command '{}'",
                    command.name
                )));
            }
            map.insert(key, command);
            Ok(())
        })
    }

    async fn put(&self, command: StoredCommand) -> Result<()> {
        self.update(|map| {
            map.insert((command.scope, command.name.clone()), command);
            Ok(())
        })
    }

    async fn delete(&self, scope: Scope, name: &str) -> Result<bool> {
        self.update(|map| Ok(map.remove(&(scope, name.to_string())).is_some()))
    }
}
