//! Command registry: authoring operations and the compiled-program cache.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use super::store::CommandStore;
use super::types::{validate_name, Actor, NewCommand, Scope, StoredCommand};
use crate::script::{parse, Program, ScriptFailure};
use crate::{KettleError, Result};

/// Compiled programs kept before the cache is cleared.
const MAX_CACHED_PROGRAMS: usize = 1024;

/// Maps command names to stored commands within a scope.
///
/// The store is injected at construction; the registry holds no global
/// state.
pub struct CommandRegistry {
    store: Arc<dyn CommandStore>,
    /// Parsed programs keyed by source hash.
    programs: RwLock<HashMap<String, Arc<Program>>>,
}

impl CommandRegistry {
    pub fn new(store: Arc<dyn CommandStore>) -> Self {
        Self {
            store,
            programs: RwLock::new(HashMap::new()),
        }
    }

    /// Look up a command by exact name.
    pub async fn resolve(&self, scope: Scope, name: &str) -> Result<Option<StoredCommand>> {
        self.store.get(scope, name).await
    }

    /// All commands in a scope, ordered by name.
    pub async fn list(&self, scope: Scope) -> Result<Vec<StoredCommand>> {
        self.store.list(scope).await
    }

    /// Register a new command.
    ///
    /// The name is validated and the source must parse. Fails with
    /// `AlreadyExists` if the scope already has a command with this name.
    pub async fn create(&self, new_command: NewCommand) -> Result<StoredCommand> {
        validate_name(&new_command.name)?;
        let program = parse(&new_command.source).map_err(|e| KettleError::Script(e.to_string()))?;

        let command = new_command.into_stored();
        self.store.insert(command.clone()).await?;
        self.cache(&command.source_hash, Arc::new(program));

        info!(
            scope = %command.scope,
            name = %command.name,
            owner = command.owner_id,
            "Created command"
        );
        Ok(command)
    }

    /// Replace a command's source. Only the owner or an admin may do this.
    pub async fn update_source(
        &self,
        scope: Scope,
        name: &str,
        source: impl Into<String>,
        actor: Actor,
    ) -> Result<StoredCommand> {
        let existing = self.require_managed(scope, name, actor).await?;

        let source = source.into();
        let program = parse(&source).map_err(|e| KettleError::Script(e.to_string()))?;

        let updated = existing.with_source(source);
        self.store.put(updated.clone()).await?;
        self.cache(&updated.source_hash, Arc::new(program));

        info!(scope = %scope, name, actor = actor.user_id, "Updated command source");
        Ok(updated)
    }

    /// Delete a command. Only the owner or an admin may do this.
    pub async fn delete(&self, scope: Scope, name: &str, actor: Actor) -> Result<()> {
        self.require_managed(scope, name, actor).await?;
        if !self.store.delete(scope, name).await? {
            return Err(KettleError::NotFound(format!("command '{name}'")));
        }
        info!(scope = %scope, name, actor = actor.user_id, "Deleted command");
        Ok(())
    }

    /// The parsed program for a command, from cache when the source is
    /// unchanged.
    pub fn compile(&self, command: &StoredCommand) -> std::result::Result<Arc<Program>, ScriptFailure> {
        if let Some(program) = self.cached(&command.source_hash) {
            return Ok(program);
        }

        debug!(name = %command.name, hash = %command.source_hash, "Compiling command");
        let program = Arc::new(parse(&command.source)?);
        self.cache(&command.source_hash, Arc::clone(&program));
        Ok(program)
    }

    /// Underlying store, for hosts that manage commands directly.
    pub fn store(&self) -> &Arc<dyn CommandStore> {
        &self.store
    }

    /// Number of compiled programs currently cached.
    pub fn cached_programs(&self) -> usize {
        self.programs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn require_managed(
        &self,
        scope: Scope,
        name: &str,
        actor: Actor,
    ) -> Result<StoredCommand> {
        let command = self
            .store
            .get(scope, name)
            .await?
            .ok_or_else(|| KettleError::NotFound(format!("command '{name}'")))?;

        if !actor.can_manage(&command) {
            return Err(KettleError::Permission(format!(
                "only the owner or an admin can change command '{name}'"
            )));
        }
        Ok(command)
    }

    fn cached(&self, hash: &str) -> Option<Arc<Program>> {
        let programs = self.programs.read().unwrap_or_else(|e| e.into_inner());
        programs.get(hash).cloned()
    }

    fn cache(&self, hash: &str, program: Arc<Program>) {
        let mut programs = self.programs.write().unwrap_or_else(|e| e.into_inner());
        if programs.len() >= MAX_CACHED_PROGRAMS && !programs.contains_key(hash) {
            programs.clear();
        }
        programs.insert(hash.to_string(), program);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::store::MemoryCommandStore;

    fn registry() -> CommandRegistry {
        CommandRegistry::new(Arc::new(MemoryCommandStore::new()))
    }

    #[tokio::test]
    async fn test_create_and_resolve() {
        let registry = registry();
        let created = registry
            .create(NewCommand::new(Scope::Guild(1), "ping", "say(\"pong\");", 10))
            .await
            .unwrap();

        let found = registry.resolve(Scope::Guild(1), "ping").await.unwrap().unwrap();
        assert_eq!(found.id, created.id);
        assert!(registry.resolve(Scope::Guild(1), "pong").await.unwrap().is_none());
        assert_eq!(registry.cached_programs(), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_name() {
        let registry = registry();
        let err = registry
            .create(NewCommand::new(Scope::Guild(1), "two words", "", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, KettleError::Validation(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_syntax_error() {
        let registry = registry();
        let err = registry
            .create(NewCommand::new(Scope::Guild(1), "bad", "let x = ;", 1))
            .await
            .unwrap_err();
        match err {
            KettleError::Script(message) => assert!(message.contains("line 1")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(registry.resolve(Scope::Guild(1), "bad").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_rejects_long_operator_chain() {
        let registry = registry();
        let source = format!("return {}1 )", "1+".repeat(20_000));
        let err = registry
            .create(NewCommand::new(Scope::Guild(1), "chain", source, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, KettleError::Script(_)), "{err:?}");

        let source = format!("return {}1;", "1+".repeat(3_000));
        let err = registry
            .create(NewCommand::new(Scope::Guild(1), "chain", source, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, KettleError::Script(_)), "{err:?}");
        assert!(registry.resolve(Scope::Guild(1), "chain").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_duplicate() {
        let registry = registry();
        registry
            .create(NewCommand::new(Scope::Guild(1), "ping", "", 1))
            .await
            .unwrap();
        let err = registry
            .create(NewCommand::new(Scope::Guild(1), "ping", "", 2))
            .await
            .unwrap_err();
        assert!(matches!(err, KettleError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_update_source_requires_owner_or_admin() {
        let registry = registry();
        registry
            .create(NewCommand::new(Scope::Guild(1), "ping", "say(1);", 10))
            .await
            .unwrap();

        let err = registry
            .update_source(Scope::Guild(1), "ping", "say(2);", Actor::user(11))
            .await
            .unwrap_err();
        assert!(matches!(err, KettleError::Permission(_)));

        let updated = registry
            .update_source(Scope::Guild(1), "ping", "say(2);", Actor::user(10))
            .await
            .unwrap();
        assert_eq!(updated.source, "say(2);");

        registry
            .update_source(Scope::Guild(1), "ping", "say(3);", Actor::admin(99))
            .await
            .unwrap();
        let found = registry.resolve(Scope::Guild(1), "ping").await.unwrap().unwrap();
        assert_eq!(found.source, "say(3);");
        assert_eq!(found.owner_id, 10);
    }

    #[tokio::test]
    async fn test_update_source_rejects_syntax_error() {
        let registry = registry();
        registry
            .create(NewCommand::new(Scope::Guild(1), "ping", "say(1);", 10))
            .await
            .unwrap();
        let err = registry
            .update_source(Scope::Guild(1), "ping", "say(", Actor::user(10))
            .await
            .unwrap_err();
        assert!(matches!(err, KettleError::Script(_)));

        let found = registry.resolve(Scope::Guild(1), "ping").await.unwrap().unwrap();
        assert_eq!(found.source, "say(1);");
    }

    #[tokio::test]
    async fn test_delete_requires_owner_or_admin() {
        let registry = registry();
        registry
            .create(NewCommand::new(Scope::Guild(1), "ping", "", 10))
            .await
            .unwrap();

        let err = registry
            .delete(Scope::Guild(1), "ping", Actor::user(11))
            .await
            .unwrap_err();
        assert!(matches!(err, KettleError::Permission(_)));
        assert!(registry.resolve(Scope::Guild(1), "ping").await.unwrap().is_some());

        registry
            .delete(Scope::Guild(1), "ping", Actor::admin(11))
            .await
            .unwrap();
        assert!(registry.resolve(Scope::Guild(1), "ping").await.unwrap().is_none());

        let err = registry
            .delete(Scope::Guild(1), "ping", Actor::admin(11))
            .await
            .unwrap_err();
        assert!(matches!(err, KettleError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_compile_uses_cache() {
        let registry = registry();
        let command = NewCommand::new(Scope::Guild(1), "ping", "say(1);", 1).into_stored();

        let first = registry.compile(&command).unwrap();
        let second = registry.compile(&command).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let changed = command.with_source("say(2);");
        let third = registry.compile(&changed).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(registry.cached_programs(), 2);
    }

    #[tokio::test]
    async fn test_compile_reports_syntax_error() {
        let registry = registry();
        let command = NewCommand::new(Scope::Guild(1), "bad", "if {", 1).into_stored();
        let err = registry.compile(&command).unwrap_err();
        assert!(matches!(err, ScriptFailure::ScriptError { .. }));
    }
}
