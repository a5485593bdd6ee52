//! SQLite-backed command store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::store::CommandStore;
use super::types::{Scope, StoredCommand};
use crate::db::DbPool;
use crate::{KettleError, Result};

const SELECT_COLUMNS: &str = "SELECT id, scope_kind, scope_id, name, source, source_hash, owner_id,
        description, source_path, created_at, updated_at
 FROM custom_commands";

/// Command store persisted in the `custom_commands` table.
#[derive(Clone)]
pub struct SqliteCommandStore {
    pool: DbPool,
}

impl SqliteCommandStore {
    /// Create a store over the given pool.
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn map_write_error(e: sqlx::Error, name: &str) -> KettleError {
    let unique = e
        .as_database_error()
        .map_or(false, |db| db.is_unique_violation());
    if unique {
        KettleError::AlreadyExists(format!("command '{name}'"))
    } else {
        KettleError::Database(e.to_string())
    }
}

#[async_trait]
impl CommandStore for SqliteCommandStore {
    async fn get(&self, scope: Scope, name: &str) -> Result<Option<StoredCommand>> {
        let row: Option<CommandRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE scope_kind = ? AND scope_id = ? AND name = ?"
        ))
        .bind(scope.kind())
        .bind(scope.id())
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| KettleError::Database(e.to_string()))?;

        row.map(CommandRow::into_command).transpose()
    }

    async fn list(&self, scope: Scope) -> Result<Vec<StoredCommand>> {
        let rows: Vec<CommandRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE scope_kind = ? AND scope_id = ? ORDER BY name"
        ))
        .bind(scope.kind())
        .bind(scope.id())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| KettleError::Database(e.to_string()))?;

        rows.into_iter().map(CommandRow::into_command).collect()
    }

    async fn insert(&self, command: StoredCommand) -> Result<()> {
        sqlx::query(
            "INSERT INTO custom_commands (id, scope_kind, scope_id, name, source, source_hash,
                                          owner_id, description, source_path, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(command.id.to_string())
        .bind(command.scope.kind())
        .bind(command.scope.id())
        .bind(&command.name)
        .bind(&command.source)
        .bind(&command.source_hash)
        .bind(command.owner_id)
        .bind(&command.description)
        .bind(&command.source_path)
        .bind(command.created_at.to_rfc3339())
        .bind(command.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_error(e, &command.name))?;

        Ok(())
    }

    async fn put(&self, command: StoredCommand) -> Result<()> {
        sqlx::query(
            "INSERT INTO custom_commands (id, scope_kind, scope_id, name, source, source_hash,
                                          owner_id, description, source_path, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(scope_kind, scope_id, name) DO UPDATE SET
                source = excluded.source,
                source_hash = excluded.source_hash,
                owner_id = excluded.owner_id,
                description = excluded.description,
                source_path = excluded.source_path,
                updated_at = excluded.updated_at",
        )
        .bind(command.id.to_string())
        .bind(command.scope.kind())
        .bind(command.scope.id())
        .bind(&command.name)
        .bind(&command.source)
        .bind(&command.source_hash)
        .bind(command.owner_id)
        .bind(&command.description)
        .bind(&command.source_path)
        .bind(command.created_at.to_rfc3339())
        .bind(command.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| KettleError::Database(e.to_string()))?;

        Ok(())
    }

    async fn delete(&self, scope: Scope, name: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM custom_commands WHERE scope_kind = ? AND scope_id = ? AND name = ?",
        )
        .bind(scope.kind())
        .bind(scope.id())
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(|e| KettleError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}

/// Internal row type for the `custom_commands` table.
#[derive(sqlx::FromRow)]
struct CommandRow {
    id: String,
    scope_kind: String,
    scope_id: i64,
    name: String,
    source: String,
    source_hash: String,
    owner_id: i64,
    description: Option<String>,
    source_path: Option<String>,
    created_at: String,
    updated_at: String,
}

impl CommandRow {
    fn into_command(self) -> Result<StoredCommand> {
        let corrupt = |what: &str| {
            KettleError::Database(format!("invalid {what} in command '{}'", self.name))
        };

        let id = Uuid::parse_str(&self.id).map_err(|_| corrupt("id"))?;
        let scope =
            Scope::from_parts(&self.scope_kind, self.scope_id).ok_or_else(|| corrupt("scope"))?;
        let created_at = parse_timestamp(&self.created_at).ok_or_else(|| corrupt("created_at"))?;
        let updated_at = parse_timestamp(&self.updated_at).ok_or_else(|| corrupt("updated_at"))?;

        Ok(StoredCommand {
            id,
            scope,
            name: self.name,
            source: self.source,
            source_hash: self.source_hash,
            owner_id: self.owner_id,
            description: self.description,
            source_path: self.source_path,
            created_at,
            updated_at,
        })
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::types::NewCommand;
    use crate::Database;

    async fn setup() -> (Database, SqliteCommandStore) {
        let db = Database::open_in_memory().await.unwrap();
        let store = SqliteCommandStore::new(db.pool().clone());
        (db, store)
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let (_db, store) = setup().await;
        let command = NewCommand::new(Scope::Guild(5), "ping", "say(\"pong\");", 10)
            .with_description("Replies with pong")
            .into_stored();
        store.insert(command.clone()).await.unwrap();

        let found = store.get(Scope::Guild(5), "ping").await.unwrap().unwrap();
        assert_eq!(found.id, command.id);
        assert_eq!(found.source, command.source);
        assert_eq!(found.source_hash, command.source_hash);
        assert_eq!(found.description.as_deref(), Some("Replies with pong"));
        assert_eq!(found.created_at, command.created_at);
        assert!(found.source_path.is_none());

        assert!(store.get(Scope::Guild(5), "PING").await.unwrap().is_none());
        assert!(store.get(Scope::User(5), "ping").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_duplicate_is_already_exists() {
        let (_db, store) = setup().await;
        store
            .insert(NewCommand::new(Scope::Guild(1), "ping", "", 1).into_stored())
            .await
            .unwrap();
        let err = store
            .insert(NewCommand::new(Scope::Guild(1), "ping", "", 2).into_stored())
            .await
            .unwrap_err();
        assert!(matches!(err, KettleError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_put_upserts_by_name() {
        let (_db, store) = setup().await;
        let command = NewCommand::new(Scope::Guild(1), "ping", "say(1);", 1)
            .with_source_path("ping.ks")
            .into_stored();
        store.put(command.clone()).await.unwrap();
        store.put(command.with_source("say(2);")).await.unwrap();

        let all = store.list(Scope::Guild(1)).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].source, "say(2);");
        assert_eq!(all[0].id, command.id);
        assert_eq!(all[0].source_path.as_deref(), Some("ping.ks"));
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let (_db, store) = setup().await;
        for name in ["b", "a", "c"] {
            store
                .insert(NewCommand::new(Scope::User(3), name, "", 3).into_stored())
                .await
                .unwrap();
        }

        let names: Vec<String> = store
            .list(Scope::User(3))
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        assert!(store.delete(Scope::User(3), "b").await.unwrap());
        assert!(!store.delete(Scope::User(3), "b").await.unwrap());
        assert_eq!(store.list(Scope::User(3)).await.unwrap().len(), 2);
    }
}
