//! Command types and data structures.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{KettleError, Result};

/// Maximum command name length in characters.
pub const MAX_NAME_LENGTH: usize = 32;

/// Namespace a command name is unique within.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Scope {
    /// Commands shared by everyone in a guild.
    Guild(i64),
    /// Commands a user can run in direct messages.
    User(i64),
}

impl Scope {
    /// Storage tag for the scope kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Scope::Guild(_) => "guild",
            Scope::User(_) => "user",
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Scope::Guild(id) | Scope::User(id) => *id,
        }
    }

    /// Rebuild a scope from its storage representation.
    pub fn from_parts(kind: &str, id: i64) -> Option<Self> {
        match kind {
            "guild" => Some(Scope::Guild(id)),
            "user" => Some(Scope::User(id)),
            _ => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// A user-authored command as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCommand {
    pub id: Uuid,
    pub scope: Scope,
    /// Invocation name, unique within the scope (case-sensitive).
    pub name: String,
    pub source: String,
    /// SHA-256 hex digest of `source`.
    pub source_hash: String,
    pub owner_id: i64,
    pub description: Option<String>,
    /// File the command was loaded from, relative to the scripts directory.
    /// `None` for commands authored through the registry.
    pub source_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredCommand {
    /// A copy with new source text.
    pub fn with_source(&self, source: impl Into<String>) -> Self {
        let source = source.into();
        Self {
            source_hash: source_hash(&source),
            source,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }
}

/// Data for creating a new command.
#[derive(Debug, Clone)]
pub struct NewCommand {
    pub scope: Scope,
    pub name: String,
    pub source: String,
    pub owner_id: i64,
    pub description: Option<String>,
    pub source_path: Option<String>,
}

impl NewCommand {
    /// Create a new command with required fields.
    pub fn new(
        scope: Scope,
        name: impl Into<String>,
        source: impl Into<String>,
        owner_id: i64,
    ) -> Self {
        Self {
            scope,
            name: name.into(),
            source: source.into(),
            owner_id,
            description: None,
            source_path: None,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Mark the command as loaded from a file.
    pub fn with_source_path(mut self, path: impl Into<String>) -> Self {
        self.source_path = Some(path.into());
        self
    }

    /// Assign an id and timestamps.
    pub fn into_stored(self) -> StoredCommand {
        let now = Utc::now();
        StoredCommand {
            id: Uuid::new_v4(),
            scope: self.scope,
            source_hash: source_hash(&self.source),
            name: self.name,
            source: self.source,
            owner_id: self.owner_id,
            description: self.description,
            source_path: self.source_path,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Who is performing an authoring operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: i64,
    pub is_admin: bool,
}

impl Actor {
    pub fn user(user_id: i64) -> Self {
        Self {
            user_id,
            is_admin: false,
        }
    }

    pub fn admin(user_id: i64) -> Self {
        Self {
            user_id,
            is_admin: true,
        }
    }

    /// Owners and admins may change or delete a command.
    pub fn can_manage(&self, command: &StoredCommand) -> bool {
        self.is_admin || command.owner_id == self.user_id
    }
}

/// SHA-256 hex digest used to key compiled programs.
pub fn source_hash(source: &str) -> String {
    format!("{:x}", Sha256::digest(source.as_bytes()))
}

/// Validate a command name.
///
/// Names are 1 to 32 characters with no whitespace or control characters.
pub fn validate_name(name: &str) -> Result<()> {
    let length = name.chars().count();
    if length == 0 {
        return Err(KettleError::Validation(
            "command name must not be empty".to_string(),
        ));
    }
    if length > MAX_NAME_LENGTH {
        return Err(KettleError::Validation(format!(
            "command name must be at most {MAX_NAME_LENGTH} characters"
        )));
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(KettleError::Validation(
            "command name must not contain whitespace or control characters".to_string(),
        ));
    }
    Ok(())
}
