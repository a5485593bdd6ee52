//! Database schema and migrations for kettle.
//!
//! Migrations are applied sequentially when the database is first opened
//! or upgraded.

/// Database migrations.
///
/// Each migration is a SQL script that will be executed in order.
/// The schema_version table tracks which migrations have been applied.
pub const MIGRATIONS: &[&str] = &[
    // v1: Custom commands
    r#"
CREATE TABLE custom_commands (
    id           TEXT PRIMARY KEY,          -- UUID
    scope_kind   TEXT NOT NULL,             -- 'guild' or 'user'
    scope_id     INTEGER NOT NULL,
    name         TEXT NOT NULL,
    source       TEXT NOT NULL,
    source_hash  TEXT NOT NULL,             -- SHA-256 hex of source
    owner_id     INTEGER NOT NULL,
    description  TEXT,
    source_path  TEXT,                      -- script file, set only for loader-owned commands
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    UNIQUE(scope_kind, scope_id, name)
);

CREATE INDEX idx_custom_commands_scope ON custom_commands(scope_kind, scope_id);
CREATE INDEX idx_custom_commands_owner ON custom_commands(owner_id);
"#,
];
