//! Command loader for syncing `.ks` script files into a scope.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::registry::CommandRegistry;
use super::types::{source_hash, NewCommand, Scope, StoredCommand};
use crate::script::parse;
use crate::Result;

/// File extension of command scripts.
pub const SCRIPT_EXTENSION: &str = "ks";

/// Metadata read from the leading comment block of a script file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandMetadata {
    pub description: Option<String>,
}

/// Result of a directory sync.
#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    /// Number of commands added.
    pub added: usize,
    /// Number of commands updated.
    pub updated: usize,
    /// Number of commands removed.
    pub removed: usize,
    /// Files or commands that could not be synced, with the reason.
    pub errors: Vec<(String, String)>,
}

impl SyncResult {
    /// Check if any changes were made.
    pub fn has_changes(&self) -> bool {
        self.added > 0 || self.updated > 0 || self.removed > 0
    }

    /// Get total number of changes.
    pub fn total_changes(&self) -> usize {
        self.added + self.updated + self.removed
    }
}

/// Loads command scripts from a directory.
///
/// Each `name.ks` file becomes the command `name`. Commands the loader
/// created remember their file; authored commands are never touched.
pub struct CommandLoader {
    scripts_dir: PathBuf,
}

impl CommandLoader {
    /// Create a new CommandLoader for the given directory.
    pub fn new<P: AsRef<Path>>(scripts_dir: P) -> Self {
        Self {
            scripts_dir: scripts_dir.as_ref().to_path_buf(),
        }
    }

    /// Get the scripts directory path.
    pub fn scripts_dir(&self) -> &Path {
        &self.scripts_dir
    }

    /// Sync script files into `scope`.
    ///
    /// This will:
    /// 1. Scan the directory for `.ks` files
    /// 2. Add new commands and update those whose source or description changed
    /// 3. Remove loader-owned commands whose file is gone
    ///
    /// Files that fail to read, have an invalid name or do not parse are
    /// reported in [`SyncResult::errors`] and leave any existing command as
    /// it was.
    pub async fn sync(
        &self,
        registry: &CommandRegistry,
        scope: Scope,
        owner_id: i64,
    ) -> Result<SyncResult> {
        let mut result = SyncResult::default();

        let existing: HashMap<String, StoredCommand> = registry
            .list(scope)
            .await?
            .into_iter()
            .map(|c| (c.name.clone(), c))
            .collect();
        let mut found: HashSet<String> = HashSet::new();

        for path in self.script_files(&mut result).await {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();

            match self
                .sync_file(&path, &file_name, registry, scope, owner_id, &existing, &mut result)
                .await
            {
                Ok(Some(name)) => {
                    found.insert(name);
                }
                Ok(None) => {}
                Err(e) => result.errors.push((file_name, e.to_string())),
            }
        }

        for command in existing.values() {
            if command.source_path.is_none() || found.contains(&command.name) {
                continue;
            }
            match registry.store().delete(scope, &command.name).await {
                Ok(_) => {
                    debug!(name = %command.name, "Removed command whose file is gone");
                    result.removed += 1;
                }
                Err(e) => result.errors.push((command.name.clone(), e.to_string())),
            }
        }

        if result.has_changes() {
            info!(
                scope = %scope,
                added = result.added,
                updated = result.updated,
                removed = result.removed,
                "Synced command scripts"
            );
        }
        for (file, error) in &result.errors {
            warn!(file = %file, error = %error, "Failed to sync command script");
        }

        Ok(result)
    }

    /// `.ks` files directly inside the directory, sorted by path.
    async fn script_files(&self, result: &mut SyncResult) -> Vec<PathBuf> {
        let mut files = Vec::new();
        if !self.scripts_dir.exists() {
            return files;
        }

        let mut entries = match tokio::fs::read_dir(&self.scripts_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                result
                    .errors
                    .push((self.scripts_dir.display().to_string(), e.to_string()));
                return files;
            }
        };

        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    if path.is_file()
                        && path.extension().is_some_and(|ext| ext == SCRIPT_EXTENSION)
                    {
                        files.push(path);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    result
                        .errors
                        .push((self.scripts_dir.display().to_string(), e.to_string()));
                    break;
                }
            }
        }

        files.sort();
        files
    }

    /// Sync one file. Returns the command name it now backs, if any.
    #[allow(clippy::too_many_arguments)]
    async fn sync_file(
        &self,
        path: &Path,
        file_name: &str,
        registry: &CommandRegistry,
        scope: Scope,
        owner_id: i64,
        existing: &HashMap<String, StoredCommand>,
        result: &mut SyncResult,
    ) -> Result<Option<String>> {
        let name = Self::command_name(path);
        let content = tokio::fs::read_to_string(path).await?;
        let metadata = Self::parse_metadata(&content);

        let Some(current) = existing.get(&name) else {
            let mut new_command = NewCommand::new(scope, name.as_str(), content, owner_id)
                .with_source_path(file_name);
            if let Some(description) = metadata.description {
                new_command = new_command.with_description(description);
            }
            registry.create(new_command).await?;
            result.added += 1;
            return Ok(Some(name));
        };

        if current.source_path.is_none() {
            result.errors.push((
                file_name.to_string(),
                format!("command '{name}' already exists and was not loaded from a file"),
            ));
            return Ok(None);
        }

        if current.source_hash == source_hash(&content)
            && current.description == metadata.description
            && current.source_path.as_deref() == Some(file_name)
        {
            return Ok(Some(name));
        }

        if let Err(e) = parse(&content) {
            // Keep the previous version running.
            result.errors.push((file_name.to_string(), e.to_string()));
            return Ok(Some(name));
        }

        let mut updated = current.with_source(content);
        updated.description = metadata.description;
        updated.source_path = Some(file_name.to_string());
        registry.store().put(updated).await?;
        result.updated += 1;
        Ok(Some(name))
    }

    /// Parse metadata from the leading comment block.
    ///
    /// Looks for comments like:
    /// ```text
    /// // @description Rolls a die
    /// ```
    pub fn parse_metadata(content: &str) -> CommandMetadata {
        let mut metadata = CommandMetadata::default();

        for line in content.lines() {
            let line = line.trim();
            if !line.starts_with("//") {
                // Stop at first non-comment line
                if !line.is_empty() {
                    break;
                }
                continue;
            }

            let comment = line.trim_start_matches("//").trim();
            if let Some(value) = comment.strip_prefix("@description ") {
                let value = value.trim();
                if !value.is_empty() {
                    metadata.description = Some(value.to_string());
                }
            }
        }

        metadata
    }

    /// Command name for a script file: its stem.
    fn command_name(path: &Path) -> String {
        path.file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}
