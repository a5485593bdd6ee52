//! Configuration module for kettle.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::script::{LimitKind, QuotaLimits, MAX_STACK_DEPTH_CEILING};
use crate::{KettleError, Result};

/// Environment variable overriding `database.path`.
pub const DATABASE_PATH_ENV: &str = "KETTLE_DATABASE_PATH";

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/kettle.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Maximum pooled connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_path() -> String {
    "data/kettle.db".to_string()
}

fn default_max_connections() -> u32 {
    4
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_max_connections(),
        }
    }
}

/// Custom command configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandsConfig {
    /// Prefixes that mark a message as a command invocation.
    #[serde(default = "default_prefixes")]
    pub prefixes: Vec<String>,
    /// Directory of `.ks` scripts synced at startup.
    #[serde(default)]
    pub scripts_dir: Option<String>,
    /// Guild the scripts directory is synced into.
    #[serde(default = "default_seed_guild_id")]
    pub seed_guild_id: i64,
    /// Per-execution deadline in milliseconds. 0 disables it.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Executions allowed to run at once; further ones wait for a slot.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_prefixes() -> Vec<String> {
    vec!["!".to_string()]
}

fn default_seed_guild_id() -> i64 {
    1
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_max_concurrent() -> usize {
    16
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            prefixes: default_prefixes(),
            scripts_dir: None,
            seed_guild_id: default_seed_guild_id(),
            timeout_ms: default_timeout_ms(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

impl CommandsConfig {
    /// The execution deadline, if enabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

/// Resource ceilings applied to every execution.
///
/// Keys are accepted in snake_case or camelCase. An absent key takes the
/// default shown here, never unbounded.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LimitsConfig {
    #[serde(default = "default_max_instructions", alias = "maxInstructions")]
    pub max_instructions: u64,
    #[serde(default = "default_max_stack_depth", alias = "maxStackDepth")]
    pub max_stack_depth: u64,
    #[serde(default = "default_max_items", alias = "maxArrayItems")]
    pub max_array_items: u64,
    #[serde(default = "default_max_items", alias = "maxObjectItems")]
    pub max_object_items: u64,
    #[serde(default = "default_max_string_length", alias = "maxStringLength")]
    pub max_string_length: u64,
}

fn default_max_instructions() -> u64 {
    100_000
}

fn default_max_stack_depth() -> u64 {
    64
}

fn default_max_items() -> u64 {
    10_000
}

fn default_max_string_length() -> u64 {
    100_000
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_instructions: default_max_instructions(),
            max_stack_depth: default_max_stack_depth(),
            max_array_items: default_max_items(),
            max_object_items: default_max_items(),
            max_string_length: default_max_string_length(),
        }
    }
}

impl LimitsConfig {
    /// Convert to interpreter quota limits.
    pub fn to_quota_limits(&self) -> QuotaLimits {
        QuotaLimits {
            max_instructions: Some(self.max_instructions),
            max_stack_depth: Some(self.max_stack_depth),
            max_array_items: Some(self.max_array_items),
            max_object_items: Some(self.max_object_items),
            max_string_length: Some(self.max_string_length),
        }
    }

    /// The configured ceiling for `kind`.
    pub fn get(&self, kind: LimitKind) -> u64 {
        match kind {
            LimitKind::Instructions => self.max_instructions,
            LimitKind::Stack => self.max_stack_depth,
            LimitKind::ArrayItems => self.max_array_items,
            LimitKind::ObjectItems => self.max_object_items,
            LimitKind::StringLength => self.max_string_length,
        }
    }

    fn validate(&self) -> Result<()> {
        for kind in LimitKind::ALL {
            if self.get(kind) == 0 {
                return Err(KettleError::Config(format!(
                    "limits.{} must be a positive integer",
                    kind.config_key()
                )));
            }
        }
        if self.max_stack_depth > MAX_STACK_DEPTH_CEILING {
            return Err(KettleError::Config(format!(
                "limits.max_stack_depth must be at most {MAX_STACK_DEPTH_CEILING}"
            )));
        }
        Ok(())
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Custom command configuration.
    #[serde(default)]
    pub commands: CommandsConfig,
    /// Execution limits.
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(KettleError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| KettleError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `KETTLE_DATABASE_PATH`: Override the database path
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var(DATABASE_PATH_ENV) {
            if !path.is_empty() {
                self.database.path = path;
            }
        }
    }

    /// Validate the configuration.
    ///
    /// Returns an error if:
    /// - any limit is zero or the stack depth is above the ceiling
    /// - no command prefix is configured
    /// - `commands.max_concurrent` is zero
    pub fn validate(&self) -> Result<()> {
        self.limits.validate()?;
        if self.commands.max_concurrent == 0 {
            return Err(KettleError::Config(
                "commands.max_concurrent must be a positive integer".to_string(),
            ));
        }
        if self.commands.prefixes.iter().all(|p| p.is_empty()) {
            return Err(KettleError::Config(
                "commands.prefixes must contain at least one non-empty prefix".to_string(),
            ));
        }
        Ok(())
    }
}
