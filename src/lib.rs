//! kettle - custom chat command runtime
//!
//! Runs user-authored chat commands in a sandboxed interpreter with hard
//! resource quotas, and turns their failures into user-safe error reports.

pub mod command;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod script;

pub use command::{
    Actor, CommandDispatcher, CommandLoader, CommandRegistry, CommandStore, DispatchError,
    DispatchOutcome, MemoryCommandStore, NewCommand, Scope, SqliteCommandStore, StoredCommand,
    SyncResult,
};
pub use config::Config;
pub use db::{Database, DbPool};
pub use error::{KettleError, Result};
pub use pipeline::{
    classify, CustomCommandsHandler, ErrorCategory, ErrorReport, Message, MessageKind, Next,
    Pipeline, PipelineStage, Reply, ReplySink,
};
pub use script::{
    CancelReason, Environment, ExecutionContext, ExecutionFailure, ExecutionOutcome, LimitKind,
    LimitViolation, QuotaLimits, ScriptFailure,
};
