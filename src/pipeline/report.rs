//! Failure classification and the reply boundary.
//!
//! [`classify`] is the single place that decides what a user sees when a
//! command fails.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, warn};

use super::message::Message;
use crate::command::DispatchError;
use crate::script::{CancelReason, ExecutionFailure, ScriptFailure};
use crate::Result;

/// Shown for engine faults and storage errors.
pub const GENERIC_FAILURE_TEXT: &str = "Something went wrong while running this command.";

/// User-facing failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    LimitExceeded,
    UserScriptError,
    ScriptError,
    InternalError,
    Cancelled,
}

/// A classified failure, ready for a presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub category: ErrorCategory,
    /// Stable key for localized wording.
    pub resource: &'static str,
    /// Display text.
    pub text: String,
    /// Whether `text` is program text to show in a code block.
    pub code_block: bool,
}

impl ErrorReport {
    fn new(category: ErrorCategory, resource: &'static str, text: impl Into<String>) -> Self {
        Self {
            category,
            resource,
            text: text.into(),
            code_block: false,
        }
    }

    fn in_code_block(mut self) -> Self {
        self.code_block = true;
        self
    }
}

/// What a stage sends back to the chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Reply {
    /// Rendered command output.
    Output(String),
    /// A classified failure.
    Error(ErrorReport),
}

/// Presentation boundary that delivers replies.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn send(&self, message: &Message, reply: Reply) -> Result<()>;
}

/// Map a dispatch failure to what the user sees.
pub fn classify(failure: &DispatchError) -> ErrorReport {
    match failure {
        DispatchError::Execution(ExecutionFailure::Limit(violation)) => ErrorReport::new(
            ErrorCategory::LimitExceeded,
            "user_error_miscript_limit",
            format!("Your command exceeded the {} limit.", violation.kind.label()),
        ),
        DispatchError::Execution(ExecutionFailure::Script(ScriptFailure::UserScriptError {
            message,
        })) => ErrorReport::new(
            ErrorCategory::UserScriptError,
            "user_error_miscript_execute",
            message.clone(),
        )
        .in_code_block(),
        DispatchError::Execution(ExecutionFailure::Script(ScriptFailure::ScriptError {
            message,
        })) => ErrorReport::new(
            ErrorCategory::ScriptError,
            "error_miscript_execute",
            message.clone(),
        )
        .in_code_block(),
        DispatchError::Execution(ExecutionFailure::Script(ScriptFailure::InternalError {
            ..
        }))
        | DispatchError::Storage(_) => ErrorReport::new(
            ErrorCategory::InternalError,
            "error_miscript_internal",
            GENERIC_FAILURE_TEXT,
        ),
        DispatchError::Execution(ExecutionFailure::Cancelled(reason)) => {
            let text = match reason {
                CancelReason::Timeout => "Your command took too long and was stopped.",
                CancelReason::Shutdown | CancelReason::Requested => "Your command was cancelled.",
            };
            ErrorReport::new(ErrorCategory::Cancelled, "user_error_miscript_timeout", text)
        }
    }
}

/// Log a failure at the level its category calls for.
///
/// Engine faults and storage errors carry detail that never reaches the
/// user, so it is logged in full here.
pub fn log_failure(failure: &DispatchError, command: &str) {
    match failure {
        DispatchError::Execution(ExecutionFailure::Script(ScriptFailure::InternalError {
            detail,
        })) => {
            error!(command, detail = %detail, "Command failed with an internal error");
        }
        DispatchError::Storage(e) => {
            error!(command, error = %e, "Failed to load command");
        }
        DispatchError::Execution(ExecutionFailure::Limit(violation)) => {
            warn!(command, limit = %violation.kind, "Command exceeded a limit");
        }
        DispatchError::Execution(ExecutionFailure::Cancelled(reason)) => {
            warn!(command, reason = %reason, "Command was cancelled");
        }
        DispatchError::Execution(ExecutionFailure::Script(failure)) => {
            debug!(command, error = %failure, "Command raised an error");
        }
    }
}
