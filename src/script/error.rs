//! Failure types raised while compiling or executing a command script.
//!
//! Every failure is a plain tagged value. Callers match on the variant;
//! nothing here relies on downcasting.

use std::fmt;

use thiserror::Error;

/// The resource a quota ceiling applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitKind {
    /// Interpreted instructions (statements, expression nodes, loop iterations).
    Instructions,
    /// Current function call nesting.
    Stack,
    /// Elements inserted into arrays.
    ArrayItems,
    /// Keys inserted into objects.
    ObjectItems,
    /// Characters appended to runtime-built strings.
    StringLength,
}

impl LimitKind {
    /// All limit kinds, in configuration order.
    pub const ALL: [LimitKind; 5] = [
        LimitKind::Instructions,
        LimitKind::Stack,
        LimitKind::ArrayItems,
        LimitKind::ObjectItems,
        LimitKind::StringLength,
    ];

    /// Human label used in user-facing messages.
    pub fn label(&self) -> &'static str {
        match self {
            LimitKind::Instructions => "instructions",
            LimitKind::Stack => "function calls",
            LimitKind::ArrayItems => "array items",
            LimitKind::ObjectItems => "object items",
            LimitKind::StringLength => "string size",
        }
    }

    /// Configuration key for this limit.
    pub fn config_key(&self) -> &'static str {
        match self {
            LimitKind::Instructions => "max_instructions",
            LimitKind::Stack => "max_stack_depth",
            LimitKind::ArrayItems => "max_array_items",
            LimitKind::ObjectItems => "max_object_items",
            LimitKind::StringLength => "max_string_length",
        }
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A configured resource ceiling was crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{kind} limit exceeded")]
pub struct LimitViolation {
    /// Which ceiling was crossed.
    pub kind: LimitKind,
}

impl LimitViolation {
    pub fn new(kind: LimitKind) -> Self {
        Self { kind }
    }
}

/// A failure produced by the script itself or by the engine running it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptFailure {
    /// Raised by the author's own `throw`. The message is shown verbatim.
    #[error("{message}")]
    UserScriptError { message: String },

    /// Syntax or runtime diagnostic about the author's program.
    #[error("{message}")]
    ScriptError { message: String },

    /// Engine fault. The detail is for logs only.
    #[error("internal error: {detail}")]
    InternalError { detail: String },
}

impl ScriptFailure {
    pub fn user(message: impl Into<String>) -> Self {
        ScriptFailure::UserScriptError {
            message: message.into(),
        }
    }

    pub fn script(message: impl Into<String>) -> Self {
        ScriptFailure::ScriptError {
            message: message.into(),
        }
    }

    /// Runtime diagnostic tied to a source line.
    pub fn runtime(line: u32, message: impl fmt::Display) -> Self {
        ScriptFailure::ScriptError {
            message: format!("error on line {line}: {message}"),
        }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        ScriptFailure::InternalError {
            detail: detail.into(),
        }
    }
}

/// Why an execution was cancelled before it finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The per-execution deadline passed.
    Timeout,
    /// The host is shutting down.
    Shutdown,
    /// The caller cancelled this execution.
    Requested,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Timeout => f.write_str("timed out"),
            CancelReason::Shutdown => f.write_str("host shutting down"),
            CancelReason::Requested => f.write_str("cancelled"),
        }
    }
}

/// Everything that can end an execution early.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionFailure {
    #[error(transparent)]
    Limit(#[from] LimitViolation),

    #[error(transparent)]
    Script(#[from] ScriptFailure),

    #[error("execution {0}")]
    Cancelled(CancelReason),
}

impl ExecutionFailure {
    /// The limit kind, when this failure is a quota violation.
    pub fn limit_kind(&self) -> Option<LimitKind> {
        match self {
            ExecutionFailure::Limit(violation) => Some(violation.kind),
            _ => None,
        }
    }
}

/// Syntax error found while parsing a script.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("syntax error on line {line}: {message}")]
pub struct ParseError {
    pub line: u32,
    pub message: String,
}

impl ParseError {
    pub fn new(line: u32, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

impl From<ParseError> for ScriptFailure {
    fn from(e: ParseError) -> Self {
        ScriptFailure::script(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_labels() {
        assert_eq!(LimitKind::Instructions.label(), "instructions");
        assert_eq!(LimitKind::Stack.label(), "function calls");
        assert_eq!(LimitKind::ArrayItems.label(), "array items");
        assert_eq!(LimitKind::ObjectItems.label(), "object items");
        assert_eq!(LimitKind::StringLength.label(), "string size");
    }

    #[test]
    fn test_user_error_display_is_verbatim() {
        let failure = ScriptFailure::user("custom failure");
        assert_eq!(failure.to_string(), "custom failure");
    }

    #[test]
    fn test_runtime_error_carries_line() {
        let failure = ScriptFailure::runtime(7, "division by zero");
        assert_eq!(failure.to_string(), "error on line 7: division by zero");
        assert!(matches!(failure, ScriptFailure::ScriptError { .. }));
    }

    #[test]
    fn test_execution_failure_from_violation() {
        let failure: ExecutionFailure = LimitViolation::new(LimitKind::Stack).into();
        assert_eq!(failure.limit_kind(), Some(LimitKind::Stack));
        assert_eq!(failure.to_string(), "function calls limit exceeded");
    }

    #[test]
    fn test_parse_error_into_script_failure() {
        let failure: ScriptFailure = ParseError::new(3, "expected ';'").into();
        assert_eq!(
            failure,
            ScriptFailure::script("syntax error on line 3: expected ';'")
        );
    }
}
