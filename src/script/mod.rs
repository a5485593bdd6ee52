//! Sandboxed script interpreter for custom commands.
//!
//! Scripts are untrusted. Every run gets a fresh [`ExecutionContext`] whose
//! quota tracker bounds instructions, call depth, array and object growth
//! and string size. Running out of any of them ends the run with a
//! [`LimitViolation`]; the host process is never affected.

pub mod ast;
pub mod builtins;
pub mod context;
pub mod error;
pub mod interpreter;
pub mod lexer;
pub mod parser;
pub mod quota;
pub mod value;

pub use ast::Program;
pub use context::{CancellationFlag, Environment, ExecutionContext, ExecutionOutcome};
pub use error::{
    CancelReason, ExecutionFailure, LimitKind, LimitViolation, ParseError, ScriptFailure,
};
pub use interpreter::{run, HOST_DEPTH_LIMIT};
pub use parser::{parse, MAX_EXPRESSION_DEPTH, MAX_NESTING, MAX_SOURCE_LENGTH};
pub use quota::{QuotaLimits, QuotaTracker, QuotaUsage, MAX_STACK_DEPTH_CEILING};
