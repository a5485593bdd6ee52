//! Message pipeline and the custom commands stage.
//!
//! The host runs every incoming message through a [`Pipeline`]. The
//! [`CustomCommandsHandler`] stage runs stored commands and is the only
//! place where execution failures are classified for display.

pub mod handler;
pub mod message;
pub mod report;
pub mod stage;

pub use handler::{extract_command_name, CustomCommandsHandler};
pub use message::{Author, GuildInfo, Message, MessageKind};
pub use report::{
    classify, log_failure, ErrorCategory, ErrorReport, Reply, ReplySink, GENERIC_FAILURE_TEXT,
};
pub use stage::{Next, Pipeline, PipelineStage};
