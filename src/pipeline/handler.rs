//! Pipeline stage that runs custom commands.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use super::message::Message;
use super::report::{classify, log_failure, Reply, ReplySink};
use super::stage::{Next, PipelineStage};
use crate::command::{CommandDispatcher, DispatchOutcome};

/// Name of the command invoked by `content`, given the prefix length.
///
/// The name runs from the end of the prefix to the next whitespace
/// character, or to the end of the text.
pub fn extract_command_name(content: &str, prefix_len: usize) -> &str {
    let rest = content.get(prefix_len..).unwrap_or("");
    match rest.find(char::is_whitespace) {
        Some(end) => &rest[..end],
        None => rest,
    }
}

/// Intercepts messages that invoke a stored command.
///
/// For every message exactly one of these happens: a reply is sent (or
/// the command succeeds silently), or the message goes to the next stage.
pub struct CustomCommandsHandler {
    dispatcher: Arc<CommandDispatcher>,
    sink: Arc<dyn ReplySink>,
    /// Longest first, so `!!` wins over `!`.
    prefixes: Vec<String>,
}

impl CustomCommandsHandler {
    pub fn new(
        dispatcher: Arc<CommandDispatcher>,
        sink: Arc<dyn ReplySink>,
        prefixes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let mut prefixes: Vec<String> = prefixes
            .into_iter()
            .map(Into::into)
            .filter(|p: &String| !p.is_empty())
            .collect();
        prefixes.sort_by(|a, b| b.len().cmp(&a.len()));
        Self {
            dispatcher,
            sink,
            prefixes,
        }
    }

    fn matched_prefix(&self, content: &str) -> Option<&str> {
        self.prefixes
            .iter()
            .map(String::as_str)
            .find(|prefix| content.starts_with(prefix))
    }

    async fn send(&self, message: &Message, reply: Reply) {
        if let Err(e) = self.sink.send(message, reply).await {
            error!(message = message.id, error = %e, "Failed to send reply");
        }
    }
}

#[async_trait]
impl PipelineStage for CustomCommandsHandler {
    async fn handle(&self, message: &Message, next: Next<'_>) {
        if !message.is_user_message() {
            next.run(message).await;
            return;
        }

        let Some(prefix) = self.matched_prefix(&message.content) else {
            next.run(message).await;
            return;
        };

        let name = extract_command_name(&message.content, prefix.len());
        if name.is_empty() {
            next.run(message).await;
            return;
        }

        let args: Vec<&str> = message.content[prefix.len() + name.len()..]
            .split_whitespace()
            .collect();
        let environment = message.to_environment(&args);

        match self
            .dispatcher
            .dispatch(message.scope(), name, environment)
            .await
        {
            Ok(DispatchOutcome::Completed(outcome)) => {
                debug!(command = name, usage = ?outcome.usage, "Command completed");
                if let Some(text) = outcome.render() {
                    self.send(message, Reply::Output(text)).await;
                }
            }
            Ok(DispatchOutcome::NotFound) => next.run(message).await,
            Err(failure) => {
                log_failure(&failure, name);
                self.send(message, Reply::Error(classify(&failure))).await;
            }
        }
    }
}
