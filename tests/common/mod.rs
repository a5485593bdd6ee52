//! Test helpers for integration tests.
//!
//! Provides TestHost, a pipeline wired to a SQLite command store with a
//! reply collector and a pass-through counter behind the commands stage.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use kettle::pipeline::{Author, Message, Next, PipelineStage, Reply, ReplySink};
use kettle::{
    CommandDispatcher, CommandRegistry, CustomCommandsHandler, Database, NewCommand, Pipeline,
    QuotaLimits, Scope, SqliteCommandStore, StoredCommand,
};

/// Guild every test message is posted in.
pub const GUILD_ID: i64 = 100;

/// Author of test messages and owner of test commands.
pub const USER_ID: i64 = 7;

/// Collects every reply sent.
#[derive(Default)]
pub struct CollectingSink {
    replies: Mutex<Vec<Reply>>,
}

impl CollectingSink {
    pub fn replies(&self) -> Vec<Reply> {
        self.replies.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReplySink for CollectingSink {
    async fn send(&self, _message: &Message, reply: Reply) -> kettle::Result<()> {
        self.replies.lock().unwrap().push(reply);
        Ok(())
    }
}

/// Final stage counting the messages that reached it.
#[derive(Default)]
pub struct PassThroughCounter {
    calls: Mutex<usize>,
}

impl PassThroughCounter {
    pub fn count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl PipelineStage for PassThroughCounter {
    async fn handle(&self, _message: &Message, _next: Next<'_>) {
        *self.calls.lock().unwrap() += 1;
    }
}

/// A full pipeline over an in-memory SQLite database.
pub struct TestHost {
    pub db: Database,
    pub registry: Arc<CommandRegistry>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub pipeline: Pipeline,
    pub sink: Arc<CollectingSink>,
    pub passed: Arc<PassThroughCounter>,
}

impl TestHost {
    /// Create a host with the given limits and `!` as the only prefix.
    pub async fn new(limits: QuotaLimits) -> Self {
        let db = Database::open_in_memory().await.unwrap();
        let store = Arc::new(SqliteCommandStore::new(db.pool().clone()));
        let registry = Arc::new(CommandRegistry::new(store));
        let dispatcher = Arc::new(CommandDispatcher::new(Arc::clone(&registry), limits));
        let sink = Arc::new(CollectingSink::default());
        let passed = Arc::new(PassThroughCounter::default());

        let handler = CustomCommandsHandler::new(Arc::clone(&dispatcher), sink.clone(), ["!"]);
        let pipeline = Pipeline::new()
            .with_stage(Arc::new(handler))
            .with_stage(passed.clone());

        Self {
            db,
            registry,
            dispatcher,
            pipeline,
            sink,
            passed,
        }
    }

    /// Register a command in the test guild.
    pub async fn add_command(&self, name: &str, source: &str) -> StoredCommand {
        self.registry
            .create(NewCommand::new(Scope::Guild(GUILD_ID), name, source, USER_ID))
            .await
            .unwrap()
    }

    /// Post a message in the test guild and run it through the pipeline.
    pub async fn send(&self, content: &str) {
        self.pipeline.run(&guild_message(content)).await;
    }

    pub fn replies(&self) -> Vec<Reply> {
        self.sink.replies()
    }

    pub fn passed(&self) -> usize {
        self.passed.count()
    }
}

/// A normal message from the test user in the test guild.
pub fn guild_message(content: &str) -> Message {
    Message::new(1, content, Author::new(USER_ID, "tester"))
        .in_guild(GUILD_ID, "test guild")
        .in_channel(5)
}
