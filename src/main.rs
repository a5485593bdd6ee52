use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

use kettle::pipeline::{Author, Message, Next, PipelineStage, Reply, ReplySink};
use kettle::{
    CommandDispatcher, CommandLoader, CommandRegistry, Config, CustomCommandsHandler, Database,
    Pipeline, Scope, SqliteCommandStore,
};

/// User id messages typed on the console are attributed to.
const CONSOLE_USER_ID: i64 = 1;

/// Prints replies to stdout.
struct ConsoleSink;

#[async_trait]
impl ReplySink for ConsoleSink {
    async fn send(&self, _message: &Message, reply: Reply) -> kettle::Result<()> {
        match reply {
            Reply::Output(text) => println!("{text}"),
            Reply::Error(report) if report.code_block => {
                println!("[{}]\n```\n{}\n```", report.resource, report.text)
            }
            Reply::Error(report) => println!("[{}] {}", report.resource, report.text),
        }
        Ok(())
    }
}

/// Last stage: messages nobody handled end here.
struct FallbackStage;

#[async_trait]
impl PipelineStage for FallbackStage {
    async fn handle(&self, message: &Message, _next: Next<'_>) {
        debug!(message = message.id, "No stage handled the message");
    }
}

#[tokio::main]
async fn main() {
    // Load configuration
    let config = match Config::load_with_env("config.toml") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config.toml: {e}");
            eprintln!("Using default configuration.");
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };

    // Initialize logging
    if let Err(e) = kettle::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        // Fall back to console-only logging
        kettle::logging::init_console_only(&config.logging.level);
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        std::process::exit(1);
    }

    if let Err(e) = run(config).await {
        error!("kettle stopped with an error: {e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> kettle::Result<()> {
    info!("kettle - custom chat command runtime");

    let db = Database::open(&config.database.path, config.database.max_connections).await?;
    let store = Arc::new(SqliteCommandStore::new(db.pool().clone()));
    let registry = Arc::new(CommandRegistry::new(store));

    let seed_guild = config.commands.seed_guild_id;
    if let Some(dir) = &config.commands.scripts_dir {
        let result = CommandLoader::new(dir)
            .sync(&registry, Scope::Guild(seed_guild), CONSOLE_USER_ID)
            .await?;
        info!(
            "Synced scripts from {}: {} added, {} updated, {} removed",
            dir, result.added, result.updated, result.removed
        );
        if !result.errors.is_empty() {
            warn!("{} script(s) could not be loaded", result.errors.len());
        }
    }

    let mut dispatcher =
        CommandDispatcher::new(Arc::clone(&registry), config.limits.to_quota_limits())
            .with_max_concurrent(config.commands.max_concurrent);
    if let Some(timeout) = config.commands.timeout() {
        dispatcher = dispatcher.with_timeout(timeout);
    }
    let dispatcher = Arc::new(dispatcher);

    let handler = CustomCommandsHandler::new(
        Arc::clone(&dispatcher),
        Arc::new(ConsoleSink),
        config.commands.prefixes.clone(),
    );
    let pipeline = Pipeline::new()
        .with_stage(Arc::new(handler))
        .with_stage(Arc::new(FallbackStage));

    let commands = registry.list(Scope::Guild(seed_guild)).await?;
    info!(
        "{} command(s) available; type a message, Ctrl-D to quit",
        commands.len()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut next_id: i64 = 1;
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        let message = Message::new(next_id, line, Author::new(CONSOLE_USER_ID, "console"))
            .in_guild(seed_guild, "console")
            .in_channel(1);
        next_id += 1;
        pipeline.run(&message).await;
    }

    info!("Shutting down");
    dispatcher.shutdown();
    db.close().await;
    Ok(())
}
