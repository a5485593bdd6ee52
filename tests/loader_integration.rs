//! Directory sync against a SQLite database file.

use std::fs;
use std::sync::Arc;

use tempfile::tempdir;

use kettle::{
    CommandDispatcher, CommandLoader, CommandRegistry, Database, DispatchOutcome, Environment,
    NewCommand, QuotaLimits, Scope, SqliteCommandStore,
};

const SCOPE: Scope = Scope::Guild(42);
const OWNER: i64 = 9;

async fn registry_for(db: &Database) -> Arc<CommandRegistry> {
    Arc::new(CommandRegistry::new(Arc::new(SqliteCommandStore::new(
        db.pool().clone(),
    ))))
}

#[tokio::test]
async fn test_synced_scripts_survive_reopen_and_run() {
    let dir = tempdir().unwrap();
    let scripts = dir.path().join("scripts");
    fs::create_dir(&scripts).unwrap();
    fs::write(
        scripts.join("ping.ks"),
        "// @description Replies with pong\nsay(\"pong\");\n",
    )
    .unwrap();
    fs::write(scripts.join("notes.txt"), "not a script").unwrap();
    let db_path = dir.path().join("data").join("kettle.db");

    {
        let db = Database::open(&db_path, 2).await.unwrap();
        let registry = registry_for(&db).await;
        let result = CommandLoader::new(&scripts)
            .sync(&registry, SCOPE, OWNER)
            .await
            .unwrap();
        assert_eq!(result.added, 1);
        assert!(result.errors.is_empty());
        db.close().await;
    }

    let db = Database::open(&db_path, 2).await.unwrap();
    let registry = registry_for(&db).await;
    let command = registry.resolve(SCOPE, "ping").await.unwrap().unwrap();
    assert_eq!(command.description.as_deref(), Some("Replies with pong"));
    assert_eq!(command.source_path.as_deref(), Some("ping.ks"));
    assert_eq!(command.owner_id, OWNER);

    // A second sync of an unchanged directory is a no-op.
    let result = CommandLoader::new(&scripts)
        .sync(&registry, SCOPE, OWNER)
        .await
        .unwrap();
    assert!(!result.has_changes());

    let dispatcher = CommandDispatcher::new(Arc::clone(&registry), QuotaLimits::default());
    match dispatcher
        .dispatch(SCOPE, "ping", Environment::new())
        .await
        .unwrap()
    {
        DispatchOutcome::Completed(outcome) => assert_eq!(outcome.output, ["pong"]),
        DispatchOutcome::NotFound => panic!("synced command not found"),
    }
}

#[tokio::test]
async fn test_sync_updates_removes_and_keeps_authored_commands() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path().join("kettle.db"), 2).await.unwrap();
    let registry = registry_for(&db).await;
    registry
        .create(NewCommand::new(SCOPE, "custom", "say(\"mine\");", 1))
        .await
        .unwrap();

    let scripts = dir.path().join("scripts");
    fs::create_dir(&scripts).unwrap();
    fs::write(scripts.join("roll.ks"), "say(random(1, 6));").unwrap();
    fs::write(scripts.join("echo.ks"), "say(join(args, \" \"));").unwrap();
    fs::write(scripts.join("custom.ks"), "say(\"theirs\");").unwrap();

    let loader = CommandLoader::new(&scripts);
    let result = loader.sync(&registry, SCOPE, OWNER).await.unwrap();
    assert_eq!(result.added, 2);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].0, "custom.ks");

    fs::remove_file(scripts.join("roll.ks")).unwrap();
    fs::remove_file(scripts.join("custom.ks")).unwrap();
    fs::write(scripts.join("echo.ks"), "say(upper(join(args, \" \")));").unwrap();

    let result = loader.sync(&registry, SCOPE, OWNER).await.unwrap();
    assert_eq!(result.updated, 1);
    assert_eq!(result.removed, 1);
    assert!(result.errors.is_empty());

    let names: Vec<String> = registry
        .list(SCOPE)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(names, ["custom", "echo"]);

    let custom = registry.resolve(SCOPE, "custom").await.unwrap().unwrap();
    assert_eq!(custom.source, "say(\"mine\");");
    assert!(custom.source_path.is_none());
}

#[tokio::test]
async fn test_broken_edit_keeps_previous_version() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path().join("kettle.db"), 2).await.unwrap();
    let registry = registry_for(&db).await;

    let scripts = dir.path().join("scripts");
    fs::create_dir(&scripts).unwrap();
    fs::write(scripts.join("hello.ks"), "say(\"hello\");").unwrap();

    let loader = CommandLoader::new(&scripts);
    loader.sync(&registry, SCOPE, OWNER).await.unwrap();

    fs::write(scripts.join("hello.ks"), "say(\"hello\"").unwrap();
    let result = loader.sync(&registry, SCOPE, OWNER).await.unwrap();
    assert_eq!(result.updated, 0);
    assert_eq!(result.removed, 0);
    assert_eq!(result.errors.len(), 1);

    let command = registry.resolve(SCOPE, "hello").await.unwrap().unwrap();
    assert_eq!(command.source, "say(\"hello\");");
}
