//! Command dispatcher: resolves a command and runs it under a fresh
//! execution context.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, info_span, warn};

use super::registry::CommandRegistry;
use super::types::{Scope, StoredCommand};
use crate::script::{
    self, CancelReason, CancellationFlag, Environment, ExecutionContext, ExecutionFailure,
    ExecutionOutcome, QuotaLimits, ScriptFailure,
};
use crate::KettleError;

/// Stack size of the thread a script runs on.
///
/// Large enough for the interpreter's own recursion guard to trip before
/// the host stack runs out.
pub const EXECUTION_STACK_SIZE: usize = 64 * 1024 * 1024;

/// Executions allowed to run at once unless configured otherwise.
pub const DEFAULT_MAX_CONCURRENT: usize = 16;

/// Result of dispatching a command name.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The command ran to completion.
    Completed(ExecutionOutcome),
    /// No command with this name exists in the scope.
    NotFound,
}

/// Why a dispatch failed.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The script failed, hit a limit or was cancelled.
    #[error(transparent)]
    Execution(#[from] ExecutionFailure),

    /// The command could not be loaded.
    #[error(transparent)]
    Storage(#[from] KettleError),
}

/// Cancels an execution when the task waiting on it goes away.
struct CancelOnDrop {
    flag: CancellationFlag,
    armed: bool,
}

impl CancelOnDrop {
    fn new(flag: CancellationFlag) -> Self {
        Self { flag, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.flag.cancel();
        }
    }
}

/// Runs stored commands.
///
/// At most `max_concurrent` executions run at once; the rest wait for a
/// slot. Failures are returned to the caller untouched; classification
/// happens at the pipeline boundary.
pub struct CommandDispatcher {
    registry: Arc<CommandRegistry>,
    limits: QuotaLimits,
    timeout: Option<Duration>,
    shutdown: CancellationFlag,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

impl CommandDispatcher {
    pub fn new(registry: Arc<CommandRegistry>, limits: QuotaLimits) -> Self {
        Self {
            registry,
            limits,
            timeout: None,
            shutdown: CancellationFlag::new(),
            permits: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT)),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }

    /// Abort executions that run longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Allow at most `max_concurrent` executions at once (minimum 1).
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        self.permits = Arc::new(Semaphore::new(max_concurrent));
        self.max_concurrent = max_concurrent;
        self
    }

    /// Get the maximum number of concurrent executions.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Get the number of executions currently running.
    pub fn active_executions(&self) -> usize {
        self.max_concurrent
            .saturating_sub(self.permits.available_permits())
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn limits(&self) -> &QuotaLimits {
        &self.limits
    }

    /// Look up a command by exact name.
    pub async fn resolve(
        &self,
        scope: Scope,
        name: &str,
    ) -> crate::Result<Option<StoredCommand>> {
        self.registry.resolve(scope, name).await
    }

    /// A fresh context with the configured limits, timeout and the host
    /// shutdown flag.
    pub fn new_context(&self) -> ExecutionContext {
        let context = ExecutionContext::new(self.limits).with_shutdown(self.shutdown.clone());
        match self.timeout {
            Some(timeout) => context.with_timeout(timeout),
            None => context,
        }
    }

    /// Run `command` under `context`.
    ///
    /// Waits for an execution slot, then runs the interpreter on its own
    /// thread so a deep script never touches a runtime worker's stack; the
    /// calling task only waits on a channel. Dropping the returned future
    /// cancels the run. Take [`ExecutionContext::cancellation`] before
    /// calling to cancel it from elsewhere.
    pub async fn execute(
        &self,
        mut context: ExecutionContext,
        command: &StoredCommand,
        environment: Environment,
    ) -> Result<ExecutionOutcome, ExecutionFailure> {
        let mut guard = CancelOnDrop::new(context.cancellation());
        let program = self.registry.compile(command)?;
        context.set_environment(environment);

        let span = info_span!(
            "execute",
            id = %context.id(),
            command = %command.name,
            scope = %command.scope,
        );

        // The semaphore is closed on shutdown.
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return Err(ExecutionFailure::Cancelled(CancelReason::Shutdown)),
        };

        let (tx, rx) = oneshot::channel();
        let worker_span = span.clone();
        std::thread::Builder::new()
            .name("kettle-exec".to_string())
            .stack_size(EXECUTION_STACK_SIZE)
            .spawn(move || {
                let _permit = permit;
                let _entered = worker_span.enter();
                let result = script::run(&program, &mut context);
                match &result {
                    Ok(outcome) => debug!(usage = ?outcome.usage, "Execution finished"),
                    Err(failure) => debug!(usage = ?context.usage(), %failure, "Execution failed"),
                }
                // The receiver is gone only if the dispatching task was dropped.
                let _ = tx.send(result);
            })
            .map_err(|e| ScriptFailure::internal(format!("failed to spawn execution thread: {e}")))?;

        let result = rx.await;
        guard.disarm();
        match result {
            Ok(result) => result,
            Err(_) => {
                let _entered = span.enter();
                warn!("Execution thread exited without a result");
                Err(ScriptFailure::internal("execution thread exited without a result").into())
            }
        }
    }

    /// Resolve `name` in `scope` and run it with `environment`.
    pub async fn dispatch(
        &self,
        scope: Scope,
        name: &str,
        environment: Environment,
    ) -> Result<DispatchOutcome, DispatchError> {
        let Some(command) = self.resolve(scope, name).await? else {
            debug!(scope = %scope, name, "No such command");
            return Ok(DispatchOutcome::NotFound);
        };

        let context = self.new_context();
        let outcome = self.execute(context, &command, environment).await?;
        Ok(DispatchOutcome::Completed(outcome))
    }

    /// Signal every in-flight and future execution to stop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.permits.close();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::store::MemoryCommandStore;
    use crate::command::types::NewCommand;
    use crate::script::LimitKind;

    async fn dispatcher_with(commands: &[(&str, &str)], limits: QuotaLimits) -> CommandDispatcher {
        let registry = Arc::new(CommandRegistry::new(Arc::new(MemoryCommandStore::new())));
        for (name, source) in commands {
            registry
                .create(NewCommand::new(Scope::Guild(1), *name, *source, 1))
                .await
                .unwrap();
        }
        CommandDispatcher::new(registry, limits)
    }

    #[tokio::test]
    async fn test_dispatch_not_found() {
        let dispatcher = dispatcher_with(&[], QuotaLimits::default()).await;
        let outcome = dispatcher
            .dispatch(Scope::Guild(1), "missing", Environment::new())
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::NotFound));
    }

    #[tokio::test]
    async fn test_dispatch_completed() {
        let dispatcher = dispatcher_with(
            &[("greet", "say(\"hello \" + user.name);")],
            QuotaLimits::default(),
        )
        .await;
        let environment = Environment::new().with("user", serde_json::json!({ "name": "ada" }));

        let outcome = dispatcher
            .dispatch(Scope::Guild(1), "greet", environment)
            .await
            .unwrap();
        match outcome {
            DispatchOutcome::Completed(outcome) => {
                assert_eq!(outcome.output, vec!["hello ada".to_string()]);
            }
            DispatchOutcome::NotFound => panic!("expected completion"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_propagates_limit() {
        let dispatcher = dispatcher_with(
            &[("spin", "while true { }")],
            QuotaLimits::default().with(LimitKind::Instructions, 1000),
        )
        .await;
        let err = dispatcher
            .dispatch(Scope::Guild(1), "spin", Environment::new())
            .await
            .unwrap_err();
        match err {
            DispatchError::Execution(failure) => {
                assert_eq!(failure.limit_kind(), Some(LimitKind::Instructions));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_propagates_user_error() {
        let dispatcher =
            dispatcher_with(&[("fail", "throw \"custom failure\";")], QuotaLimits::default()).await;
        let err = dispatcher
            .dispatch(Scope::Guild(1), "fail", Environment::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Execution(ExecutionFailure::Script(ScriptFailure::UserScriptError { ref message }))
                if message == "custom failure"
        ));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_executions() {
        let dispatcher = dispatcher_with(
            &[("spin", "while true { }")],
            QuotaLimits::unbounded(),
        )
        .await;
        dispatcher.shutdown();
        assert!(dispatcher.is_shutting_down());

        let err = dispatcher
            .dispatch(Scope::Guild(1), "spin", Environment::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Execution(ExecutionFailure::Cancelled(CancelReason::Shutdown))
        ));
    }

    #[tokio::test]
    async fn test_timeout_cancels_execution() {
        let dispatcher = dispatcher_with(&[("spin", "while true { }")], QuotaLimits::unbounded())
            .await
            .with_timeout(Duration::from_millis(20));
        let err = dispatcher
            .dispatch(Scope::Guild(1), "spin", Environment::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Execution(ExecutionFailure::Cancelled(CancelReason::Timeout))
        ));
    }

    #[tokio::test]
    async fn test_execute_with_requested_cancellation() {
        let dispatcher = dispatcher_with(&[("spin", "while true { }")], QuotaLimits::unbounded()).await;
        let command = dispatcher
            .resolve(Scope::Guild(1), "spin")
            .await
            .unwrap()
            .unwrap();

        let context = dispatcher.new_context();
        let cancel = context.cancellation();
        cancel.cancel();

        let err = dispatcher
            .execute(context, &command, Environment::new())
            .await
            .unwrap_err();
        assert_eq!(err, ExecutionFailure::Cancelled(CancelReason::Requested));
    }

    #[tokio::test]
    async fn test_deep_recursion_hits_stack_limit() {
        let dispatcher = dispatcher_with(
            &[("deep", "fn f(n) { return f(n + 1); } f(0);")],
            QuotaLimits::default(),
        )
        .await;
        let err = dispatcher
            .dispatch(Scope::Guild(1), "deep", Environment::new())
            .await
            .unwrap_err();
        match err {
            DispatchError::Execution(failure) => {
                assert_eq!(failure.limit_kind(), Some(LimitKind::Stack));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_executions_have_independent_counters() {
        let dispatcher = Arc::new(
            dispatcher_with(
                &[("count", "let i = 0; while i < 50 { i = i + 1; } return i;")],
                QuotaLimits::default(),
            )
            .await,
        );

        let mut handles = Vec::new();
        for _ in 0..4 {
            let dispatcher = Arc::clone(&dispatcher);
            handles.push(tokio::spawn(async move {
                match dispatcher
                    .dispatch(Scope::Guild(1), "count", Environment::new())
                    .await
                    .unwrap()
                {
                    DispatchOutcome::Completed(outcome) => outcome,
                    DispatchOutcome::NotFound => panic!("expected completion"),
                }
            }));
        }

        let mut usages = Vec::new();
        for handle in handles {
            let outcome = handle.await.unwrap();
            assert_eq!(outcome.value.as_deref(), Some("50"));
            usages.push(outcome.usage.instructions);
        }
        assert!(usages.windows(2).all(|w| w[0] == w[1]));
    }

    async fn wait_for_active(dispatcher: &CommandDispatcher, active: usize) {
        for _ in 0..500 {
            if dispatcher.active_executions() == active {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {active} active executions");
    }

    #[tokio::test]
    async fn test_executions_beyond_cap_wait_for_a_slot() {
        let dispatcher = Arc::new(
            dispatcher_with(
                &[("spin", "while true { }"), ("one", "return 1;")],
                QuotaLimits::unbounded(),
            )
            .await
            .with_max_concurrent(1),
        );
        assert_eq!(dispatcher.max_concurrent(), 1);
        let spin = dispatcher
            .resolve(Scope::Guild(1), "spin")
            .await
            .unwrap()
            .unwrap();

        let context = dispatcher.new_context();
        let cancel = context.cancellation();
        let first = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.execute(context, &spin, Environment::new()).await })
        };
        wait_for_active(&dispatcher, 1).await;

        let second = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .dispatch(Scope::Guild(1), "one", Environment::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        cancel.cancel();
        assert_eq!(
            first.await.unwrap().unwrap_err(),
            ExecutionFailure::Cancelled(CancelReason::Requested)
        );
        match second.await.unwrap().unwrap() {
            DispatchOutcome::Completed(outcome) => assert_eq!(outcome.value.as_deref(), Some("1")),
            DispatchOutcome::NotFound => panic!("expected completion"),
        }
        wait_for_active(&dispatcher, 0).await;
    }

    #[tokio::test]
    async fn test_dropping_execution_cancels_it() {
        let dispatcher = dispatcher_with(
            &[("spin", "while true { }"), ("one", "return 1;")],
            QuotaLimits::unbounded(),
        )
        .await
        .with_max_concurrent(1);
        let spin = dispatcher
            .resolve(Scope::Guild(1), "spin")
            .await
            .unwrap()
            .unwrap();

        let context = dispatcher.new_context();
        let cancel = context.cancellation();
        let result = tokio::time::timeout(
            Duration::from_millis(30),
            dispatcher.execute(context, &spin, Environment::new()),
        )
        .await;
        assert!(result.is_err());
        assert!(cancel.is_cancelled());

        // The only slot is released once the cancelled run stops.
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            dispatcher.dispatch(Scope::Guild(1), "one", Environment::new()),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiting_executions() {
        let dispatcher = dispatcher_with(&[("one", "return 1;")], QuotaLimits::default())
            .await
            .with_max_concurrent(1);
        let permit = Arc::clone(&dispatcher.permits).acquire_owned().await.unwrap();

        dispatcher.shutdown();
        let err = dispatcher
            .dispatch(Scope::Guild(1), "one", Environment::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Execution(ExecutionFailure::Cancelled(CancelReason::Shutdown))
        ));
        drop(permit);
    }
}
