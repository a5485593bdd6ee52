//! Execution context: the per-invocation state an interpreter run works
//! against.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

use super::error::{CancelReason, ExecutionFailure, LimitKind, LimitViolation};
use super::quota::{QuotaLimits, QuotaTracker, QuotaUsage};
use super::value::{Renderer, Value};

/// The deadline is compared against the clock once per this many checkpoints.
const DEADLINE_CHECK_INTERVAL: u64 = 64;

/// A shareable cancellation switch.
///
/// Cloning shares the same flag. The interpreter observes it at every
/// instruction checkpoint.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Read-only bindings supplied by the host.
///
/// Held as JSON so the environment can cross threads; the interpreter
/// converts each binding into a frozen value when a run starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Environment {
    bindings: BTreeMap<String, serde_json::Value>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.bindings.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.bindings.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.bindings.iter()
    }
}

/// What a successful execution produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionOutcome {
    /// Lines written with `say`.
    pub output: Vec<String>,
    /// Rendered top-level `return` value, if one other than null was returned.
    pub value: Option<String>,
    pub usage: QuotaUsage,
}

impl ExecutionOutcome {
    /// Text to reply with, or `None` for a silent success.
    pub fn render(&self) -> Option<String> {
        let mut lines: Vec<&str> = self.output.iter().map(String::as_str).collect();
        if let Some(value) = &self.value {
            lines.push(value);
        }
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }
}

/// State for one script execution. Never shared or reused.
#[derive(Debug)]
pub struct ExecutionContext {
    id: Uuid,
    quota: QuotaTracker,
    cancel: CancellationFlag,
    shutdown: Option<CancellationFlag>,
    deadline: Option<Instant>,
    environment: Environment,
    output: Vec<String>,
    checkpoints: u64,
}

impl ExecutionContext {
    pub fn new(limits: QuotaLimits) -> Self {
        Self {
            id: Uuid::new_v4(),
            quota: QuotaTracker::new(limits),
            cancel: CancellationFlag::new(),
            shutdown: None,
            deadline: None,
            environment: Environment::new(),
            output: Vec::new(),
            checkpoints: 0,
        }
    }

    /// Observe a host-wide shutdown flag.
    pub fn with_shutdown(mut self, shutdown: CancellationFlag) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Abort with [`CancelReason::Timeout`] once `timeout` has elapsed.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Instant::now().checked_add(timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn set_environment(&mut self, environment: Environment) {
        self.environment = environment;
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// A handle that cancels this execution from another thread.
    pub fn cancellation(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    pub(crate) fn quota_mut(&mut self) -> &mut QuotaTracker {
        &mut self.quota
    }

    pub fn usage(&self) -> QuotaUsage {
        self.quota.usage()
    }

    /// Output written so far. Still available after a failed run.
    pub fn output(&self) -> &[String] {
        &self.output
    }

    pub(crate) fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }

    /// Observe cancellation, then charge one instruction.
    pub fn checkpoint(&mut self) -> Result<(), ExecutionFailure> {
        if self.cancel.is_cancelled() {
            return Err(ExecutionFailure::Cancelled(CancelReason::Requested));
        }
        if self.shutdown.as_ref().is_some_and(|s| s.is_cancelled()) {
            return Err(ExecutionFailure::Cancelled(CancelReason::Shutdown));
        }
        if self.checkpoints % DEADLINE_CHECK_INTERVAL == 0 {
            if let Some(deadline) = self.deadline {
                if Instant::now() >= deadline {
                    return Err(ExecutionFailure::Cancelled(CancelReason::Timeout));
                }
            }
        }
        self.checkpoints += 1;
        self.quota.charge_instruction()?;
        Ok(())
    }

    pub fn charge(&mut self, kind: LimitKind, amount: u64) -> Result<(), LimitViolation> {
        self.quota.charge(kind, amount)
    }

    /// A renderer bounded by the remaining string budget.
    pub fn renderer(&self) -> Renderer {
        Renderer::new(self.quota.remaining(LimitKind::StringLength))
    }

    /// Charge for the text a renderer built and return it.
    pub fn finish_render(&mut self, renderer: Renderer) -> Result<String, LimitViolation> {
        let (text, chars) = renderer.finish();
        self.quota.charge(LimitKind::StringLength, chars)?;
        Ok(text)
    }

    /// Render a value into a new runtime string.
    pub fn render(&mut self, value: &Value) -> Result<String, LimitViolation> {
        let mut renderer = self.renderer();
        renderer.value(value)?;
        self.finish_render(renderer)
    }

    /// Append a line to the output buffer. The caller has already charged it.
    pub(crate) fn push_output(&mut self, line: String) {
        self.output.push(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_charges_instructions() {
        let mut ctx = ExecutionContext::new(QuotaLimits::unbounded().with(LimitKind::Instructions, 3));
        ctx.checkpoint().unwrap();
        ctx.checkpoint().unwrap();
        ctx.checkpoint().unwrap();
        assert_eq!(
            ctx.checkpoint().unwrap_err().limit_kind(),
            Some(LimitKind::Instructions)
        );
        assert_eq!(ctx.usage().instructions, 3);
    }

    #[test]
    fn test_cancellation_flag() {
        let mut ctx = ExecutionContext::new(QuotaLimits::default());
        let handle = ctx.cancellation();
        ctx.checkpoint().unwrap();
        handle.cancel();
        assert_eq!(
            ctx.checkpoint().unwrap_err(),
            ExecutionFailure::Cancelled(CancelReason::Requested)
        );
    }

    #[test]
    fn test_shutdown_flag() {
        let shutdown = CancellationFlag::new();
        let mut ctx = ExecutionContext::new(QuotaLimits::default()).with_shutdown(shutdown.clone());
        ctx.checkpoint().unwrap();
        shutdown.cancel();
        assert_eq!(
            ctx.checkpoint().unwrap_err(),
            ExecutionFailure::Cancelled(CancelReason::Shutdown)
        );
    }

    #[test]
    fn test_past_deadline_times_out() {
        let mut ctx = ExecutionContext::new(QuotaLimits::default()).with_deadline(Instant::now());
        assert_eq!(
            ctx.checkpoint().unwrap_err(),
            ExecutionFailure::Cancelled(CancelReason::Timeout)
        );
    }

    #[test]
    fn test_contexts_have_distinct_ids() {
        let a = ExecutionContext::new(QuotaLimits::default());
        let b = ExecutionContext::new(QuotaLimits::default());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_render_charges_string_length() {
        let mut ctx = ExecutionContext::new(QuotaLimits::unbounded().with(LimitKind::StringLength, 5));
        assert_eq!(ctx.render(&Value::Int(1234)).unwrap(), "1234");
        assert_eq!(ctx.usage().string_length, 4);
        let err = ctx.render(&Value::Int(99)).unwrap_err();
        assert_eq!(err.kind, LimitKind::StringLength);
        assert_eq!(ctx.usage().string_length, 4);
    }

    #[test]
    fn test_outcome_render() {
        let outcome = ExecutionOutcome {
            output: vec!["hello".to_string()],
            value: Some("42".to_string()),
            usage: QuotaUsage::default(),
        };
        assert_eq!(outcome.render().as_deref(), Some("hello\n42"));

        let silent = ExecutionOutcome {
            output: vec![],
            value: None,
            usage: QuotaUsage::default(),
        };
        assert_eq!(silent.render(), None);
    }
}
