//! Per-execution resource accounting.
//!
//! Instructions, array items, object items and string length are cumulative:
//! they only ever grow for the lifetime of one execution. Stack depth tracks
//! the current call nesting and is restored when a call returns.

use serde::Serialize;

use super::error::{LimitKind, LimitViolation};

/// Upper bound accepted for `max_stack_depth`.
///
/// The interpreter walks the syntax tree on the host stack, so the script
/// call depth has to stay well below what a worker thread can hold.
pub const MAX_STACK_DEPTH_CEILING: u64 = 256;

/// Resource ceilings for one execution (`None` = unbounded).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub max_instructions: Option<u64>,
    pub max_stack_depth: Option<u64>,
    pub max_array_items: Option<u64>,
    pub max_object_items: Option<u64>,
    pub max_string_length: Option<u64>,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            max_instructions: Some(100_000),
            max_stack_depth: Some(64),
            max_array_items: Some(10_000),
            max_object_items: Some(10_000),
            max_string_length: Some(100_000),
        }
    }
}

impl QuotaLimits {
    /// Limits with every ceiling removed.
    ///
    /// Only meant for trusted hosts and tests; the host recursion guard in
    /// the interpreter still applies.
    pub fn unbounded() -> Self {
        Self {
            max_instructions: None,
            max_stack_depth: None,
            max_array_items: None,
            max_object_items: None,
            max_string_length: None,
        }
    }

    /// Set a single ceiling.
    pub fn with(mut self, kind: LimitKind, max: u64) -> Self {
        *self.slot_mut(kind) = Some(max);
        self
    }

    /// Get the ceiling for a resource kind.
    pub fn get(&self, kind: LimitKind) -> Option<u64> {
        match kind {
            LimitKind::Instructions => self.max_instructions,
            LimitKind::Stack => self.max_stack_depth,
            LimitKind::ArrayItems => self.max_array_items,
            LimitKind::ObjectItems => self.max_object_items,
            LimitKind::StringLength => self.max_string_length,
        }
    }

    fn slot_mut(&mut self, kind: LimitKind) -> &mut Option<u64> {
        match kind {
            LimitKind::Instructions => &mut self.max_instructions,
            LimitKind::Stack => &mut self.max_stack_depth,
            LimitKind::ArrayItems => &mut self.max_array_items,
            LimitKind::ObjectItems => &mut self.max_object_items,
            LimitKind::StringLength => &mut self.max_string_length,
        }
    }
}

/// Snapshot of the resources an execution consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub instructions: u64,
    /// Deepest call nesting reached.
    pub peak_stack_depth: u64,
    pub array_items: u64,
    pub object_items: u64,
    pub string_length: u64,
}

/// Counts resource usage against a set of [`QuotaLimits`].
#[derive(Debug, Clone)]
pub struct QuotaTracker {
    limits: QuotaLimits,
    instructions: u64,
    array_items: u64,
    object_items: u64,
    string_length: u64,
    depth: u64,
    peak_depth: u64,
}

impl QuotaTracker {
    pub fn new(limits: QuotaLimits) -> Self {
        Self {
            limits,
            instructions: 0,
            array_items: 0,
            object_items: 0,
            string_length: 0,
            depth: 0,
            peak_depth: 0,
        }
    }

    pub fn limits(&self) -> &QuotaLimits {
        &self.limits
    }

    /// Add `amount` units of a cumulative resource.
    ///
    /// When the new total would exceed the ceiling the counter is left
    /// untouched and a violation is returned. Reaching the ceiling exactly
    /// is allowed.
    pub fn charge(&mut self, kind: LimitKind, amount: u64) -> Result<(), LimitViolation> {
        let max = self.limits.get(kind);
        let counter = match kind {
            LimitKind::Instructions => &mut self.instructions,
            LimitKind::ArrayItems => &mut self.array_items,
            LimitKind::ObjectItems => &mut self.object_items,
            LimitKind::StringLength => &mut self.string_length,
            // Depth is not cumulative; see enter_call.
            LimitKind::Stack => return Ok(()),
        };

        let next = counter.saturating_add(amount);
        if let Some(max) = max {
            if next > max {
                return Err(LimitViolation::new(kind));
            }
        }
        *counter = next;
        Ok(())
    }

    /// Units of a cumulative resource still available (`None` = unbounded).
    pub fn remaining(&self, kind: LimitKind) -> Option<u64> {
        let used = match kind {
            LimitKind::Instructions => self.instructions,
            LimitKind::ArrayItems => self.array_items,
            LimitKind::ObjectItems => self.object_items,
            LimitKind::StringLength => self.string_length,
            LimitKind::Stack => self.depth,
        };
        self.limits.get(kind).map(|max| max.saturating_sub(used))
    }

    /// Charge one interpreted instruction.
    pub fn charge_instruction(&mut self) -> Result<(), LimitViolation> {
        self.charge(LimitKind::Instructions, 1)
    }

    /// Account for a function frame about to be pushed.
    pub fn enter_call(&mut self) -> Result<(), LimitViolation> {
        let next = self.depth + 1;
        if let Some(max) = self.limits.max_stack_depth {
            if next > max {
                return Err(LimitViolation::new(LimitKind::Stack));
            }
        }
        self.depth = next;
        self.peak_depth = self.peak_depth.max(next);
        Ok(())
    }

    /// Account for a function frame that was popped.
    pub fn exit_call(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Current call nesting.
    pub fn depth(&self) -> u64 {
        self.depth
    }

    pub fn usage(&self) -> QuotaUsage {
        QuotaUsage {
            instructions: self.instructions,
            peak_stack_depth: self.peak_depth,
            array_items: self.array_items,
            object_items: self.object_items,
            string_length: self.string_length,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(kind: LimitKind, max: u64) -> QuotaLimits {
        QuotaLimits::unbounded().with(kind, max)
    }

    #[test]
    fn test_instruction_boundary_is_exclusive() {
        let mut tracker = QuotaTracker::new(limits(LimitKind::Instructions, 1000));
        for _ in 0..1000 {
            tracker.charge_instruction().unwrap();
        }
        assert_eq!(tracker.usage().instructions, 1000);

        let err = tracker.charge_instruction().unwrap_err();
        assert_eq!(err.kind, LimitKind::Instructions);
        // The failed charge leaves the counter where it was.
        assert_eq!(tracker.usage().instructions, 1000);
    }

    #[test]
    fn test_bulk_charge_does_not_partially_apply() {
        let mut tracker = QuotaTracker::new(limits(LimitKind::StringLength, 10));
        tracker.charge(LimitKind::StringLength, 8).unwrap();

        let err = tracker.charge(LimitKind::StringLength, 3).unwrap_err();
        assert_eq!(err.kind, LimitKind::StringLength);
        assert_eq!(tracker.usage().string_length, 8);

        tracker.charge(LimitKind::StringLength, 2).unwrap();
        assert_eq!(tracker.usage().string_length, 10);
        assert_eq!(tracker.remaining(LimitKind::StringLength), Some(0));
        assert_eq!(tracker.remaining(LimitKind::ArrayItems), None);
    }

    #[test]
    fn test_counters_are_independent() {
        let mut tracker = QuotaTracker::new(
            QuotaLimits::unbounded()
                .with(LimitKind::ArrayItems, 2)
                .with(LimitKind::ObjectItems, 2),
        );
        tracker.charge(LimitKind::ArrayItems, 2).unwrap();
        tracker.charge(LimitKind::ObjectItems, 2).unwrap();
        assert!(tracker.charge(LimitKind::ArrayItems, 1).is_err());
        assert!(tracker.charge(LimitKind::ObjectItems, 1).is_err());
        tracker.charge(LimitKind::StringLength, 500).unwrap();
    }

    #[test]
    fn test_stack_depth_is_restored() {
        let mut tracker = QuotaTracker::new(limits(LimitKind::Stack, 2));
        tracker.enter_call().unwrap();
        tracker.enter_call().unwrap();
        assert_eq!(tracker.enter_call().unwrap_err().kind, LimitKind::Stack);
        assert_eq!(tracker.depth(), 2);

        tracker.exit_call();
        tracker.exit_call();
        assert_eq!(tracker.depth(), 0);

        // Sequential calls never accumulate.
        for _ in 0..10 {
            tracker.enter_call().unwrap();
            tracker.exit_call();
        }
        assert_eq!(tracker.usage().peak_stack_depth, 2);
    }

    #[test]
    fn test_unbounded_never_fails() {
        let mut tracker = QuotaTracker::new(QuotaLimits::unbounded());
        tracker.charge(LimitKind::Instructions, u64::MAX).unwrap();
        tracker.charge(LimitKind::Instructions, 1).unwrap();
        assert_eq!(tracker.usage().instructions, u64::MAX);
    }

    #[test]
    fn test_default_limits_are_bounded() {
        let limits = QuotaLimits::default();
        for kind in LimitKind::ALL {
            assert!(limits.get(kind).is_some(), "{kind:?} should be bounded");
        }
        assert!(limits.max_stack_depth.unwrap() <= MAX_STACK_DEPTH_CEILING);
    }
}
