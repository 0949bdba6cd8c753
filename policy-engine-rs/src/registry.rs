//! Ordered check registry with fail-closed evaluation.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use error_handling::ServiceError;
use shared_types::{PolicyCheckResult, Severity, Task};
use tracing::{debug, warn};

use crate::{CheckError, PolicyError};

/// Inputs every check may consult besides its subject.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationContext {
    pub task_id: String,
    pub iteration: u32,
    pub requested_units: Option<usize>,
    /// Cost the task may still spend.
    pub remaining_budget: f64,
}

impl EvaluationContext {
    /// Context for `task`, bounded by the task budget or else `cost_ceiling`.
    pub fn for_task(task: &Task, cost_ceiling: f64) -> Self {
        Self {
            task_id: task.task_id.clone(),
            iteration: 0,
            requested_units: task.requested_units,
            remaining_budget: task.cost_budget.unwrap_or(cost_ceiling).min(cost_ceiling),
        }
    }

    pub fn at_iteration(mut self, iteration: u32) -> Self {
        self.iteration = iteration;
        self
    }

    /// Charges what earlier attempts already spent against the budget.
    pub fn with_spent(mut self, spent: f64) -> Self {
        self.remaining_budget = (self.remaining_budget - spent).max(0.0);
        self
    }
}

/// A single-capability policy check over subjects of type `S`.
///
/// Implementations must be pure: the same `(subject, context)` always
/// produces the same result.
pub trait PolicyCheck<S: ?Sized>: Send + Sync {
    fn principle_id(&self) -> &str;

    fn evaluate(&self, subject: &S, ctx: &EvaluationContext) -> Result<PolicyCheckResult, CheckError>;
}

struct Registered<S: ?Sized> {
    priority: i32,
    check: Arc<dyn PolicyCheck<S>>,
}

pub struct PolicyRegistry<S: ?Sized> {
    checks: Vec<Registered<S>>,
}

impl<S: ?Sized> Default for PolicyRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ?Sized> fmt::Debug for PolicyRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyRegistry")
            .field("principles", &self.principle_ids())
            .finish()
    }
}

impl<S: ?Sized> PolicyRegistry<S> {
    pub fn new() -> Self {
        Self { checks: Vec::new() }
    }

    /// Registers a check. Higher priorities run first; equal priorities keep
    /// registration order.
    pub fn register(&mut self, check: Arc<dyn PolicyCheck<S>>, priority: i32) -> Result<(), PolicyError> {
        let id = check.principle_id().to_string();
        if self.checks.iter().any(|r| r.check.principle_id() == id) {
            return Err(PolicyError::DuplicatePrinciple(id));
        }
        let position = self
            .checks
            .iter()
            .position(|r| r.priority < priority)
            .unwrap_or(self.checks.len());
        self.checks.insert(position, Registered { priority, check });
        debug!(principle = %id, priority, "policy check registered");
        Ok(())
    }

    pub fn principle_ids(&self) -> Vec<&str> {
        self.checks.iter().map(|r| r.check.principle_id()).collect()
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Runs every check in order. A CRITICAL failure stops evaluation; a
    /// check that errors or panics is recorded as a CRITICAL failure, which
    /// stays retryable only when the error is transient (a resolver or fact
    /// source outage).
    pub fn evaluate(&self, subject: &S, ctx: &EvaluationContext) -> Vec<PolicyCheckResult> {
        let mut results = Vec::with_capacity(self.checks.len());

        for registered in &self.checks {
            let check = &registered.check;
            let principle = check.principle_id();

            let result = match catch_unwind(AssertUnwindSafe(|| check.evaluate(subject, ctx))) {
                Ok(Ok(result)) => result,
                Ok(Err(err)) => {
                    fail_closed(principle, &ctx.task_id, err.to_string(), err.is_transient())
                }
                Err(payload) => fail_closed(
                    principle,
                    &ctx.task_id,
                    format!("check panicked: {}", panic_message(payload.as_ref())),
                    false,
                ),
            };

            let critical = result.is_critical_fail();
            results.push(result);
            if critical {
                debug!(
                    task_id = %ctx.task_id,
                    principle = %principle,
                    skipped = self.checks.len() - results.len(),
                    "critical failure short-circuits remaining checks"
                );
                break;
            }
        }

        results
    }
}

fn fail_closed(principle: &str, task_id: &str, reason: String, transient: bool) -> PolicyCheckResult {
    warn!(task_id = %task_id, principle = %principle, reason = %reason, "policy check failed internally");
    metrics::increment_counter!(
        "constitution_check_internal_failures_total",
        "principle" => principle.to_string()
    );
    let result = PolicyCheckResult::fail(
        principle,
        Severity::Critical,
        format!("internal check failure: {reason}"),
    );
    if transient {
        result
    } else {
        result.non_retryable()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::CheckVerdict;

    struct Fixed {
        id: &'static str,
        result: Result<PolicyCheckResult, CheckError>,
    }

    impl PolicyCheck<str> for Fixed {
        fn principle_id(&self) -> &str {
            self.id
        }

        fn evaluate(&self, _subject: &str, _ctx: &EvaluationContext) -> Result<PolicyCheckResult, CheckError> {
            self.result.clone()
        }
    }

    struct Panicking;

    impl PolicyCheck<str> for Panicking {
        fn principle_id(&self) -> &str {
            "panicky"
        }

        fn evaluate(&self, _subject: &str, _ctx: &EvaluationContext) -> Result<PolicyCheckResult, CheckError> {
            panic!("boom")
        }
    }

    fn pass(id: &'static str) -> Arc<Fixed> {
        Arc::new(Fixed {
            id,
            result: Ok(PolicyCheckResult::pass(id)),
        })
    }

    fn fail(id: &'static str, severity: Severity) -> Arc<Fixed> {
        Arc::new(Fixed {
            id,
            result: Ok(PolicyCheckResult::fail(id, severity, "violated")),
        })
    }

    fn ctx() -> EvaluationContext {
        EvaluationContext::for_task(&Task::new("x").with_id("t-1"), 10.0)
    }

    #[test]
    fn orders_by_priority_then_registration() {
        let mut registry = PolicyRegistry::<str>::new();
        registry.register(pass("low"), 1).unwrap();
        registry.register(pass("high"), 10).unwrap();
        registry.register(pass("mid-a"), 5).unwrap();
        registry.register(pass("mid-b"), 5).unwrap();
        assert_eq!(registry.principle_ids(), vec!["high", "mid-a", "mid-b", "low"]);

        let ids: Vec<String> = registry
            .evaluate("artifact", &ctx())
            .into_iter()
            .map(|r| r.principle_id)
            .collect();
        assert_eq!(ids, vec!["high", "mid-a", "mid-b", "low"]);
    }

    #[test]
    fn duplicate_principle_is_rejected() {
        let mut registry = PolicyRegistry::<str>::new();
        registry.register(pass("scope"), 1).unwrap();
        assert!(matches!(
            registry.register(pass("scope"), 2),
            Err(PolicyError::DuplicatePrinciple(id)) if id == "scope"
        ));
    }

    #[test]
    fn critical_failure_short_circuits() {
        let mut registry = PolicyRegistry::<str>::new();
        registry.register(fail("first", Severity::Medium), 3).unwrap();
        registry.register(fail("second", Severity::Critical), 2).unwrap();
        registry.register(pass("third"), 1).unwrap();

        let results = registry.evaluate("artifact", &ctx());
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].verdict, CheckVerdict::Fail);
        assert!(results[1].is_critical_fail());
    }

    #[test]
    fn non_critical_failures_are_aggregated() {
        let mut registry = PolicyRegistry::<str>::new();
        registry.register(fail("a", Severity::High), 2).unwrap();
        registry.register(fail("b", Severity::Low), 1).unwrap();
        let results = registry.evaluate("artifact", &ctx());
        assert_eq!(results.iter().filter(|r| r.is_fail()).count(), 2);
    }

    #[test]
    fn erroring_check_fails_closed() {
        let mut registry = PolicyRegistry::<str>::new();
        registry
            .register(
                Arc::new(Fixed {
                    id: "external_reference",
                    result: Err(CheckError::Resolver("index offline".to_string())),
                }),
                2,
            )
            .unwrap();
        registry.register(pass("after"), 1).unwrap();

        let results = registry.evaluate("artifact", &ctx());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].principle_id, "external_reference");
        assert!(results[0].is_critical_fail());
        // An outage may clear before the next attempt.
        assert!(results[0].retryable);
        assert!(results[0].message.contains("index offline"));
    }

    #[test]
    fn internal_error_is_not_retryable() {
        let mut registry = PolicyRegistry::<str>::new();
        registry
            .register(
                Arc::new(Fixed {
                    id: "claim_verification",
                    result: Err(CheckError::Internal("bad pattern".to_string())),
                }),
                1,
            )
            .unwrap();
        let results = registry.evaluate("artifact", &ctx());
        assert!(results[0].is_critical_fail());
        assert!(!results[0].retryable);
    }

    #[test]
    fn panicking_check_fails_closed() {
        let mut registry = PolicyRegistry::<str>::new();
        registry.register(Arc::new(Panicking), 1).unwrap();
        let results = registry.evaluate("artifact", &ctx());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].principle_id, "panicky");
        assert!(results[0].is_critical_fail());
        assert!(!results[0].retryable);
        assert!(results[0].message.contains("boom"));
    }

    #[test]
    fn evaluation_is_repeatable() {
        let mut registry = PolicyRegistry::<str>::new();
        registry.register(fail("a", Severity::High), 2).unwrap();
        registry.register(pass("b"), 1).unwrap();
        let first = registry.evaluate("artifact", &ctx());
        let second = registry.evaluate("artifact", &ctx());
        assert_eq!(first, second);
    }

    #[test]
    fn budget_is_capped_by_ceiling() {
        let task = Task::new("x").with_cost_budget(50.0);
        assert_eq!(EvaluationContext::for_task(&task, 10.0).remaining_budget, 10.0);
        let task = Task::new("x").with_cost_budget(2.5);
        assert_eq!(EvaluationContext::for_task(&task, 10.0).remaining_budget, 2.5);
    }

    #[test]
    fn earlier_spend_reduces_remaining_budget() {
        let task = Task::new("x");
        let ctx = EvaluationContext::for_task(&task, 10.0).with_spent(6.0);
        assert_eq!(ctx.remaining_budget, 4.0);
        let ctx = EvaluationContext::for_task(&task, 10.0).with_spent(12.0);
        assert_eq!(ctx.remaining_budget, 0.0);
    }
}
