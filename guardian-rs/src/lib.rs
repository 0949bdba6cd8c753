// guardian-rs/src/lib.rs
// Guardian coordinator: validates the intended action (PRE), supervises the
// generator call (RUNTIME) and judges the finished artifact (POST).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use error_handling::{Error, ErrorKind, ServiceError};
use policy_engine::{EvaluationContext, PolicyRegistry};
use resource_guard::{CallPermit, GuardDenial, ResourceGuard};
use shared_types::config::GuardianConfig;
use shared_types::{
    Artifact, ConfigError, Decision, Diagnosis, DiagnosisLevel, EnforcementMode, GuardianVerdict,
    Phase, PolicyCheckResult, Severity, Task,
};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

pub mod generator;
pub mod window;


pub use generator::{CostReporter, Generator, GeneratorError};
pub use window::{RestrictedWindow, ScheduleWindow, Unrestricted};

/// Principle ids used for RUNTIME findings.
pub const GENERATOR_PRINCIPLE: &str = "generator";
pub const TIMEOUT_PRINCIPLE: &str = "runtime_timeout";
pub const COST_CEILING_PRINCIPLE: &str = "cost_ceiling";

/// Result of the PRE phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PreClearance {
    pub verdict: GuardianVerdict,
    /// False inside a restricted operating window: a POST rejection then
    /// escalates instead of retrying.
    pub autonomous_retry: bool,
}

impl PreClearance {
    pub fn is_approved(&self) -> bool {
        !self.verdict.is_rejected()
    }
}

/// Why a supervised generator call produced no artifact.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeAbort {
    /// The resource guard refused the call; the generator was not invoked.
    #[error(transparent)]
    Denied(GuardDenial),

    #[error("generation exceeded the {limit:?} time limit")]
    Timeout { limit: Duration },

    /// The task's cumulative spend crossed its ceiling. The budget is gone,
    /// so the finding is not retryable.
    #[error("task cost {spent:.2} exceeded the ceiling {ceiling:.2}")]
    CostCeiling { spent: f64, ceiling: f64 },

    #[error(transparent)]
    Generator(GeneratorError),
}

impl RuntimeAbort {
    pub fn is_denial(&self) -> bool {
        matches!(self, RuntimeAbort::Denied(_))
    }

    /// Finding recorded against the iteration the abort consumed.
    pub fn finding(&self) -> PolicyCheckResult {
        let principle = match self {
            RuntimeAbort::Denied(_) | RuntimeAbort::Generator(_) => GENERATOR_PRINCIPLE,
            RuntimeAbort::Timeout { .. } => TIMEOUT_PRINCIPLE,
            RuntimeAbort::CostCeiling { .. } => COST_CEILING_PRINCIPLE,
        };
        let finding = PolicyCheckResult::fail(principle, Severity::High, self.to_string());
        match self {
            RuntimeAbort::CostCeiling { .. } => finding.non_retryable(),
            _ => finding,
        }
    }

    pub fn diagnosis(&self) -> Diagnosis {
        let level = match self {
            RuntimeAbort::Denied(_) | RuntimeAbort::Generator(_) => DiagnosisLevel::Generation,
            RuntimeAbort::Timeout { .. } | RuntimeAbort::CostCeiling { .. } => DiagnosisLevel::Runtime,
        };
        Diagnosis::new(level, vec![self.finding()])
    }

    pub fn verdict(&self) -> GuardianVerdict {
        GuardianVerdict::new(Phase::Runtime, Decision::Rejected, vec![self.finding()])
    }
}

impl ServiceError for RuntimeAbort {
    fn to_error(&self) -> Error {
        match self {
            RuntimeAbort::Denied(denial) => denial.to_error(),
            RuntimeAbort::Generator(err) => err.to_error(),
            _ => Error::new(ErrorKind::GeneratorFailure, self.to_string())
                .service("guardian")
                .severity(self.severity()),
        }
    }

    fn is_transient(&self) -> bool {
        true
    }

    fn severity(&self) -> Severity {
        match self {
            RuntimeAbort::Denied(_) => Severity::Medium,
            _ => Severity::High,
        }
    }
}

/// Cost a task has spent across all of its attempts, against its ceiling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskBudget {
    pub ceiling: f64,
    pub spent: f64,
}

impl TaskBudget {
    pub fn new(ceiling: f64) -> Self {
        Self { ceiling, spent: 0.0 }
    }

    pub fn remaining(&self) -> f64 {
        (self.ceiling - self.spent).max(0.0)
    }
}

/// Records the breaker outcome of an admitted call; a call dropped before it
/// settles (caller cancellation) counts as a failure so a half-open probe is
/// always released.
struct AdmittedCall<'a> {
    guard: &'a ResourceGuard,
    permit: CallPermit,
    settled: bool,
}

impl<'a> AdmittedCall<'a> {
    fn new(guard: &'a ResourceGuard, permit: CallPermit) -> Self {
        Self {
            guard,
            permit,
            settled: false,
        }
    }

    fn succeeded(mut self) {
        self.settled = true;
        self.guard.record_success(self.permit);
    }

    fn failed(mut self) {
        self.settled = true;
        self.guard.record_failure(self.permit);
    }
}

impl Drop for AdmittedCall<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.guard.record_failure(self.permit);
        }
    }
}

pub struct Guardian {
    mode: EnforcementMode,
    pre: PolicyRegistry<Task>,
    post: PolicyRegistry<Artifact>,
    resource_guard: Arc<ResourceGuard>,
    window: Arc<dyn RestrictedWindow>,
    generation_timeout: Duration,
    cost_ceiling: f64,
}

impl Guardian {
    pub fn new(
        config: &GuardianConfig,
        pre: PolicyRegistry<Task>,
        post: PolicyRegistry<Artifact>,
        resource_guard: Arc<ResourceGuard>,
    ) -> Result<Self, ConfigError> {
        let window = ScheduleWindow::from_config(&config.restricted_windows)?;
        Ok(Self {
            mode: config.mode,
            pre,
            post,
            resource_guard,
            window: Arc::new(window),
            generation_timeout: config.generation_timeout(),
            cost_ceiling: config.cost_ceiling,
        })
    }

    pub fn with_restricted_window(mut self, window: Arc<dyn RestrictedWindow>) -> Self {
        self.window = window;
        self
    }

    pub fn mode(&self) -> EnforcementMode {
        self.mode
    }

    pub fn cost_ceiling(&self) -> f64 {
        self.cost_ceiling
    }

    pub fn resource_guard(&self) -> &Arc<ResourceGuard> {
        &self.resource_guard
    }

    /// Evaluation context for `task` under this guardian's cost ceiling.
    pub fn context_for(&self, task: &Task) -> EvaluationContext {
        EvaluationContext::for_task(task, self.cost_ceiling)
    }

    /// Fresh budget for `task`: its own budget, capped by the guardian ceiling.
    pub fn budget_for(&self, task: &Task) -> TaskBudget {
        TaskBudget::new(task.cost_budget.unwrap_or(self.cost_ceiling).min(self.cost_ceiling))
    }

    pub fn pre(&self, task: &Task) -> PreClearance {
        self.pre_at(task, Utc::now())
    }

    /// PRE phase at a given instant. The decision is APPROVED or REJECTED;
    /// a non-retryable failure always rejects.
    #[instrument(name = "guardian_pre", skip(self, task), fields(task_id = %task.task_id))]
    pub fn pre_at(&self, task: &Task, now: DateTime<Utc>) -> PreClearance {
        let results = self.pre.evaluate(task, &self.context_for(task));
        let rejected = results
            .iter()
            .any(|r| r.is_fail() && (!r.retryable || self.mode.rejects(r.severity)));
        let decision = if rejected {
            Decision::Rejected
        } else {
            Decision::Approved
        };
        let verdict = GuardianVerdict::new(Phase::Pre, decision, results);
        let autonomous_retry = !self.window.is_restricted(now);

        count_verdict(&verdict);
        if verdict.is_rejected() {
            warn!(violations = ?verdict.violated_policy_ids(), "PRE rejected the intended action");
        } else if !autonomous_retry {
            info!("restricted operating window active; autonomous retry disabled");
        }

        PreClearance {
            verdict,
            autonomous_retry,
        }
    }

    /// RUNTIME phase: admits the call through the resource guard, then runs
    /// the generator under the wall-clock limit and the task's remaining
    /// budget. Whatever the generator reported is charged to `budget`, on
    /// success and on abort alike.
    #[instrument(
        name = "guardian_runtime",
        skip(self, generator, task, budget),
        fields(task_id = %task.task_id)
    )]
    pub async fn run_generation(
        &self,
        generator: &dyn Generator,
        task: &Task,
        iteration: u32,
        budget: &mut TaskBudget,
    ) -> Result<Artifact, RuntimeAbort> {
        let permit = self.resource_guard.admit().map_err(RuntimeAbort::Denied)?;
        let call = AdmittedCall::new(&self.resource_guard, permit);

        let ceiling = budget.ceiling;
        let spent_before = budget.spent;
        let (reporter, mut spent) = CostReporter::channel();
        let started = Instant::now();

        let generation = generator.generate(task, iteration, reporter);
        tokio::pin!(generation);
        let deadline = tokio::time::sleep(self.generation_timeout);
        tokio::pin!(deadline);
        let mut watching_cost = true;

        let outcome = loop {
            tokio::select! {
                result = &mut generation => break result.map_err(RuntimeAbort::Generator),
                _ = &mut deadline => {
                    break Err(RuntimeAbort::Timeout { limit: self.generation_timeout });
                }
                changed = spent.changed(), if watching_cost => match changed {
                    Ok(()) => {
                        let total = spent_before + *spent.borrow();
                        if total > ceiling {
                            break Err(RuntimeAbort::CostCeiling { spent: total, ceiling });
                        }
                    }
                    Err(_) => watching_cost = false,
                },
            }
        };

        let attempt_cost = *spent.borrow();
        budget.spent = spent_before + attempt_cost;
        let outcome = match outcome {
            Ok(_) if budget.spent > ceiling => Err(RuntimeAbort::CostCeiling {
                spent: budget.spent,
                ceiling,
            }),
            other => other,
        };

        metrics::histogram!(
            "constitution_generation_seconds",
            started.elapsed().as_secs_f64()
        );

        match outcome {
            Ok(content) => {
                call.succeeded();
                debug!(
                    cost = attempt_cost,
                    task_spent = budget.spent,
                    bytes = content.len(),
                    "generation completed"
                );
                Ok(Artifact::new(
                    task.task_id.clone(),
                    iteration,
                    generator.generator_id(),
                    content,
                )
                .with_cost(attempt_cost))
            }
            Err(abort) => {
                match &abort {
                    // The backend answered; only the budget was exceeded.
                    RuntimeAbort::CostCeiling { .. } => call.succeeded(),
                    _ => call.failed(),
                }
                warn!(reason = %abort, "RUNTIME aborted generation");
                count_verdict(&abort.verdict());
                Err(abort)
            }
        }
    }

    /// POST phase: runs the artifact registry and folds the results under
    /// the enforcement mode.
    #[instrument(
        name = "guardian_post",
        skip(self, artifact, ctx),
        fields(task_id = %artifact.task_id, iteration = artifact.iteration)
    )]
    pub fn post(&self, artifact: &Artifact, ctx: &EvaluationContext) -> GuardianVerdict {
        let results = self.post.evaluate(artifact, ctx);
        let decision = self.mode.decide(&results);
        let verdict = GuardianVerdict::new(Phase::Post, decision, results);

        count_verdict(&verdict);
        match verdict.decision {
            Decision::Rejected => {
                info!(violations = ?verdict.violated_policy_ids(), "POST rejected artifact")
            }
            Decision::Conditional => {
                info!(warnings = ?verdict.violated_policy_ids(), "POST accepted with warnings")
            }
            Decision::Approved => debug!("POST approved artifact"),
        }
        verdict
    }
}

fn count_verdict(verdict: &GuardianVerdict) {
    metrics::increment_counter!(
        "constitution_guardian_verdicts_total",
        "phase" => verdict.phase.to_string(),
        "decision" => verdict.decision.to_string()
    );
}
