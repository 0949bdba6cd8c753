// self-correct-rs/src/engine.rs
// The bounded verify-fix-execute loop, as an explicit state machine:
// GENERATING -> VALIDATING -> (GENERATING | ESCALATING) -> DONE.

use std::sync::Arc;

use compliance_ledger::{MetricsRecorder, TaskResolution};
use error_handling::{log_structured_error, Error, ErrorKind, ServiceError};
use guardian::{Generator, Guardian, TaskBudget};
use shared_types::{
    Artifact, CorrectionAttempt, Decision, Diagnosis, DiagnosisLevel, EscalationReason,
    EscalationTicket, GuardianVerdict, Phase, PolicyCheckResult, RejectionReason, Severity,
    SubmissionOutcome, Task,
};
use tracing::{debug, info, instrument, warn};

use crate::escalation::{EscalationQueue, OutboxQueue};
use crate::structural::structural_check;
use crate::verifier::{execution_diagnosis, ExecutableVerifier};

enum State {
    Generating,
    Validating(Artifact),
    Escalating(EscalationReason),
    Done(SubmissionOutcome),
}

/// Per-task loop bookkeeping.
struct Run {
    task: Task,
    iteration: u32,
    trail: Vec<CorrectionAttempt>,
    autonomous_retry: bool,
    /// Spend across every attempt of this task.
    budget: TaskBudget,
}

pub struct CorrectionEngine {
    guardian: Arc<Guardian>,
    generator: Arc<dyn Generator>,
    verifier: Option<Arc<dyn ExecutableVerifier>>,
    escalations: Arc<dyn EscalationQueue>,
    recorder: MetricsRecorder,
    max_iterations: u32,
}

impl CorrectionEngine {
    /// `max_iterations` is clamped to at least one attempt. Tickets reach
    /// `escalations` through an [`OutboxQueue`], so a refused hand-off is
    /// held and redelivered rather than lost.
    pub fn new(
        guardian: Arc<Guardian>,
        generator: Arc<dyn Generator>,
        escalations: Arc<dyn EscalationQueue>,
        recorder: MetricsRecorder,
        max_iterations: u32,
    ) -> Self {
        Self {
            guardian,
            generator,
            verifier: None,
            escalations: Arc::new(OutboxQueue::new(escalations)),
            recorder,
            max_iterations: max_iterations.max(1),
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn ExecutableVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn guardian(&self) -> &Arc<Guardian> {
        &self.guardian
    }

    pub fn recorder(&self) -> &MetricsRecorder {
        &self.recorder
    }

    /// The queue escalations are written to, including held tickets.
    pub fn escalations(&self) -> &Arc<dyn EscalationQueue> {
        &self.escalations
    }

    /// Runs one task to exactly one terminal outcome.
    #[instrument(name = "correction_run", skip(self, task), fields(task_id = %task.task_id))]
    pub async fn run(&self, task: Task) -> SubmissionOutcome {
        let task_id = task.task_id.clone();

        let clearance = self.guardian.pre(&task);
        self.recorder.record_verdict(&task_id, 0, &clearance.verdict);
        let outcome = if clearance.is_approved() {
            let budget = self.guardian.budget_for(&task);
            self.correct(Run {
                task,
                iteration: 0,
                trail: Vec::new(),
                autonomous_retry: clearance.autonomous_retry,
                budget,
            })
            .await
        } else {
            SubmissionOutcome::Rejected(RejectionReason::PreCheckRejected {
                verdict: clearance.verdict,
            })
        };

        self.recorder.task_completed(&task_id, resolution(&outcome));
        match outcome_error(&task_id, &outcome) {
            Some(err) => log_structured_error(&err),
            None => info!(attempts = outcome.trail().len(), "task accepted"),
        }
        outcome
    }

    async fn correct(&self, mut run: Run) -> SubmissionOutcome {
        let mut state = State::Generating;
        loop {
            state = match state {
                State::Generating => self.generate(&mut run).await,
                State::Validating(artifact) => self.validate(&mut run, artifact).await,
                State::Escalating(reason) => self.escalate(&mut run, reason).await,
                State::Done(outcome) => return outcome,
            };
        }
    }

    async fn generate(&self, run: &mut Run) -> State {
        match self
            .guardian
            .run_generation(self.generator.as_ref(), &run.task, run.iteration, &mut run.budget)
            .await
        {
            Ok(artifact) => State::Validating(artifact),
            Err(abort) => {
                self.recorder
                    .record_verdict(&run.task.task_id, run.iteration, &abort.verdict());
                if let guardian::RuntimeAbort::Denied(denial) = &abort {
                    warn!(retry_after = denial.retry_after_seconds(), "generator call denied");
                    return State::Done(SubmissionOutcome::Rejected(
                        RejectionReason::ResourceExhausted {
                            resource: denial.resource(),
                            retry_after_seconds: denial.retry_after_seconds(),
                            trail: std::mem::take(&mut run.trail),
                        },
                    ));
                }
                self.after_failure(run, abort.diagnosis())
            }
        }
    }

    /// Cheapest level first: structural, then policy, then execution.
    async fn validate(&self, run: &mut Run, artifact: Artifact) -> State {
        let task_id = run.task.task_id.clone();

        if let Some(diagnosis) = structural_check(&artifact) {
            self.record_failure(&task_id, run.iteration, &diagnosis);
            return self.after_failure(run, diagnosis);
        }

        let ctx = self
            .guardian
            .context_for(&run.task)
            .with_spent(run.budget.spent)
            .at_iteration(run.iteration);
        let verdict = self.guardian.post(&artifact, &ctx);
        self.recorder.record_verdict(&task_id, run.iteration, &verdict);
        if verdict.is_rejected() {
            let findings: Vec<PolicyCheckResult> = verdict.failures().cloned().collect();
            return self.after_failure(run, Diagnosis::new(DiagnosisLevel::Policy, findings));
        }
        let warnings: Vec<PolicyCheckResult> = verdict.failures().cloned().collect();

        if let Some(verifier) = &self.verifier {
            if let Some(diagnosis) = execution_diagnosis(verifier.verify(&artifact).await) {
                self.record_failure(&task_id, run.iteration, &diagnosis);
                return self.after_failure(run, diagnosis);
            }
        }

        debug!(iteration = run.iteration, warnings = warnings.len(), "artifact accepted");
        metrics::histogram!("constitution_accepted_iteration", run.iteration as f64);
        State::Done(SubmissionOutcome::Accepted {
            artifact,
            warnings,
            accepted_at_iteration: run.iteration,
        })
    }

    /// Decides what a failed iteration leads to and appends it to the trail.
    fn after_failure(&self, run: &mut Run, diagnosis: Diagnosis) -> State {
        debug!(
            iteration = run.iteration,
            level = %diagnosis.level,
            summary = %diagnosis.summary,
            "iteration failed"
        );

        if diagnosis.has_non_retryable_finding() {
            let findings = diagnosis
                .findings
                .iter()
                .filter(|f| f.is_fail() && !f.retryable)
                .cloned()
                .collect();
            run.trail.push(attempt(run.iteration, diagnosis, None));
            return State::Done(SubmissionOutcome::Rejected(
                RejectionReason::NonRetryableViolation {
                    findings,
                    trail: std::mem::take(&mut run.trail),
                },
            ));
        }

        if !run.autonomous_retry && diagnosis.level == DiagnosisLevel::Policy {
            run.trail.push(attempt(run.iteration, diagnosis, None));
            return State::Escalating(EscalationReason::RestrictedWindow);
        }

        if run.iteration + 1 >= self.max_iterations {
            run.trail.push(attempt(run.iteration, diagnosis, None));
            return State::Escalating(EscalationReason::IterationBoundExhausted {
                max_iterations: self.max_iterations,
            });
        }

        let next = run.task.refined_with(&diagnosis);
        let refinement = next.refinements.last().cloned();
        run.trail.push(attempt(run.iteration, diagnosis, refinement));
        run.task = next;
        run.iteration += 1;
        State::Generating
    }

    /// Hands the task to human review. The hand-off does not wait for
    /// resolution; a ticket the queue refuses stays in the outbox.
    async fn escalate(&self, run: &mut Run, reason: EscalationReason) -> State {
        let ticket = EscalationTicket::new(
            run.task.task_id.clone(),
            reason,
            std::mem::take(&mut run.trail),
        );

        let label = match ticket.reason {
            EscalationReason::IterationBoundExhausted { .. } => "iteration_bound",
            EscalationReason::RestrictedWindow => "restricted_window",
        };
        metrics::increment_counter!("constitution_escalations_total", "reason" => label);

        match self.escalations.enqueue(&ticket).await {
            Ok(()) => info!(ticket_id = %ticket.ticket_id, "task escalated for review"),
            Err(err) => log_structured_error(&err.to_error().task(ticket.task_id.clone())),
        }
        State::Done(SubmissionOutcome::Escalated(ticket))
    }

    fn record_failure(&self, task_id: &str, iteration: u32, diagnosis: &Diagnosis) {
        let verdict =
            GuardianVerdict::new(Phase::Post, Decision::Rejected, diagnosis.findings.clone());
        self.recorder.record_verdict(task_id, iteration, &verdict);
    }
}

fn attempt(
    iteration_index: u32,
    diagnosis: Diagnosis,
    applied_refinement: Option<String>,
) -> CorrectionAttempt {
    CorrectionAttempt {
        iteration_index,
        diagnosis,
        applied_refinement,
    }
}

fn resolution(outcome: &SubmissionOutcome) -> TaskResolution {
    match outcome {
        SubmissionOutcome::Accepted {
            accepted_at_iteration,
            ..
        } => TaskResolution::Accepted {
            iteration: *accepted_at_iteration,
        },
        SubmissionOutcome::Escalated(_) => TaskResolution::Escalated,
        SubmissionOutcome::Rejected(_) => TaskResolution::Rejected,
    }
}

/// Structured error describing a non-accepted outcome; `None` for accepts.
pub fn outcome_error(task_id: &str, outcome: &SubmissionOutcome) -> Option<Error> {
    let (kind, severity, message) = match outcome {
        SubmissionOutcome::Accepted { .. } => return None,
        SubmissionOutcome::Escalated(ticket) => (
            ErrorKind::IterationBoundExceeded,
            Severity::Medium,
            match ticket.reason {
                EscalationReason::IterationBoundExhausted { max_iterations } => {
                    format!("no acceptable artifact within {max_iterations} attempts; escalated")
                }
                EscalationReason::RestrictedWindow => {
                    "rejected inside a restricted operating window; escalated".to_string()
                }
            },
        ),
        SubmissionOutcome::Rejected(RejectionReason::PreCheckRejected { verdict }) => (
            ErrorKind::PolicyViolation,
            Severity::High,
            format!("intended action rejected: {}", verdict.violated_policy_ids().join(", ")),
        ),
        SubmissionOutcome::Rejected(RejectionReason::NonRetryableViolation { findings, .. }) => (
            ErrorKind::PolicyViolation,
            Severity::Critical,
            findings
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        ),
        SubmissionOutcome::Rejected(RejectionReason::ResourceExhausted {
            resource,
            retry_after_seconds,
            ..
        }) => (
            ErrorKind::ResourceExhausted,
            Severity::Medium,
            format!("generator call denied ({resource:?}); retry after {retry_after_seconds}s"),
        ),
    };

    Some(
        Error::new(kind, message)
            .service("self-correct")
            .task(task_id)
            .code(outcome.label())
            .severity(severity),
    )
}
