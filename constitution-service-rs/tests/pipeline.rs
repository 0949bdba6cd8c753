// End-to-end behaviour of the pipeline through the public facade.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use constitution_service::ConstitutionService;
use guardian::{CostReporter, Generator, GeneratorError, RestrictedWindow};
use resource_guard::CircuitState;
use shared_types::config::RateLimitSettings;
use shared_types::{
    ConstitutionConfig, Decision, EscalationReason, ExhaustedResource, Phase, RejectionReason,
    SubmissionOutcome, Task,
};

const CLEAN: &str = "fn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n";
const PLACEHOLDER: &str = "fn add(a: i32, b: i32) -> i32 {\n    // TODO: implement\n    0\n}\n";

enum Mode {
    Emit(&'static str),
    Fail,
    Stall,
}

struct CountingGenerator {
    mode: Mode,
    calls: AtomicUsize,
}

impl CountingGenerator {
    fn new(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for CountingGenerator {
    fn generator_id(&self) -> &str {
        "counting"
    }

    async fn generate(
        &self,
        _task: &Task,
        _iteration: u32,
        cost: CostReporter,
    ) -> Result<String, GeneratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            Mode::Emit(content) => {
                cost.report(0.25);
                Ok(content.to_string())
            }
            Mode::Fail => Err(GeneratorError::Backend("upstream returned 500".into())),
            Mode::Stall => {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(CLEAN.to_string())
            }
        }
    }
}

struct Restricted;

impl RestrictedWindow for Restricted {
    fn is_restricted(&self, _at: DateTime<Utc>) -> bool {
        true
    }
}

fn service(config: ConstitutionConfig, generator: Arc<CountingGenerator>) -> ConstitutionService {
    ConstitutionService::from_config(config, generator).unwrap()
}

#[tokio::test]
async fn placeholder_output_escalates_after_two_attempts() {
    let generator = CountingGenerator::new(Mode::Emit(PLACEHOLDER));
    let service = service(ConstitutionConfig::default(), generator.clone());

    let outcome = service.submit(Task::new("implement add").with_id("scenario-a")).await;
    let ticket = match outcome {
        SubmissionOutcome::Escalated(ticket) => ticket,
        other => panic!("expected ESCALATED, got {other:?}"),
    };

    assert_eq!(generator.calls(), 2);
    assert_eq!(ticket.trail.len(), 2);
    assert!(ticket
        .trail
        .iter()
        .all(|attempt| attempt.diagnosis.flags("completeness")));
    assert_eq!(service.pending_escalations().await.unwrap().len(), 1);

    let snapshot = service.metrics_snapshot().await.unwrap();
    assert_eq!(snapshot.counts.escalated, 1);
    assert_eq!(snapshot.counts.incomplete_tasks, 1);
    assert_eq!(snapshot.compliance_rate, 0.0);

    // PRE, then one POST per attempt.
    let trail = service.audit_trail("scenario-a").await.unwrap();
    let phases: Vec<(Phase, Decision)> = trail.iter().map(|r| (r.phase, r.decision)).collect();
    assert_eq!(
        phases,
        vec![
            (Phase::Pre, Decision::Approved),
            (Phase::Post, Decision::Rejected),
            (Phase::Post, Decision::Rejected),
        ]
    );
}

#[tokio::test]
async fn eleventh_request_in_window_is_rate_limited() {
    let mut config = ConstitutionConfig::default();
    config.resource_guard.rate_limit = RateLimitSettings {
        max_requests: 10,
        window_seconds: 60,
    };
    let generator = CountingGenerator::new(Mode::Emit(CLEAN));
    let service = service(config, generator.clone());

    for i in 0..10 {
        let outcome = service.submit(Task::new(format!("task {i}"))).await;
        assert!(outcome.is_accepted(), "submission {i} was {}", outcome.label());
    }

    match service.submit(Task::new("task 10")).await {
        SubmissionOutcome::Rejected(RejectionReason::ResourceExhausted {
            resource,
            retry_after_seconds,
            ..
        }) => {
            assert_eq!(resource, ExhaustedResource::RateLimit);
            assert!(retry_after_seconds > 0 && retry_after_seconds <= 60);
        }
        other => panic!("expected rate limit rejection, got {other:?}"),
    }
    assert_eq!(generator.calls(), 10);

    let snapshot = service.metrics_snapshot().await.unwrap();
    assert_eq!(snapshot.counts.first_pass_accepted, 10);
    assert_eq!(snapshot.counts.rejected, 1);
}

#[tokio::test]
async fn open_breaker_short_circuits_generator() {
    let mut config = ConstitutionConfig::default();
    config.correction.max_iterations = 1;
    config.resource_guard.circuit_breaker.failure_threshold = 5;
    let generator = CountingGenerator::new(Mode::Fail);
    let service = service(config, generator.clone());

    for i in 0..5 {
        let outcome = service.submit(Task::new(format!("task {i}"))).await;
        assert!(outcome.is_escalated());
    }
    assert_eq!(service.resource_status().circuit_state, CircuitState::Open);

    match service.submit(Task::new("task 5")).await {
        SubmissionOutcome::Rejected(RejectionReason::ResourceExhausted { resource, .. }) => {
            assert_eq!(resource, ExhaustedResource::CircuitOpen)
        }
        other => panic!("expected circuit rejection, got {other:?}"),
    }
    assert_eq!(generator.calls(), 5);

    service.admin_reset_resource_guard();
    assert_eq!(service.resource_status().circuit_state, CircuitState::Closed);
    service.submit(Task::new("after reset")).await;
    assert_eq!(generator.calls(), 6);
}

#[tokio::test]
async fn destructive_request_is_rejected_before_generation() {
    let generator = CountingGenerator::new(Mode::Emit(CLEAN));
    let service = service(ConstitutionConfig::default(), generator.clone());

    let outcome = service
        .submit(Task::new("DROP TABLE customers; then write a report"))
        .await;
    match outcome {
        SubmissionOutcome::Rejected(RejectionReason::PreCheckRejected { verdict }) => {
            assert_eq!(verdict.phase, Phase::Pre);
            assert_eq!(verdict.violated_policy_ids(), vec!["impact".to_string()]);
        }
        other => panic!("expected PRE rejection, got {other:?}"),
    }
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn restricted_window_escalates_without_retry() {
    let generator = CountingGenerator::new(Mode::Emit(PLACEHOLDER));
    let service = ConstitutionService::builder(ConstitutionConfig::default())
        .generator(generator.clone())
        .restricted_window(Arc::new(Restricted))
        .build()
        .unwrap();

    match service.submit(Task::new("implement add")).await {
        SubmissionOutcome::Escalated(ticket) => {
            assert_eq!(ticket.reason, EscalationReason::RestrictedWindow)
        }
        other => panic!("expected ESCALATED, got {other:?}"),
    }
    assert_eq!(generator.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn stalled_generator_times_out_each_attempt() {
    let mut config = ConstitutionConfig::default();
    config.guardian.generation_timeout_ms = 5_000;
    let generator = CountingGenerator::new(Mode::Stall);
    let service = service(config, generator.clone());

    match service.submit(Task::new("implement add")).await {
        SubmissionOutcome::Escalated(ticket) => {
            assert_eq!(ticket.trail.len(), 2);
            assert!(ticket
                .trail
                .iter()
                .all(|attempt| attempt.diagnosis.flags(guardian::TIMEOUT_PRINCIPLE)));
        }
        other => panic!("expected ESCALATED, got {other:?}"),
    }
    assert_eq!(generator.calls(), 2);
}

#[tokio::test]
async fn durable_stores_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ConstitutionConfig::default();
    config.metrics.audit_log_path = Some(dir.path().join("audit.ndjson"));
    config.escalation.queue_path = Some(dir.path().join("escalations.ndjson"));

    let ticket_id = {
        let service = service(config.clone(), CountingGenerator::new(Mode::Emit(PLACEHOLDER)));
        let outcome = service.submit(Task::new("implement add").with_id("durable")).await;
        let ticket_id = match outcome {
            SubmissionOutcome::Escalated(ticket) => ticket.ticket_id,
            other => panic!("expected ESCALATED, got {other:?}"),
        };
        service.shutdown().await;
        ticket_id
    };

    let service = service(config, CountingGenerator::new(Mode::Emit(CLEAN)));
    let pending = service.pending_escalations().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].ticket_id, ticket_id);
    assert!(service.acknowledge_escalation(&ticket_id).await.unwrap());
    assert!(service.pending_escalations().await.unwrap().is_empty());

    let trail = service.audit_trail("durable").await.unwrap();
    assert_eq!(trail.len(), 3);
    compliance_ledger::verify_chain(&trail).unwrap();
}

#[tokio::test]
async fn missing_generator_is_a_construction_error() {
    let err = ConstitutionService::builder(ConstitutionConfig::default())
        .build()
        .err()
        .unwrap();
    assert_eq!(err.kind, error_handling::ErrorKind::Configuration);
}
