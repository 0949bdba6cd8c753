// constitution-service-rs/src/lib.rs
// Public face of the constitutional validation pipeline.
//
// Callers submit tasks and receive exactly one terminal outcome; operators
// read compliance metrics and the audit trail and may reset the resource
// guard. Infrastructure errors surface from construction, never from
// `submit`.

use std::sync::Arc;

use compliance_ledger::{AuditRecord, LedgerError, MetricsRecorder};
use error_handling::{init_logging, Result};
use guardian::Generator;
use resource_guard::{ResourceGuard, ResourceStatus};
use self_correct::{CorrectionEngine, QueueError};
use shared_types::config::{get_config, init_config};
use shared_types::{ComplianceMetricsSnapshot, ConstitutionConfig, EscalationTicket, SubmissionOutcome, Task};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

mod builder;

pub use builder::ServiceBuilder;

pub(crate) const SERVICE_NAME: &str = "constitution-service";

/// Loads configuration (file, then environment overrides), installs the
/// tracing subscriber and publishes the process-wide config.
pub fn initialize() -> Result<Arc<ConstitutionConfig>> {
    let config = ConstitutionConfig::load()?;
    init_logging(&config.logging)?;
    if let Ok(existing) = get_config() {
        return Ok(existing);
    }
    Ok(init_config(config)?)
}

pub struct ConstitutionService {
    engine: CorrectionEngine,
    resource_guard: Arc<ResourceGuard>,
    recorder: MetricsRecorder,
    recorder_task: JoinHandle<()>,
    config: Arc<ConstitutionConfig>,
}

impl ConstitutionService {
    pub fn builder(config: ConstitutionConfig) -> ServiceBuilder {
        ServiceBuilder::new(config)
    }

    /// Service with the built-in checks, the configured stores and `generator`.
    pub fn from_config(config: ConstitutionConfig, generator: Arc<dyn Generator>) -> Result<Self> {
        Self::builder(config).generator(generator).build()
    }

    pub fn config(&self) -> &ConstitutionConfig {
        &self.config
    }

    /// Validates, generates and corrects `task` until it is accepted,
    /// escalated or rejected.
    #[instrument(name = "constitution_submit", skip(self, task), fields(task_id = %task.task_id))]
    pub async fn submit(&self, task: Task) -> SubmissionOutcome {
        self.engine.run(task).await
    }

    /// Compliance indicators as of the most recently completed task.
    pub async fn metrics_snapshot(&self) -> Result<ComplianceMetricsSnapshot, LedgerError> {
        self.recorder.snapshot().await
    }

    /// Audit records for one task, in sequence order.
    pub async fn audit_trail(&self, task_id: &str) -> Result<Vec<AuditRecord>, LedgerError> {
        self.recorder.audit_trail(task_id).await
    }

    /// Operator action: clears the rate-limit window and closes the breaker.
    pub fn admin_reset_resource_guard(&self) {
        self.resource_guard.reset();
    }

    pub fn resource_status(&self) -> ResourceStatus {
        self.resource_guard.status()
    }

    /// Unacknowledged tickets, including any the queue has not yet accepted.
    pub async fn pending_escalations(&self) -> Result<Vec<EscalationTicket>, QueueError> {
        self.engine.escalations().pending().await
    }

    pub async fn acknowledge_escalation(&self, ticket_id: &str) -> Result<bool, QueueError> {
        self.engine.escalations().acknowledge(ticket_id).await
    }

    /// Stops the recorder after it has drained every queued event.
    pub async fn shutdown(self) {
        let ConstitutionService {
            engine,
            recorder,
            recorder_task,
            ..
        } = self;
        drop(engine);
        drop(recorder);
        if let Err(err) = recorder_task.await {
            warn!(error = %err, "metrics recorder ended abnormally");
        }
        info!("constitution service stopped");
    }
}
