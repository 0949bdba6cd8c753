// compliance-ledger-rs/src/recorder.rs
// Single-writer metrics and audit actor. Handles are cheap to clone and
// only send messages; the spawned task owns every counter and the log.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use error_handling::{log_structured_error, ServiceError};
use shared_types::config::MetricsConfig;
use shared_types::{ComplianceCounts, ComplianceMetricsSnapshot, GuardianVerdict};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditLog, AuditRecord};
use crate::LedgerError;

/// Principle whose failures mark a task as incomplete.
const COMPLETENESS_PRINCIPLE: &str = "completeness";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComplianceTargets {
    pub compliance: f64,
    pub first_pass: f64,
}

impl Default for ComplianceTargets {
    fn default() -> Self {
        Self::from(&MetricsConfig::default())
    }
}

impl From<&MetricsConfig> for ComplianceTargets {
    fn from(config: &MetricsConfig) -> Self {
        Self {
            compliance: config.compliance_target,
            first_pass: config.first_pass_target,
        }
    }
}

/// Terminal outcome of a task, as counted by the recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResolution {
    /// Accepted at the given iteration index; 0 is a first-pass accept.
    Accepted { iteration: u32 },
    Escalated,
    Rejected,
}

impl TaskResolution {
    fn label(&self) -> &'static str {
        match self {
            TaskResolution::Accepted { .. } => "accepted",
            TaskResolution::Escalated => "escalated",
            TaskResolution::Rejected => "rejected",
        }
    }
}

enum Command {
    Record(AuditEvent),
    TaskCompleted {
        task_id: String,
        resolution: TaskResolution,
        completed_at: DateTime<Utc>,
    },
    Snapshot(oneshot::Sender<ComplianceMetricsSnapshot>),
    AuditTrail {
        task_id: String,
        reply: oneshot::Sender<Result<Vec<AuditRecord>, LedgerError>>,
    },
}

#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    tx: mpsc::UnboundedSender<Command>,
}

impl MetricsRecorder {
    /// Spawns the recorder actor on the current tokio runtime.
    pub fn spawn(log: AuditLog, targets: ComplianceTargets) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = RecorderState {
            log,
            targets,
            counts: ComplianceCounts::default(),
            open_tasks: HashMap::new(),
            computed_at: None,
        };
        let handle = tokio::spawn(state.run(rx));
        (Self { tx }, handle)
    }

    /// Opens the configured audit log (in memory when no path is set) and
    /// spawns the actor.
    pub fn from_config(config: &MetricsConfig) -> Result<(Self, JoinHandle<()>), LedgerError> {
        let log = match &config.audit_log_path {
            Some(path) => AuditLog::open(path)?,
            None => AuditLog::in_memory(),
        };
        Ok(Self::spawn(log, ComplianceTargets::from(config)))
    }

    /// Queues one validation event. Never blocks.
    pub fn record(&self, event: AuditEvent) {
        self.send(Command::Record(event));
    }

    pub fn record_verdict(&self, task_id: &str, iteration: u32, verdict: &GuardianVerdict) {
        self.record(AuditEvent::from_verdict(task_id, iteration, verdict));
    }

    pub fn task_completed(&self, task_id: &str, resolution: TaskResolution) {
        self.send(Command::TaskCompleted {
            task_id: task_id.to_string(),
            resolution,
            completed_at: Utc::now(),
        });
    }

    /// Indicators as of the last completed task. Only completed tasks are
    /// counted, violations included; messages sent earlier from the same
    /// handle are always reflected.
    pub async fn snapshot(&self) -> Result<ComplianceMetricsSnapshot, LedgerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot(reply))
            .map_err(|_| LedgerError::RecorderClosed)?;
        rx.await.map_err(|_| LedgerError::RecorderClosed)
    }

    pub async fn audit_trail(&self, task_id: &str) -> Result<Vec<AuditRecord>, LedgerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::AuditTrail {
                task_id: task_id.to_string(),
                reply,
            })
            .map_err(|_| LedgerError::RecorderClosed)?;
        rx.await.map_err(|_| LedgerError::RecorderClosed)?
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            warn!("metrics recorder has stopped; event dropped");
        }
    }
}

struct RecorderState {
    log: AuditLog,
    targets: ComplianceTargets,
    counts: ComplianceCounts,
    /// Violations of tasks still in flight, folded into `counts` when the
    /// task completes so every snapshot covers whole tasks.
    open_tasks: HashMap<String, BTreeMap<String, u64>>,
    computed_at: Option<DateTime<Utc>>,
}

impl RecorderState {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        debug!("metrics recorder started");
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }
        info!(records = self.log.len(), "metrics recorder stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Record(event) => self.record(event),
            Command::TaskCompleted {
                task_id,
                resolution,
                completed_at,
            } => self.complete(&task_id, resolution, completed_at),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::AuditTrail { task_id, reply } => {
                let _ = reply.send(self.log.records_for(&task_id));
            }
        }
    }

    fn record(&mut self, event: AuditEvent) {
        if !event.violated_policy_ids.is_empty() {
            let staged = self.open_tasks.entry(event.task_id.clone()).or_default();
            for principle in &event.violated_policy_ids {
                *staged.entry(principle.clone()).or_insert(0) += 1;
            }
        }

        metrics::increment_counter!(
            "constitution_audit_records_total",
            "phase" => event.phase.to_string(),
            "decision" => event.decision.to_string()
        );

        if let Err(err) = self.log.append(event) {
            metrics::increment_counter!("constitution_audit_write_failures_total");
            log_structured_error(&err.to_error());
        }
    }

    fn complete(&mut self, task_id: &str, resolution: TaskResolution, completed_at: DateTime<Utc>) {
        let counts = &mut self.counts;
        counts.total_tasks += 1;
        match resolution {
            TaskResolution::Accepted { iteration } => {
                counts.accepted += 1;
                if iteration == 0 {
                    counts.first_pass_accepted += 1;
                }
                *counts.accepted_by_iteration.entry(iteration).or_insert(0) += 1;
            }
            TaskResolution::Escalated => counts.escalated += 1,
            TaskResolution::Rejected => counts.rejected += 1,
        }
        let violations = self.open_tasks.remove(task_id).unwrap_or_default();
        if violations.contains_key(COMPLETENESS_PRINCIPLE) {
            counts.incomplete_tasks += 1;
        }
        for (principle, count) in violations {
            metrics::counter!(
                "constitution_policy_violations_total",
                count,
                "principle" => principle.clone()
            );
            *counts.policy_violations.entry(principle).or_insert(0) += count;
        }
        self.computed_at = Some(completed_at);

        metrics::increment_counter!("constitution_tasks_total", "outcome" => resolution.label());
        let snapshot = self.snapshot();
        metrics::gauge!("constitution_compliance_rate", snapshot.compliance_rate);
        metrics::gauge!("constitution_first_pass_rate", snapshot.first_pass_rate);
        metrics::gauge!("constitution_incompleteness_rate", snapshot.incompleteness_rate);
        debug!(
            task_id,
            outcome = resolution.label(),
            compliance_rate = snapshot.compliance_rate,
            "task completed"
        );
    }

    fn snapshot(&self) -> ComplianceMetricsSnapshot {
        ComplianceMetricsSnapshot::derive(
            self.counts.clone(),
            self.targets.compliance,
            self.targets.first_pass,
            self.computed_at,
        )
    }
}
