// shared-types-rs/src/correction.rs
// Diagnoses, correction attempts and escalation tickets.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::verdict::PolicyCheckResult;

/// Level of the verification ladder that produced a diagnosis.
///
/// Levels run cheapest-first; `Clean` means every level passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiagnosisLevel {
    /// The generator itself failed or was short-circuited.
    Generation,
    /// The runtime monitor aborted the call (timeout, cost ceiling).
    Runtime,
    Structural,
    Policy,
    Execution,
    Clean,
}

impl fmt::Display for DiagnosisLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosisLevel::Generation => write!(f, "generation"),
            DiagnosisLevel::Runtime => write!(f, "runtime"),
            DiagnosisLevel::Structural => write!(f, "structural"),
            DiagnosisLevel::Policy => write!(f, "policy"),
            DiagnosisLevel::Execution => write!(f, "execution"),
            DiagnosisLevel::Clean => write!(f, "clean"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub level: DiagnosisLevel,
    /// Failed findings only; sub-threshold warnings travel with the artifact.
    pub findings: Vec<PolicyCheckResult>,
    pub summary: String,
}

impl Diagnosis {
    pub fn clean() -> Self {
        Self {
            level: DiagnosisLevel::Clean,
            findings: Vec::new(),
            summary: "all verification levels passed".to_string(),
        }
    }

    pub fn new(level: DiagnosisLevel, findings: Vec<PolicyCheckResult>) -> Self {
        let summary = if findings.is_empty() {
            format!("{level} level failed")
        } else {
            findings
                .iter()
                .map(|f| format!("{}: {}", f.principle_id, f.message))
                .collect::<Vec<_>>()
                .join("; ")
        };
        Self {
            level,
            findings,
            summary,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.level == DiagnosisLevel::Clean
    }

    /// True when the diagnosis contains a failed finding for `principle_id`.
    pub fn flags(&self, principle_id: &str) -> bool {
        self.findings
            .iter()
            .any(|f| f.is_fail() && f.principle_id == principle_id)
    }

    pub fn violated_policy_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for finding in self.findings.iter().filter(|f| f.is_fail()) {
            if !ids.contains(&finding.principle_id) {
                ids.push(finding.principle_id.clone());
            }
        }
        ids
    }

    pub fn has_non_retryable_finding(&self) -> bool {
        self.findings.iter().any(|f| f.is_fail() && !f.retryable)
    }

    /// Feedback text handed to the generator on the next attempt.
    pub fn feedback(&self) -> String {
        let mut out = format!("Previous attempt failed {} verification.", self.level);
        for finding in self.findings.iter().filter(|f| f.is_fail()) {
            out.push_str(&format!(
                "\n- [{}] {}: {}",
                finding.severity, finding.principle_id, finding.message
            ));
        }
        out
    }
}

/// One entry of a task's correction trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionAttempt {
    pub iteration_index: u32,
    pub diagnosis: Diagnosis,
    /// Feedback applied to the next attempt; absent on the final attempt.
    pub applied_refinement: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationReason {
    /// The configured iteration bound ran out without an accept.
    IterationBoundExhausted { max_iterations: u32 },
    /// The restricted operating window disabled autonomous retry.
    RestrictedWindow,
}

/// Durable hand-off of an unresolved task to human review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationTicket {
    pub ticket_id: String,
    pub task_id: String,
    pub reason: EscalationReason,
    /// Every attempted diagnosis, in iteration order.
    pub trail: Vec<CorrectionAttempt>,
    pub created_at: DateTime<Utc>,
}

impl EscalationTicket {
    pub fn new(
        task_id: impl Into<String>,
        reason: EscalationReason,
        trail: Vec<CorrectionAttempt>,
    ) -> Self {
        Self {
            ticket_id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            reason,
            trail,
            created_at: Utc::now(),
        }
    }

    /// Index of the last attempted iteration.
    pub fn iteration_count(&self) -> u32 {
        self.trail
            .last()
            .map(|attempt| attempt.iteration_index)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verdict::Severity;

    #[test]
    fn feedback_lists_failed_findings() {
        let diagnosis = Diagnosis::new(
            DiagnosisLevel::Policy,
            vec![
                PolicyCheckResult::fail("completeness", Severity::High, "marker TODO found"),
                PolicyCheckResult::fail("scope", Severity::Medium, "9 units for 2 requested"),
            ],
        );
        let feedback = diagnosis.feedback();
        assert!(feedback.contains("policy verification"));
        assert!(feedback.contains("[HIGH] completeness: marker TODO found"));
        assert!(feedback.contains("[MEDIUM] scope"));
        assert!(diagnosis.flags("completeness"));
        assert!(!diagnosis.flags("external_reference"));
    }

    #[test]
    fn ticket_reports_last_iteration_index() {
        let attempt = |i| CorrectionAttempt {
            iteration_index: i,
            diagnosis: Diagnosis::new(DiagnosisLevel::Generation, Vec::new()),
            applied_refinement: None,
        };
        let ticket = EscalationTicket::new(
            "task-9",
            EscalationReason::IterationBoundExhausted { max_iterations: 2 },
            vec![attempt(0), attempt(1)],
        );
        assert_eq!(ticket.iteration_count(), 1);
        assert_eq!(ticket.trail.len() as u32, ticket.iteration_count() + 1);
    }
}
