// shared-types-rs/src/outcome.rs
// The three terminal outcomes a caller can receive from `submit`.

use serde::{Deserialize, Serialize};

use crate::correction::{CorrectionAttempt, EscalationTicket};
use crate::task::Artifact;
use crate::verdict::{GuardianVerdict, PolicyCheckResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedResource {
    RateLimit,
    CircuitOpen,
}

/// Machine-readable reason attached to every rejection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    /// Guardian PRE refused the intended action; nothing was generated.
    PreCheckRejected { verdict: GuardianVerdict },
    /// The resource guard denied the generator call. Never auto-retried.
    ResourceExhausted {
        resource: ExhaustedResource,
        retry_after_seconds: u64,
        trail: Vec<CorrectionAttempt>,
    },
    /// A finding the correction loop must not repair.
    NonRetryableViolation {
        findings: Vec<PolicyCheckResult>,
        trail: Vec<CorrectionAttempt>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionOutcome {
    Accepted {
        artifact: Artifact,
        /// Sub-threshold findings surfaced as visible warnings.
        warnings: Vec<PolicyCheckResult>,
        /// Iteration index at which the artifact was accepted.
        accepted_at_iteration: u32,
    },
    Escalated(EscalationTicket),
    Rejected(RejectionReason),
}

impl SubmissionOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmissionOutcome::Accepted { .. })
    }

    pub fn is_escalated(&self) -> bool {
        matches!(self, SubmissionOutcome::Escalated(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, SubmissionOutcome::Rejected(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            SubmissionOutcome::Accepted { .. } => "ACCEPTED",
            SubmissionOutcome::Escalated(_) => "ESCALATED",
            SubmissionOutcome::Rejected(_) => "REJECTED",
        }
    }

    /// Correction trail carried by the outcome, empty for accepts and PRE rejections.
    pub fn trail(&self) -> &[CorrectionAttempt] {
        match self {
            SubmissionOutcome::Escalated(ticket) => &ticket.trail,
            SubmissionOutcome::Rejected(RejectionReason::ResourceExhausted { trail, .. })
            | SubmissionOutcome::Rejected(RejectionReason::NonRetryableViolation { trail, .. }) => {
                trail
            }
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_serializes_with_kind_tag() {
        let outcome = SubmissionOutcome::Rejected(RejectionReason::ResourceExhausted {
            resource: ExhaustedResource::RateLimit,
            retry_after_seconds: 42,
            trail: Vec::new(),
        });
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "REJECTED");
        assert_eq!(json["kind"], "resource_exhausted");
        assert_eq!(json["resource"], "rate_limit");
        assert_eq!(json["retry_after_seconds"], 42);
    }
}
