pub mod config;
pub mod correction;
pub mod metrics;
pub mod outcome;
pub mod task;
pub mod verdict;

pub use config::{ConfigError, ConstitutionConfig};
pub use correction::{CorrectionAttempt, Diagnosis, DiagnosisLevel, EscalationReason, EscalationTicket};
pub use metrics::{ComplianceCounts, ComplianceMetricsSnapshot};
pub use outcome::{ExhaustedResource, RejectionReason, SubmissionOutcome};
pub use task::{Artifact, Task};
pub use verdict::{
    CheckVerdict, Decision, EnforcementMode, GuardianVerdict, Phase, PolicyCheckResult, Severity,
};
