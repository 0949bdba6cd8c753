// shared-types-rs/src/verdict.rs
// Policy check results, guardian verdicts and enforcement modes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Severity grade of a single policy finding.
///
/// Ordering is significant: `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::High => write!(f, "HIGH"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckVerdict {
    Pass,
    Fail,
}

/// Output of one policy check against one subject.
///
/// Results carry no timestamps so that evaluating the same
/// (subject, context) pair twice yields identical result sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyCheckResult {
    pub principle_id: String,
    pub verdict: CheckVerdict,
    pub severity: Severity,
    pub message: String,
    /// False when the self-correction loop must not try to repair the finding.
    #[serde(default = "default_retryable")]
    pub retryable: bool,
}

fn default_retryable() -> bool {
    true
}

impl PolicyCheckResult {
    pub fn pass(principle_id: impl Into<String>) -> Self {
        Self {
            principle_id: principle_id.into(),
            verdict: CheckVerdict::Pass,
            severity: Severity::Low,
            message: String::new(),
            retryable: true,
        }
    }

    pub fn fail(
        principle_id: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            principle_id: principle_id.into(),
            verdict: CheckVerdict::Fail,
            severity,
            message: message.into(),
            retryable: true,
        }
    }

    /// Marks the finding as one the correction loop must not retry.
    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    pub fn is_fail(&self) -> bool {
        self.verdict == CheckVerdict::Fail
    }

    pub fn is_critical_fail(&self) -> bool {
        self.is_fail() && self.severity == Severity::Critical
    }
}

impl fmt::Display for PolicyCheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.verdict {
            CheckVerdict::Pass => write!(f, "[PASS] {}", self.principle_id),
            CheckVerdict::Fail => write!(
                f,
                "[FAIL/{}] {}: {}",
                self.severity, self.principle_id, self.message
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Pre,
    Runtime,
    Post,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Pre => write!(f, "PRE"),
            Phase::Runtime => write!(f, "RUNTIME"),
            Phase::Post => write!(f, "POST"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Approved,
    Conditional,
    Rejected,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Approved => write!(f, "APPROVED"),
            Decision::Conditional => write!(f, "CONDITIONAL"),
            Decision::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// Aggregated decision of one guardian phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianVerdict {
    pub phase: Phase,
    pub decision: Decision,
    pub results: Vec<PolicyCheckResult>,
}

impl GuardianVerdict {
    pub fn new(phase: Phase, decision: Decision, results: Vec<PolicyCheckResult>) -> Self {
        Self {
            phase,
            decision,
            results,
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.decision == Decision::Rejected
    }

    pub fn failures(&self) -> impl Iterator<Item = &PolicyCheckResult> {
        self.results.iter().filter(|r| r.is_fail())
    }

    /// Distinct ids of failed principles, in evaluation order.
    pub fn violated_policy_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for result in self.failures() {
            if !ids.iter().any(|id| id == &result.principle_id) {
                ids.push(result.principle_id.clone());
            }
        }
        ids
    }

    /// True when a failed finding forbids another correction attempt.
    pub fn has_non_retryable_failure(&self) -> bool {
        self.failures().any(|r| !r.retryable)
    }
}

/// Deployment-level strictness of the guardian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    /// MEDIUM and above reject.
    Strict,
    /// HIGH and above reject; MEDIUM is a warning.
    #[default]
    Balanced,
    /// Only CRITICAL rejects.
    Permissive,
}

impl EnforcementMode {
    /// Lowest severity that produces a REJECTED decision in this mode.
    pub fn rejection_threshold(&self) -> Severity {
        match self {
            EnforcementMode::Strict => Severity::Medium,
            EnforcementMode::Balanced => Severity::High,
            EnforcementMode::Permissive => Severity::Critical,
        }
    }

    pub fn rejects(&self, severity: Severity) -> bool {
        severity >= self.rejection_threshold()
    }

    /// Folds a list of results into a decision under this mode.
    pub fn decide(&self, results: &[PolicyCheckResult]) -> Decision {
        let mut decision = Decision::Approved;
        for result in results.iter().filter(|r| r.is_fail()) {
            if self.rejects(result.severity) {
                return Decision::Rejected;
            }
            decision = Decision::Conditional;
        }
        decision
    }
}

impl fmt::Display for EnforcementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnforcementMode::Strict => write!(f, "strict"),
            EnforcementMode::Balanced => write!(f, "balanced"),
            EnforcementMode::Permissive => write!(f, "permissive"),
        }
    }
}

impl FromStr for EnforcementMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(EnforcementMode::Strict),
            "balanced" => Ok(EnforcementMode::Balanced),
            "permissive" => Ok(EnforcementMode::Permissive),
            other => Err(format!("unknown enforcement mode: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_is_ordered() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn strict_mode_rejects_medium() {
        let results = vec![PolicyCheckResult::fail("scope", Severity::Medium, "too many units")];
        assert_eq!(EnforcementMode::Strict.decide(&results), Decision::Rejected);
        assert_eq!(EnforcementMode::Balanced.decide(&results), Decision::Conditional);
        assert_eq!(EnforcementMode::Permissive.decide(&results), Decision::Conditional);
    }

    #[test]
    fn permissive_mode_only_rejects_critical() {
        let high = vec![PolicyCheckResult::fail("completeness", Severity::High, "TODO")];
        assert_eq!(EnforcementMode::Permissive.decide(&high), Decision::Conditional);

        let critical = vec![PolicyCheckResult::fail("impact", Severity::Critical, "rm -rf")];
        assert_eq!(EnforcementMode::Permissive.decide(&critical), Decision::Rejected);
    }

    #[test]
    fn passes_only_are_approved() {
        let results = vec![PolicyCheckResult::pass("completeness"), PolicyCheckResult::pass("scope")];
        assert_eq!(EnforcementMode::Strict.decide(&results), Decision::Approved);
    }

    #[test]
    fn violated_ids_are_distinct_and_ordered() {
        let verdict = GuardianVerdict::new(
            Phase::Post,
            Decision::Rejected,
            vec![
                PolicyCheckResult::fail("completeness", Severity::High, "TODO"),
                PolicyCheckResult::pass("scope"),
                PolicyCheckResult::fail("claim_verification", Severity::Medium, "wrong"),
                PolicyCheckResult::fail("completeness", Severity::High, "FIXME"),
            ],
        );
        assert_eq!(
            verdict.violated_policy_ids(),
            vec!["completeness".to_string(), "claim_verification".to_string()]
        );
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("STRICT".parse::<EnforcementMode>().unwrap(), EnforcementMode::Strict);
        assert!("lenient".parse::<EnforcementMode>().is_err());
    }
}
