// self-correct-rs/src/verifier.rs
// Optional executable verification: runs the artifact's tests or
// equivalent checks outside this process.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared_types::{Artifact, Diagnosis, DiagnosisLevel, PolicyCheckResult, Severity};

pub const EXECUTION_PRINCIPLE: &str = "execution";

/// Outcome of one verification run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRunResult {
    pub passed: bool,
    /// Names or short descriptions of failing cases.
    pub failures: Vec<String>,
    /// Captured output, possibly truncated by the verifier.
    pub output: String,
}

impl TestRunResult {
    pub fn passed() -> Self {
        Self {
            passed: true,
            failures: Vec::new(),
            output: String::new(),
        }
    }

    pub fn failed(failures: Vec<String>, output: impl Into<String>) -> Self {
        Self {
            passed: false,
            failures,
            output: output.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifierError {
    #[error("verifier could not run: {0}")]
    Unavailable(String),

    #[error("verifier run failed: {0}")]
    Execution(String),
}

/// Judges semantic correctness, which the policy checks do not attempt.
#[async_trait]
pub trait ExecutableVerifier: Send + Sync {
    async fn verify(&self, artifact: &Artifact) -> Result<TestRunResult, VerifierError>;
}

/// EXECUTION diagnosis for a failed run; `None` when the run passed. A
/// verifier error counts as a failed run.
pub fn execution_diagnosis(result: Result<TestRunResult, VerifierError>) -> Option<Diagnosis> {
    let message = match result {
        Ok(run) if run.passed => return None,
        Ok(run) if run.failures.is_empty() => format!("verification failed: {}", run.output.trim()),
        Ok(run) => format!("failing cases: {}", run.failures.join(", ")),
        Err(err) => err.to_string(),
    };
    Some(Diagnosis::new(
        DiagnosisLevel::Execution,
        vec![PolicyCheckResult::fail(EXECUTION_PRINCIPLE, Severity::High, message)],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passing_run_has_no_diagnosis() {
        assert!(execution_diagnosis(Ok(TestRunResult::passed())).is_none());
    }

    #[test]
    fn failing_cases_are_listed() {
        let diagnosis = execution_diagnosis(Ok(TestRunResult::failed(
            vec!["parses_leap_day".into(), "rejects_month_13".into()],
            "2 failed",
        )))
        .unwrap();
        assert_eq!(diagnosis.level, DiagnosisLevel::Execution);
        assert!(diagnosis.summary.contains("parses_leap_day, rejects_month_13"));
    }

    #[test]
    fn verifier_error_fails_closed() {
        let diagnosis =
            execution_diagnosis(Err(VerifierError::Unavailable("sandbox offline".into()))).unwrap();
        assert!(diagnosis.flags(EXECUTION_PRINCIPLE));
    }
}
