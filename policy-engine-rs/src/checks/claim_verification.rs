//! Factual assertions in comments and docs must agree with a fact source.

use std::sync::Arc;

use shared_types::{Artifact, PolicyCheckResult, Severity};

use crate::registry::{EvaluationContext, PolicyCheck};
use crate::CheckError;

pub const PRINCIPLE_ID: &str = "claim_verification";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimCheck {
    /// The source has nothing to say about the claim.
    Unknown,
    Correct,
    Incorrect { correction: String },
}

/// Looks up factual assertions.
pub trait FactSource: Send + Sync {
    fn verify(&self, claim: &str) -> Result<ClaimCheck, CheckError>;
}

/// Fact source over a fixed table of case-insensitive phrases.
#[derive(Debug, Clone, Default)]
pub struct StaticFactSource {
    entries: Vec<(String, ClaimCheck)>,
}

impl StaticFactSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn affirm(mut self, phrase: &str) -> Self {
        self.entries.push((phrase.to_lowercase(), ClaimCheck::Correct));
        self
    }

    pub fn refute(mut self, phrase: &str, correction: impl Into<String>) -> Self {
        self.entries.push((
            phrase.to_lowercase(),
            ClaimCheck::Incorrect {
                correction: correction.into(),
            },
        ));
        self
    }
}

impl FactSource for StaticFactSource {
    fn verify(&self, claim: &str) -> Result<ClaimCheck, CheckError> {
        let claim = claim.to_lowercase();
        Ok(self
            .entries
            .iter()
            .find(|(phrase, _)| claim.contains(phrase.as_str()))
            .map(|(_, check)| check.clone())
            .unwrap_or(ClaimCheck::Unknown))
    }
}

const COMMENT_PREFIXES: [&str; 7] = ["///", "//!", "//", "/*", "#", "--", "* "];

/// Comment and doc lines, with their markers stripped.
pub fn comment_claims(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim_start)
        .filter(|line| !(line.starts_with("#[") || line.starts_with("#!")))
        .filter_map(|line| {
            COMMENT_PREFIXES
                .iter()
                .find(|prefix| line.starts_with(**prefix))
                .map(|prefix| {
                    line[prefix.len()..]
                        .trim_start_matches('*')
                        .trim_end()
                        .trim_end_matches("*/")
                        .trim()
                        .to_string()
                })
        })
        .filter(|claim| !claim.is_empty())
        .collect()
}

pub struct ClaimVerificationCheck {
    facts: Arc<dyn FactSource>,
}

impl ClaimVerificationCheck {
    pub fn new(facts: Arc<dyn FactSource>) -> Self {
        Self { facts }
    }
}

impl PolicyCheck<Artifact> for ClaimVerificationCheck {
    fn principle_id(&self) -> &str {
        PRINCIPLE_ID
    }

    fn evaluate(&self, artifact: &Artifact, _ctx: &EvaluationContext) -> Result<PolicyCheckResult, CheckError> {
        let mut mismatches = Vec::new();
        for claim in comment_claims(&artifact.content) {
            if let ClaimCheck::Incorrect { correction } = self.facts.verify(&claim)? {
                mismatches.push(format!("'{claim}' is incorrect: {correction}"));
            }
        }

        if mismatches.is_empty() {
            Ok(PolicyCheckResult::pass(PRINCIPLE_ID))
        } else {
            Ok(PolicyCheckResult::fail(
                PRINCIPLE_ID,
                Severity::Medium,
                mismatches.join("; "),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;
    use shared_types::Task;

    mock! {
        Facts {}
        impl FactSource for Facts {
            fn verify(&self, claim: &str) -> Result<ClaimCheck, CheckError>;
        }
    }

    fn ctx() -> EvaluationContext {
        EvaluationContext::for_task(&Task::new("x"), 10.0)
    }

    #[test]
    fn extracts_comment_lines_only() {
        let code = "#[derive(Debug)]\n/// Sorts in O(n log n).\nfn sort() {\n    // stable sort\n    let x = 1; \n}\n# python note\n/* block */\n";
        assert_eq!(
            comment_claims(code),
            vec!["Sorts in O(n log n).", "stable sort", "python note", "block"]
        );
    }

    #[test]
    fn incorrect_claim_fails_medium_with_correction() {
        let facts = StaticFactSource::new()
            .affirm("sha-256 digests are 32 bytes")
            .refute("md5 is collision resistant", "MD5 has practical collision attacks");
        let artifact = Artifact::new(
            "t-1",
            0,
            "test",
            "// SHA-256 digests are 32 bytes\n// MD5 is collision resistant, so we use it\nfn digest() {}\n",
        );

        let result = ClaimVerificationCheck::new(Arc::new(facts))
            .evaluate(&artifact, &ctx())
            .unwrap();
        assert!(result.is_fail());
        assert_eq!(result.severity, Severity::Medium);
        assert!(result.message.contains("MD5 has practical collision attacks"));
        assert!(!result.message.contains("SHA-256"));
    }

    #[test]
    fn unknown_claims_pass() {
        let mut facts = MockFacts::new();
        facts.expect_verify().times(2).returning(|_| Ok(ClaimCheck::Unknown));
        let artifact = Artifact::new("t-1", 0, "test", "// one\n// two\nlet x = 1;\n");
        let result = ClaimVerificationCheck::new(Arc::new(facts))
            .evaluate(&artifact, &ctx())
            .unwrap();
        assert!(!result.is_fail());
    }

    #[test]
    fn fact_source_error_propagates() {
        let mut facts = MockFacts::new();
        facts
            .expect_verify()
            .returning(|_| Err(CheckError::FactSource("timeout".into())));
        let artifact = Artifact::new("t-1", 0, "test", "// claim\n");
        let err = ClaimVerificationCheck::new(Arc::new(facts))
            .evaluate(&artifact, &ctx())
            .unwrap_err();
        assert!(matches!(err, CheckError::FactSource(_)));
    }
}
