//! Artifacts must stay within the amount of code that was asked for.

use once_cell::sync::Lazy;
use regex::Regex;
use shared_types::{Artifact, PolicyCheckResult, Severity};

use crate::registry::{EvaluationContext, PolicyCheck};
use crate::CheckError;

pub const PRINCIPLE_ID: &str = "scope";

static DECLARED_UNIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^\s*(?:(?:pub(?:\([^)]*\))?|export|default|async|unsafe|const)\s+)*(?:fn|struct|enum|trait|impl|class|def|function|interface)\b",
    )
    .expect("static regex")
});

/// Functions, classes, structs and similar top-level declarations.
pub fn count_declared_units(content: &str) -> usize {
    DECLARED_UNIT.find_iter(content).count()
}

pub struct ScopeCheck {
    multiplier: f64,
}

impl ScopeCheck {
    pub fn new(multiplier: f64) -> Self {
        Self {
            multiplier: multiplier.max(1.0),
        }
    }
}

impl PolicyCheck<Artifact> for ScopeCheck {
    fn principle_id(&self) -> &str {
        PRINCIPLE_ID
    }

    fn evaluate(&self, artifact: &Artifact, ctx: &EvaluationContext) -> Result<PolicyCheckResult, CheckError> {
        let requested = match ctx.requested_units {
            Some(requested) => requested,
            None => return Ok(PolicyCheckResult::pass(PRINCIPLE_ID)),
        };

        let declared = count_declared_units(&artifact.content);
        let allowed = requested as f64 * self.multiplier;
        if declared as f64 > allowed {
            return Ok(PolicyCheckResult::fail(
                PRINCIPLE_ID,
                Severity::Medium,
                format!(
                    "{declared} units declared for {requested} requested (allowed up to {allowed:.1})"
                ),
            ));
        }
        Ok(PolicyCheckResult::pass(PRINCIPLE_ID))
    }
}
