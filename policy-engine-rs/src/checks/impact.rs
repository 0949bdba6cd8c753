//! Refuses intended actions that match destructive-operation patterns.

use regex::Regex;
use shared_types::{PolicyCheckResult, Severity, Task};

use crate::registry::{EvaluationContext, PolicyCheck};
use crate::{compile_patterns, CheckError, PolicyError};

pub const PRINCIPLE_ID: &str = "impact";

pub struct ImpactCheck {
    patterns: Vec<Regex>,
}

impl ImpactCheck {
    pub fn new(patterns: &[String]) -> Result<Self, PolicyError> {
        Ok(Self {
            patterns: compile_patterns(PRINCIPLE_ID, patterns)?,
        })
    }
}

impl PolicyCheck<Task> for ImpactCheck {
    fn principle_id(&self) -> &str {
        PRINCIPLE_ID
    }

    fn evaluate(&self, task: &Task, _ctx: &EvaluationContext) -> Result<PolicyCheckResult, CheckError> {
        match self.patterns.iter().find_map(|p| p.find(&task.prompt)) {
            Some(m) => Ok(PolicyCheckResult::fail(
                PRINCIPLE_ID,
                Severity::Critical,
                format!("intended action is destructive: '{}'", m.as_str()),
            )
            .non_retryable()),
            None => Ok(PolicyCheckResult::pass(PRINCIPLE_ID)),
        }
    }
}
