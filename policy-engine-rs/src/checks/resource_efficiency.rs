//! The intended action must fit the remaining cost budget.

use shared_types::{PolicyCheckResult, Severity, Task};

use crate::registry::{EvaluationContext, PolicyCheck};
use crate::CheckError;

pub const PRINCIPLE_ID: &str = "resource_efficiency";

#[derive(Debug, Default)]
pub struct ResourceEfficiencyCheck;

impl ResourceEfficiencyCheck {
    pub fn new() -> Self {
        Self
    }
}

impl PolicyCheck<Task> for ResourceEfficiencyCheck {
    fn principle_id(&self) -> &str {
        PRINCIPLE_ID
    }

    fn evaluate(&self, task: &Task, ctx: &EvaluationContext) -> Result<PolicyCheckResult, CheckError> {
        let cost = task.estimated_cost;
        // NaN or negative estimates are refused as well.
        if cost >= 0.0 && cost <= ctx.remaining_budget {
            return Ok(PolicyCheckResult::pass(PRINCIPLE_ID));
        }
        Ok(PolicyCheckResult::fail(
            PRINCIPLE_ID,
            Severity::Critical,
            format!(
                "estimated cost {cost:.2} exceeds remaining budget {:.2}",
                ctx.remaining_budget
            ),
        )
        .non_retryable())
    }
}
