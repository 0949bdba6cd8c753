// shared-types-rs/src/task.rs
// Generation tasks and the artifacts produced for them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::correction::Diagnosis;

/// A unit of work submitted to the pipeline.
///
/// Tasks are values: refinement produces a new task carrying the previous
/// feedback plus the new diagnosis, so earlier feedback is never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    /// The intended action, as handed to the generator.
    pub prompt: String,
    /// Number of executable units the caller asked for, when known.
    pub requested_units: Option<usize>,
    /// Estimated cost of one generation attempt.
    pub estimated_cost: f64,
    /// Caller-supplied budget; the guardian ceiling applies when absent.
    pub cost_budget: Option<f64>,
    /// Feedback accumulated from previous failed attempts, oldest first.
    #[serde(default)]
    pub refinements: Vec<String>,
}

impl Task {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            requested_units: None,
            estimated_cost: 0.0,
            cost_budget: None,
            refinements: Vec::new(),
        }
    }

    pub fn with_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    pub fn with_requested_units(mut self, units: usize) -> Self {
        self.requested_units = Some(units);
        self
    }

    pub fn with_estimated_cost(mut self, cost: f64) -> Self {
        self.estimated_cost = cost;
        self
    }

    pub fn with_cost_budget(mut self, budget: f64) -> Self {
        self.cost_budget = Some(budget);
        self
    }

    /// Returns the task to run on the next iteration, carrying the diagnosis
    /// as generator feedback.
    pub fn refined_with(&self, diagnosis: &Diagnosis) -> Task {
        let mut next = self.clone();
        next.refinements.push(diagnosis.feedback());
        next
    }
}

/// Generated content plus its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub content: String,
    pub task_id: String,
    pub iteration: u32,
    pub generator_id: String,
    /// Cost reported by the generator for this attempt.
    pub cost: f64,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(
        task_id: impl Into<String>,
        iteration: u32,
        generator_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            content: content.into(),
            task_id: task_id.into(),
            iteration,
            generator_id: generator_id.into(),
            cost: 0.0,
            created_at: Utc::now(),
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}
