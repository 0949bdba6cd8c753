// shared-types-rs/src/metrics.rs
// Compliance counters and the indicators derived from them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceCounts {
    pub total_tasks: u64,
    pub accepted: u64,
    pub first_pass_accepted: u64,
    /// Accepts keyed by the iteration index they were accepted at.
    pub accepted_by_iteration: BTreeMap<u32, u64>,
    pub escalated: u64,
    pub rejected: u64,
    /// Tasks whose artifacts were flagged by the completeness policy at least once.
    pub incomplete_tasks: u64,
    /// Failed findings per principle id, across all validation events.
    pub policy_violations: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComplianceMetricsSnapshot {
    /// accepted / total
    pub compliance_rate: f64,
    /// tasks ever flagged for completeness / total
    pub incompleteness_rate: f64,
    /// accepted at iteration 0 / total
    pub first_pass_rate: f64,
    pub meets_compliance_target: bool,
    pub meets_first_pass_target: bool,
    pub counts: ComplianceCounts,
    /// Completion time of the task that produced this snapshot.
    pub computed_at: Option<DateTime<Utc>>,
}

impl ComplianceMetricsSnapshot {
    /// Derives the indicators from a set of counters.
    ///
    /// With no completed tasks every rate is zero and no target is met.
    pub fn derive(
        counts: ComplianceCounts,
        compliance_target: f64,
        first_pass_target: f64,
        computed_at: Option<DateTime<Utc>>,
    ) -> Self {
        let ratio = |n: u64| {
            if counts.total_tasks == 0 {
                0.0
            } else {
                n as f64 / counts.total_tasks as f64
            }
        };
        let compliance_rate = ratio(counts.accepted);
        let incompleteness_rate = ratio(counts.incomplete_tasks);
        let first_pass_rate = ratio(counts.first_pass_accepted);
        let has_data = counts.total_tasks > 0;

        Self {
            compliance_rate,
            incompleteness_rate,
            first_pass_rate,
            meets_compliance_target: has_data && compliance_rate >= compliance_target,
            meets_first_pass_target: has_data && first_pass_rate >= first_pass_target,
            counts,
            computed_at,
        }
    }
}
