//! Run Report
//!
//! The serializable record of one run: per-instance terminal status,
//! per-step records with masked logs, and the published job outputs.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::EngineError;
use crate::workflow::graph::InstanceStatus;
use crate::workflow::matrix::Combination;
use crate::workflow::model::EventContext;

/// Terminal status of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Completed successfully
    Success,
    /// Command exited non-zero or the step body failed
    Failure,
    /// Conditional evaluated false
    Skipped,
}

impl StepStatus {
    /// Lowercase name, as exposed through `steps.<id>.result`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Skipped => "skipped",
        }
    }
}

/// Record of one executed (or skipped) step.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    /// Display name
    pub name: String,
    /// Terminal status
    pub status: StepStatus,
    /// Exit code of a run step's command, when it ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Captured output, already masked
    #[serde(skip_serializing_if = "String::is_empty")]
    pub log: String,
}

impl StepReport {
    /// A skipped step.
    pub fn skipped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Skipped,
            exit_code: None,
            log: String::new(),
        }
    }

    /// A successful step.
    pub fn success(name: impl Into<String>, log: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Success,
            exit_code: Some(0),
            log: log.into(),
        }
    }

    /// A failed step.
    pub fn failure(name: impl Into<String>, exit_code: Option<i32>, log: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Failure,
            exit_code,
            log: log.into(),
        }
    }
}

/// Record of one job instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceReport {
    /// Instance label, e.g. `build (ubuntu, 1.74)`
    pub instance: String,
    /// Declaring job id
    pub job: String,
    /// Resolved matrix combination
    #[serde(skip_serializing_if = "Combination::is_empty")]
    pub matrix: Combination,
    /// Terminal status
    pub status: InstanceStatus,
    /// Failure summary, when the instance failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Per-step records, in execution order
    pub steps: Vec<StepReport>,
}

/// The final report for one run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    /// Workflow name
    pub workflow: String,
    /// The triggering event
    pub event: EventContext,
    /// False when the trigger predicate did not match (nothing ran)
    pub triggered: bool,
    /// Run start time
    pub started_at: DateTime<Utc>,
    /// Run end time
    pub finished_at: DateTime<Utc>,
    /// Per-instance records, in expansion order
    pub instances: Vec<InstanceReport>,
    /// Published job outputs, keyed by job id
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub outputs: HashMap<String, HashMap<String, String>>,
}

impl RunReport {
    /// True when no instance failed or was cancelled.
    pub fn success(&self) -> bool {
        !self.instances.iter().any(|i| {
            matches!(
                i.status,
                InstanceStatus::Failed | InstanceStatus::Cancelled
            )
        })
    }

    /// Instance counts: (succeeded, failed, skipped, cancelled).
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        let mut counts = (0, 0, 0, 0);
        for instance in &self.instances {
            match instance.status {
                InstanceStatus::Succeeded => counts.0 += 1,
                InstanceStatus::Failed => counts.1 += 1,
                InstanceStatus::Skipped => counts.2 += 1,
                InstanceStatus::Cancelled => counts.3 += 1,
                _ => {}
            }
        }
        counts
    }

    /// Looks up one instance's record by label.
    pub fn instance(&self, label: &str) -> Option<&InstanceReport> {
        self.instances.iter().find(|i| i.instance == label)
    }

    /// Serializes the report as pretty JSON.
    pub fn to_json(&self) -> Result<String, EngineError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report_with(statuses: &[InstanceStatus]) -> RunReport {
        RunReport {
            workflow: "ci".to_string(),
            event: EventContext::default(),
            triggered: true,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            instances: statuses
                .iter()
                .enumerate()
                .map(|(i, &status)| InstanceReport {
                    instance: format!("job-{}", i),
                    job: format!("job-{}", i),
                    matrix: Combination::new(),
                    status,
                    error: None,
                    steps: Vec::new(),
                })
                .collect(),
            outputs: HashMap::new(),
        }
    }

    #[test]
    fn test_success_when_all_succeeded_or_skipped() {
        let report = report_with(&[InstanceStatus::Succeeded, InstanceStatus::Skipped]);
        assert!(report.success());
    }

    #[test]
    fn test_failure_and_cancellation_fail_the_run() {
        assert!(!report_with(&[InstanceStatus::Failed]).success());
        assert!(!report_with(&[InstanceStatus::Cancelled]).success());
    }

    #[test]
    fn test_counts() {
        let report = report_with(&[
            InstanceStatus::Succeeded,
            InstanceStatus::Succeeded,
            InstanceStatus::Failed,
            InstanceStatus::Skipped,
            InstanceStatus::Cancelled,
        ]);
        assert_eq!(report.counts(), (2, 1, 1, 1));
    }

    #[test]
    fn test_to_json_statuses_lowercase() {
        let report = report_with(&[InstanceStatus::Succeeded]);
        let json = report.to_json().unwrap();
        assert!(json.contains("\"status\": \"success\""));
        assert!(json.contains("\"triggered\": true"));
    }

    #[test]
    fn test_step_report_constructors() {
        let skipped = StepReport::skipped("lint");
        assert_eq!(skipped.status, StepStatus::Skipped);
        assert!(skipped.exit_code.is_none());

        let failed = StepReport::failure("build", Some(2), "boom");
        assert_eq!(failed.status, StepStatus::Failure);
        assert_eq!(failed.exit_code, Some(2));
        assert_eq!(failed.log, "boom");
    }
}
