//! Step and Job Output Propagation
//!
//! Two distinct visibility rules live here:
//!
//! - [`StepOutputs`]: outputs captured per step, visible to *later steps
//!   of the same instance* immediately.
//! - [`OutputRegistry`]: the run-scoped, append-only table of published
//!   job outputs. An instance publishes exactly once, at completion;
//!   dependents read the table only through their declared `needs`.

use std::collections::{HashMap, HashSet};

use log::debug;

use crate::error::EngineError;

/// Per-step captured state within one job instance.
#[derive(Debug, Clone, Default)]
struct StepRecord {
    outputs: HashMap<String, String>,
    result: String,
}

/// Outputs and results of the steps that have run so far in one instance.
#[derive(Debug, Clone, Default)]
pub struct StepOutputs {
    steps: HashMap<String, StepRecord>,
}

impl StepOutputs {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one output of a step, effective immediately.
    pub fn set_output(
        &mut self,
        step_id: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) {
        let step_id = step_id.into();
        let name = name.into();
        let value = value.into();
        debug!("Step '{}' output: {}={}", step_id, name, value);
        self.steps
            .entry(step_id)
            .or_default()
            .outputs
            .insert(name, value);
    }

    /// Records a step's terminal result (success/failure/skipped).
    pub fn set_result(&mut self, step_id: impl Into<String>, result: impl Into<String>) {
        self.steps.entry(step_id.into()).or_default().result = result.into();
    }

    /// Looks up one step output.
    pub fn output(&self, step_id: &str, name: &str) -> Option<&str> {
        self.steps
            .get(step_id)
            .and_then(|record| record.outputs.get(name))
            .map(String::as_str)
    }

    /// Looks up a step's result.
    pub fn result(&self, step_id: &str) -> Option<&str> {
        self.steps
            .get(step_id)
            .map(|record| record.result.as_str())
            .filter(|r| !r.is_empty())
    }

    /// All outputs of one step.
    pub fn outputs_of(&self, step_id: &str) -> Option<&HashMap<String, String>> {
        self.steps.get(step_id).map(|record| &record.outputs)
    }
}

/// What a dependent instance sees of one needed job.
#[derive(Debug, Clone)]
pub struct NeedsJob {
    /// Aggregate result: success, failure, cancelled, or skipped
    pub result: String,
    /// Published outputs
    pub outputs: HashMap<String, String>,
}

/// Snapshot of the needed jobs' results and outputs, taken at dispatch.
/// Only jobs an instance declares in `needs` appear here.
#[derive(Debug, Clone, Default)]
pub struct NeedsSnapshot {
    jobs: HashMap<String, NeedsJob>,
}

impl NeedsSnapshot {
    /// Creates an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one needed job's view.
    pub fn insert(
        &mut self,
        job_id: impl Into<String>,
        result: impl Into<String>,
        outputs: HashMap<String, String>,
    ) {
        self.jobs.insert(
            job_id.into(),
            NeedsJob {
                result: result.into(),
                outputs,
            },
        );
    }

    /// Looks up one needed job.
    pub fn get(&self, job_id: &str) -> Option<&NeedsJob> {
        self.jobs.get(job_id)
    }

    /// True when no needs are recorded.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Run-scoped, append-only table of published job outputs.
///
/// Matrix siblings of one job merge into the same job entry (the last
/// completing instance wins per key); a single instance publishing twice
/// is an error.
#[derive(Debug, Default)]
pub struct OutputRegistry {
    published: HashMap<String, HashMap<String, String>>,
    publishers: HashSet<String>,
}

impl OutputRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes an instance's evaluated job outputs.
    pub fn publish(
        &mut self,
        job_id: &str,
        instance_id: &str,
        outputs: HashMap<String, String>,
    ) -> Result<(), EngineError> {
        if !self.publishers.insert(instance_id.to_string()) {
            return Err(EngineError::OutputAlreadyPublished(instance_id.to_string()));
        }
        if outputs.is_empty() {
            return Ok(());
        }

        debug!(
            "Publishing {} outputs for '{}' (instance '{}')",
            outputs.len(),
            job_id,
            instance_id
        );
        self.published
            .entry(job_id.to_string())
            .or_default()
            .extend(outputs);
        Ok(())
    }

    /// The published outputs of one job, if any.
    pub fn outputs_of(&self, job_id: &str) -> Option<&HashMap<String, String>> {
        self.published.get(job_id)
    }

    /// All published outputs, keyed by job, for the run report.
    pub fn all(&self) -> &HashMap<String, HashMap<String, String>> {
        &self.published
    }
}
