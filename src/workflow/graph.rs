//! Dependency Graph Builder
//!
//! Expands every job against its matrix and links `needs` references into
//! a directed acyclic graph of executable job instances:
//! - One `JobInstance` node per matrix combination
//! - `needs` edges fan out to every instance of the referenced job
//! - Cycle detection (Kahn's algorithm) before anything is scheduled

use std::collections::{HashMap, VecDeque};

use log::{debug, info};
use serde::Serialize;

use crate::error::EngineError;

use super::matrix::{self, Combination};
use super::model::WorkflowDefinition;

/// Scheduling status of one job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Waiting for `needs` predecessors
    Pending,
    /// Eligible but held by an environment gate
    Blocked,
    /// Currently executing
    Running,
    /// All steps completed successfully
    #[serde(rename = "success")]
    Succeeded,
    /// A step failed
    #[serde(rename = "failure")]
    Failed,
    /// Conditional evaluated false or a predecessor did not succeed
    Skipped,
    /// Cancelled by fail-fast, gate rejection, or the host
    Cancelled,
}

impl InstanceStatus {
    /// True once the instance can never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    /// Lowercase name used in reports and the `needs.<job>.result` context.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Blocked => "blocked",
            Self::Running => "running",
            Self::Succeeded => "success",
            Self::Failed => "failure",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One concrete expansion of a job for a specific matrix combination.
///
/// Instances of the same job share its `needs` edges but are otherwise
/// independent units of scheduling.
#[derive(Debug, Clone)]
pub struct JobInstance {
    /// Unique label, e.g. `build (ubuntu, 1.74)`
    pub id: String,

    /// The declaring job's id
    pub job_id: String,

    /// Resolved matrix combination (empty for non-matrix jobs)
    pub matrix: Combination,

    /// Current scheduling status; mutated only by the scheduler
    pub status: InstanceStatus,
}

/// The expanded execution DAG for one run.
pub struct ExecutionGraph {
    instances: Vec<JobInstance>,
    /// Per instance: indices of the instances it needs
    deps: Vec<Vec<usize>>,
    /// Job id -> indices of its instances
    by_job: HashMap<String, Vec<usize>>,
}

impl ExecutionGraph {
    /// Expands a definition into its execution graph.
    ///
    /// Fails with [`EngineError::Cycle`] when the job-level `needs` graph
    /// is not acyclic; nothing is scheduled in that case. Unknown `needs`
    /// references are the validator's concern and are ignored here.
    pub fn build(def: &WorkflowDefinition) -> Result<Self, EngineError> {
        check_acyclic(def)?;

        let mut instances = Vec::new();
        let mut by_job: HashMap<String, Vec<usize>> = HashMap::new();

        for job in &def.jobs {
            let combinations = match job.strategy.as_ref().and_then(|s| s.matrix.as_ref()) {
                Some(m) => matrix::expand(m),
                None => vec![Combination::new()],
            };

            for combination in combinations {
                let label = matrix::combination_label(&combination);
                let id = if label.is_empty() {
                    job.id.clone()
                } else {
                    format!("{} {}", job.id, label)
                };

                debug!("Instance '{}' created", id);
                by_job.entry(job.id.clone()).or_default().push(instances.len());
                instances.push(JobInstance {
                    id,
                    job_id: job.id.clone(),
                    matrix: combination,
                    status: InstanceStatus::Pending,
                });
            }
        }

        // Fan out: every instance needs every instance of each needed job.
        let mut deps = vec![Vec::new(); instances.len()];
        for job in &def.jobs {
            let own = by_job.get(&job.id).cloned().unwrap_or_default();
            for need in &job.needs {
                if let Some(targets) = by_job.get(need) {
                    for &idx in &own {
                        deps[idx].extend(targets.iter().copied());
                    }
                }
            }
        }

        info!(
            "Execution graph built: {} jobs -> {} instances",
            def.jobs.len(),
            instances.len()
        );

        Ok(Self {
            instances,
            deps,
            by_job,
        })
    }

    /// Number of instances in the graph.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// True when the graph has no instances.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// All instances, in expansion order.
    pub fn instances(&self) -> &[JobInstance] {
        &self.instances
    }

    /// One instance by index.
    pub fn instance(&self, idx: usize) -> &JobInstance {
        &self.instances[idx]
    }

    /// Sets an instance's status.
    pub fn set_status(&mut self, idx: usize, status: InstanceStatus) {
        debug!(
            "Instance '{}': {} -> {}",
            self.instances[idx].id, self.instances[idx].status, status
        );
        self.instances[idx].status = status;
    }

    /// Indices of the instances `idx` depends on.
    pub fn deps_of(&self, idx: usize) -> &[usize] {
        &self.deps[idx]
    }

    /// Indices of a job's instances.
    pub fn instances_of(&self, job_id: &str) -> &[usize] {
        self.by_job.get(job_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Matrix siblings of an instance (same job, other combinations).
    pub fn siblings_of(&self, idx: usize) -> Vec<usize> {
        self.instances_of(&self.instances[idx].job_id)
            .iter()
            .copied()
            .filter(|&i| i != idx)
            .collect()
    }

    /// True when every dependency of `idx` reached a terminal state.
    pub fn deps_terminal(&self, idx: usize) -> bool {
        self.deps[idx]
            .iter()
            .all(|&d| self.instances[d].status.is_terminal())
    }

    /// True when every instance reached a terminal state.
    pub fn all_terminal(&self) -> bool {
        self.instances.iter().all(|i| i.status.is_terminal())
    }

    /// Aggregate result of a job across its instances, as exposed through
    /// `needs.<job>.result`: any failure wins, then cancellation, then
    /// skips; a job whose every instance succeeded (or that expanded to
    /// nothing) reads as success.
    pub fn job_result(&self, job_id: &str) -> &'static str {
        let statuses: Vec<InstanceStatus> = self
            .instances_of(job_id)
            .iter()
            .map(|&i| self.instances[i].status)
            .collect();

        if statuses.iter().any(|s| *s == InstanceStatus::Failed) {
            "failure"
        } else if statuses.iter().any(|s| *s == InstanceStatus::Cancelled) {
            "cancelled"
        } else if statuses.iter().any(|s| *s == InstanceStatus::Skipped) {
            "skipped"
        } else {
            "success"
        }
    }
}

/// Cycle detection over the job-level `needs` graph (Kahn's algorithm).
fn check_acyclic(def: &WorkflowDefinition) -> Result<(), EngineError> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for job in &def.jobs {
        in_degree.entry(job.id.as_str()).or_insert(0);
        for need in &job.needs {
            // Unknown references are reported by the validator; skipping
            // them here keeps cycle detection independent of it.
            if def.get_job(need).is_none() {
                continue;
            }
            *in_degree.entry(job.id.as_str()).or_insert(0) += 1;
            dependents.entry(need.as_str()).or_default().push(&job.id);
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();

    let mut visited = 0;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        for &dep in dependents.get(id).map(Vec::as_slice).unwrap_or(&[]) {
            if let Some(degree) = in_degree.get_mut(dep) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dep);
                }
            }
        }
    }

    if visited != def.jobs.len() {
        return Err(EngineError::Cycle);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{Job, Matrix, Step, Strategy};
    use serde_json::json;

    fn job(id: &str) -> Job {
        Job::new(id, vec![Step::run("true")])
    }

    fn matrix_job(id: &str, axes: Vec<(&str, Vec<serde_json::Value>)>) -> Job {
        job(id).with_strategy(Strategy {
            matrix: Some(Matrix {
                axes: axes
                    .into_iter()
                    .map(|(name, values)| (name.to_string(), values))
                    .collect(),
                include: Vec::new(),
                exclude: Vec::new(),
            }),
            ..Strategy::default()
        })
    }

    #[test]
    fn test_build_single_instances() {
        let def = WorkflowDefinition::from_jobs(vec![job("a"), job("b")]);
        let graph = ExecutionGraph::build(&def).unwrap();

        assert_eq!(graph.len(), 2);
        assert_eq!(graph.instance(0).id, "a");
        assert!(graph.instance(0).matrix.is_empty());
    }

    #[test]
    fn test_build_matrix_instances() {
        let def = WorkflowDefinition::from_jobs(vec![matrix_job(
            "build",
            vec![("os", vec![json!("A"), json!("B")]), ("v", vec![json!(1), json!(2)])],
        )]);
        let graph = ExecutionGraph::build(&def).unwrap();

        assert_eq!(graph.len(), 4);
        assert_eq!(graph.instances_of("build").len(), 4);
        assert_eq!(graph.instance(0).id, "build (A, 1)");
    }

    #[test]
    fn test_needs_edges_fan_out() {
        let def = WorkflowDefinition::from_jobs(vec![
            matrix_job("build", vec![("os", vec![json!("A"), json!("B")])]),
            job("deploy").depends_on("build"),
        ]);
        let graph = ExecutionGraph::build(&def).unwrap();

        let deploy_idx = graph.instances_of("deploy")[0];
        assert_eq!(graph.deps_of(deploy_idx).len(), 2);
    }

    #[test]
    fn test_cycle_detected() {
        let def = WorkflowDefinition::from_jobs(vec![
            job("a").depends_on("b"),
            job("b").depends_on("a"),
        ]);
        assert!(matches!(
            ExecutionGraph::build(&def),
            Err(EngineError::Cycle)
        ));
    }

    #[test]
    fn test_self_cycle_detected() {
        let def = WorkflowDefinition::from_jobs(vec![job("a").depends_on("a")]);
        assert!(matches!(
            ExecutionGraph::build(&def),
            Err(EngineError::Cycle)
        ));
    }

    #[test]
    fn test_diamond_is_acyclic() {
        let def = WorkflowDefinition::from_jobs(vec![
            job("a"),
            job("b").depends_on("a"),
            job("c").depends_on("a"),
            job("d").depends_on("b").depends_on("c"),
        ]);
        let graph = ExecutionGraph::build(&def).unwrap();
        assert_eq!(graph.len(), 4);

        let d = graph.instances_of("d")[0];
        assert_eq!(graph.deps_of(d).len(), 2);
    }

    #[test]
    fn test_deps_terminal_tracking() {
        let def = WorkflowDefinition::from_jobs(vec![job("a"), job("b").depends_on("a")]);
        let mut graph = ExecutionGraph::build(&def).unwrap();

        let b = graph.instances_of("b")[0];
        assert!(!graph.deps_terminal(b));

        let a = graph.instances_of("a")[0];
        graph.set_status(a, InstanceStatus::Succeeded);
        assert!(graph.deps_terminal(b));
    }

    #[test]
    fn test_job_result_aggregation() {
        let def = WorkflowDefinition::from_jobs(vec![matrix_job(
            "build",
            vec![("os", vec![json!("A"), json!("B"), json!("C")])],
        )]);
        let mut graph = ExecutionGraph::build(&def).unwrap();
        let idxs: Vec<usize> = graph.instances_of("build").to_vec();

        for &i in &idxs {
            graph.set_status(i, InstanceStatus::Succeeded);
        }
        assert_eq!(graph.job_result("build"), "success");

        graph.set_status(idxs[1], InstanceStatus::Cancelled);
        assert_eq!(graph.job_result("build"), "cancelled");

        graph.set_status(idxs[0], InstanceStatus::Failed);
        assert_eq!(graph.job_result("build"), "failure");
    }

    #[test]
    fn test_status_terminal() {
        assert!(!InstanceStatus::Pending.is_terminal());
        assert!(!InstanceStatus::Blocked.is_terminal());
        assert!(!InstanceStatus::Running.is_terminal());
        assert!(InstanceStatus::Succeeded.is_terminal());
        assert!(InstanceStatus::Failed.is_terminal());
        assert!(InstanceStatus::Skipped.is_terminal());
        assert!(InstanceStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_all_terminal() {
        let def = WorkflowDefinition::from_jobs(vec![job("a")]);
        let mut graph = ExecutionGraph::build(&def).unwrap();
        assert!(!graph.all_terminal());

        graph.set_status(0, InstanceStatus::Skipped);
        assert!(graph.all_terminal());
    }
}
