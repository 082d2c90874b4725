//! Workflow Validation
//!
//! Structural validation for workflow definitions before graph expansion:
//! - Job field and step body validation
//! - `needs` reference integrity
//! - Environment reference integrity
//! - Reserved matrix axis names
//!
//! Cycle detection lives with the graph builder; everything checked here
//! is about references and shapes, not ordering.

use std::collections::HashSet;

use log::{debug, info, warn};

use crate::error::EngineError;

use super::model::{Job, WorkflowDefinition};

/// Validates a single job's fields and steps.
fn validate_job(def: &WorkflowDefinition, job: &Job) -> Result<(), EngineError> {
    if job.needs.iter().any(|n| n == &job.id) {
        return Err(EngineError::SelfNeeds(job.id.clone()));
    }

    for need in &job.needs {
        if def.get_job(need).is_none() {
            return Err(EngineError::UnknownNeeds {
                job: job.id.clone(),
                reference: need.clone(),
            });
        }
    }

    if let Some(environment) = &job.environment {
        if !def.environments.contains_key(environment) {
            return Err(EngineError::UnknownEnvironment {
                job: job.id.clone(),
                environment: environment.clone(),
            });
        }
    }

    if let Some(matrix) = job.strategy.as_ref().and_then(|s| s.matrix.as_ref()) {
        for (axis, _) in &matrix.axes {
            if axis == "include" || axis == "exclude" {
                return Err(EngineError::ReservedAxisName {
                    job: job.id.clone(),
                    axis: axis.clone(),
                });
            }
        }
    }

    if job.steps.is_empty() {
        warn!("Job '{}' has no steps", job.id);
    }

    for (index, step) in job.steps.iter().enumerate() {
        match (&step.run, &step.uses) {
            (Some(_), Some(_)) => {
                return Err(EngineError::InvalidStep {
                    job: job.id.clone(),
                    index,
                    message: "step declares both `run` and `uses`".to_string(),
                });
            }
            (None, None) => {
                return Err(EngineError::InvalidStep {
                    job: job.id.clone(),
                    index,
                    message: "step declares neither `run` nor `uses`".to_string(),
                });
            }
            _ => {}
        }

        if !step.with.is_empty() && step.uses.is_none() {
            warn!(
                "Job '{}', step {}: `with` bindings have no effect on a run step",
                job.id, index
            );
        }
    }

    if job.needs.is_empty() {
        debug!("Job '{}' is a root job (no dependencies)", job.id);
    }

    Ok(())
}

/// Validates the entire definition.
///
/// Performs the following checks:
/// 1. The definition declares at least one job
/// 2. Job ids are unique
/// 3. `needs` and `environment` references resolve
/// 4. Every step has exactly one body
/// 5. Matrix axes avoid the reserved override names
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), EngineError> {
    info!("Validating workflow with {} jobs", def.jobs.len());

    if def.jobs.is_empty() {
        return Err(EngineError::EmptyWorkflow);
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for job in &def.jobs {
        if !seen_ids.insert(job.id.as_str()) {
            return Err(EngineError::DuplicateJobId(job.id.clone()));
        }
    }

    for job in &def.jobs {
        validate_job(def, job)?;
    }

    info!(
        "Workflow validated: {} jobs, {} environments",
        def.jobs.len(),
        def.environments.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{EnvironmentSpec, Matrix, Step, Strategy};

    fn job(id: &str) -> Job {
        Job::new(id, vec![Step::run("true")])
    }

    #[test]
    fn test_validate_ok() {
        let def = WorkflowDefinition::from_jobs(vec![job("a"), job("b").depends_on("a")]);
        assert!(validate_definition(&def).is_ok());
    }

    #[test]
    fn test_empty_workflow_rejected() {
        let def = WorkflowDefinition::default();
        assert!(matches!(
            validate_definition(&def),
            Err(EngineError::EmptyWorkflow)
        ));
    }

    #[test]
    fn test_duplicate_job_id_rejected() {
        let def = WorkflowDefinition::from_jobs(vec![job("a"), job("a")]);
        assert!(matches!(
            validate_definition(&def),
            Err(EngineError::DuplicateJobId(_))
        ));
    }

    #[test]
    fn test_unknown_needs_rejected() {
        let def = WorkflowDefinition::from_jobs(vec![job("a").depends_on("ghost")]);
        match validate_definition(&def) {
            Err(EngineError::UnknownNeeds { job, reference }) => {
                assert_eq!(job, "a");
                assert_eq!(reference, "ghost");
            }
            other => panic!("Expected UnknownNeeds, got {:?}", other),
        }
    }

    #[test]
    fn test_self_needs_rejected() {
        let def = WorkflowDefinition::from_jobs(vec![job("a").depends_on("a")]);
        assert!(matches!(
            validate_definition(&def),
            Err(EngineError::SelfNeeds(_))
        ));
    }

    #[test]
    fn test_unknown_environment_rejected() {
        let def = WorkflowDefinition::from_jobs(vec![job("deploy").with_environment("prod")]);
        assert!(matches!(
            validate_definition(&def),
            Err(EngineError::UnknownEnvironment { .. })
        ));
    }

    #[test]
    fn test_known_environment_accepted() {
        let mut def = WorkflowDefinition::from_jobs(vec![job("deploy").with_environment("prod")]);
        def.environments
            .insert("prod".to_string(), EnvironmentSpec::default());
        assert!(validate_definition(&def).is_ok());
    }

    #[test]
    fn test_step_with_both_bodies_rejected() {
        let bad = Step {
            run: Some("true".to_string()),
            uses: Some("cache".to_string()),
            ..Step::default()
        };
        let def = WorkflowDefinition::from_jobs(vec![Job::new("a", vec![bad])]);
        assert!(matches!(
            validate_definition(&def),
            Err(EngineError::InvalidStep { .. })
        ));
    }

    #[test]
    fn test_step_with_no_body_rejected() {
        let def = WorkflowDefinition::from_jobs(vec![Job::new("a", vec![Step::default()])]);
        assert!(matches!(
            validate_definition(&def),
            Err(EngineError::InvalidStep { .. })
        ));
    }

    #[test]
    fn test_reserved_axis_name_rejected() {
        let strategy = Strategy {
            matrix: Some(Matrix {
                axes: vec![("include".to_string(), vec![serde_json::json!("x")])],
                include: Vec::new(),
                exclude: Vec::new(),
            }),
            ..Strategy::default()
        };
        let def = WorkflowDefinition::from_jobs(vec![job("a").with_strategy(strategy)]);
        assert!(matches!(
            validate_definition(&def),
            Err(EngineError::ReservedAxisName { .. })
        ));
    }
}
