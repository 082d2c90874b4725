//! Workflow Loading
//!
//! Loads workflow definitions and composite action files from YAML.
//! Parsing stops at the data model: expression text inside `${{ }}`
//! regions stays opaque here and is evaluated at execution time.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::{debug, info};

use crate::error::EngineError;

use super::action::{Action, ActionRegistry};
use super::model::WorkflowDefinition;
use super::validator::validate_definition;

/// Loads a workflow definition from a YAML file.
///
/// This function:
/// 1. Reads and parses the YAML file
/// 2. Validates references and step shapes
///
/// Cycle detection happens later, when the execution graph is built.
///
/// # Example
///
/// ```rust,no_run
/// use conveyor::workflow::load_workflow;
///
/// fn main() -> Result<(), conveyor::EngineError> {
///     let def = load_workflow("pipeline.yaml")?;
///     println!("Loaded {} jobs", def.jobs.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<WorkflowDefinition, EngineError> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let yaml = fs::read_to_string(path)?;
    debug!("Workflow YAML loaded ({} bytes)", yaml.len());

    let mut def: WorkflowDefinition = serde_yaml::from_str(&yaml)?;
    if def.name.is_empty() {
        def.name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("workflow")
            .to_string();
    }

    validate_definition(&def)?;

    info!(
        "Workflow '{}' loaded: {} jobs, {} environments",
        def.name,
        def.jobs.len(),
        def.environments.len()
    );
    Ok(def)
}

/// Parses a workflow definition from YAML text and validates it.
pub fn parse_workflow(yaml: &str) -> Result<WorkflowDefinition, EngineError> {
    let def: WorkflowDefinition = serde_yaml::from_str(yaml)?;
    validate_definition(&def)?;
    Ok(def)
}

/// Loads composite actions from a YAML file mapping name -> action.
pub fn load_actions(path: impl AsRef<Path>) -> Result<ActionRegistry, EngineError> {
    let path = path.as_ref();
    info!("Loading actions from: {}", path.display());

    let yaml = fs::read_to_string(path)?;
    let actions: HashMap<String, Action> = serde_yaml::from_str(&yaml)?;

    info!("Loaded {} actions", actions.len());
    Ok(ActionRegistry::from(actions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
name: ci
on: [push]
env:
  LOG_LEVEL: info
jobs:
  build:
    runs-on: linux
    steps:
      - id: compile
        run: make build
    outputs:
      artifact: ${{ steps.compile.outputs.artifact }}
  test:
    runs-on: linux
    needs: [build]
    steps:
      - run: make test
"#;

    #[test]
    fn test_parse_workflow_ok() {
        let def = parse_workflow(SAMPLE).unwrap();
        assert_eq!(def.name, "ci");
        assert_eq!(def.jobs.len(), 2);
        assert_eq!(def.env.get("LOG_LEVEL").unwrap(), "info");
    }

    #[test]
    fn test_parse_workflow_invalid_reference() {
        let yaml = r#"
jobs:
  test:
    needs: [ghost]
    steps:
      - run: make test
"#;
        assert!(matches!(
            parse_workflow(yaml),
            Err(EngineError::UnknownNeeds { .. })
        ));
    }

    #[test]
    fn test_parse_workflow_bad_yaml() {
        assert!(matches!(
            parse_workflow("jobs: ["),
            Err(EngineError::Yaml(_))
        ));
    }

    #[test]
    fn test_load_workflow_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        fs::write(&path, SAMPLE).unwrap();

        let def = load_workflow(&path).unwrap();
        assert_eq!(def.jobs[0].id, "build");
    }

    #[test]
    fn test_load_workflow_default_name_from_stem() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nightly.yaml");
        fs::write(
            &path,
            "jobs:\n  a:\n    steps:\n      - run: 'true'\n",
        )
        .unwrap();

        let def = load_workflow(&path).unwrap();
        assert_eq!(def.name, "nightly");
    }

    #[test]
    fn test_load_workflow_missing_file() {
        assert!(matches!(
            load_workflow("/nonexistent/pipeline.yaml"),
            Err(EngineError::Io(_))
        ));
    }

    #[test]
    fn test_load_actions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("actions.yaml");
        fs::write(
            &path,
            r#"
setup:
  inputs:
    version:
      required: true
  steps:
    - run: ./install.sh ${{ inputs.version }}
"#,
        )
        .unwrap();

        let registry = load_actions(&path).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("setup").is_some());
    }
}
