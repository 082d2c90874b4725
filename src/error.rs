//! Engine-level error types.
//!
//! One error enum covers definition validation, expression evaluation,
//! and execution. Gate rejection is deliberately absent: a rejected
//! approval is the `Cancelled` instance status, not an error.

use thiserror::Error;

/// Errors produced by the workflow engine.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Definition validation ------

    /// The definition declares no jobs.
    #[error("workflow has no jobs")]
    EmptyWorkflow,

    /// Two jobs share the same identifier.
    #[error("duplicate job id: '{0}'")]
    DuplicateJobId(String),

    /// A `needs` entry references a job that does not exist.
    #[error("job '{job}' needs unknown job '{reference}'")]
    UnknownNeeds { job: String, reference: String },

    /// A job lists itself in `needs`.
    #[error("job '{0}' depends on itself")]
    SelfNeeds(String),

    /// A job references a deployment environment that is not declared.
    #[error("job '{job}' references unknown environment '{environment}'")]
    UnknownEnvironment { job: String, environment: String },

    /// A step is malformed (no body, or both `run` and `uses`).
    #[error("job '{job}', step {index}: {message}")]
    InvalidStep {
        job: String,
        index: usize,
        message: String,
    },

    /// A matrix axis uses a name reserved for override entries.
    #[error("job '{job}': matrix axis may not be named '{axis}'")]
    ReservedAxisName { job: String, axis: String },

    /// The `needs` graph contains a cycle.
    #[error("workflow `needs` graph contains a cycle")]
    Cycle,

    // ------ Expressions ------

    /// A conditional or interpolation expression failed to parse.
    #[error("syntax error in expression '{expression}': {message}")]
    ExpressionSyntax {
        expression: String,
        message: String,
    },

    // ------ Execution ------

    /// A `uses:` step references an action missing from the registry.
    #[error("unknown action '{0}'")]
    UnknownAction(String),

    /// A composite action was invoked without a required input.
    #[error("action '{action}' requires input '{input}'")]
    MissingInput { action: String, input: String },

    /// A run step's command exited non-zero.
    #[error("step '{step}' failed with exit code {code:?}")]
    StepExecution { step: String, code: Option<i32> },

    /// A job instance attempted to publish its outputs twice.
    #[error("outputs for '{0}' were already published")]
    OutputAlreadyPublished(String),

    /// The scheduler's event channel was closed unexpectedly.
    #[error("engine event channel closed")]
    ChannelClosed,

    // ------ Hosting / I/O ------

    /// Filesystem error while loading definitions or running steps.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed workflow or actions YAML.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Report serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_cycle() {
        let err = EngineError::Cycle;
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_error_display_unknown_needs() {
        let err = EngineError::UnknownNeeds {
            job: "deploy".to_string(),
            reference: "bild".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("deploy"));
        assert!(msg.contains("bild"));
    }

    #[test]
    fn test_error_display_missing_input() {
        let err = EngineError::MissingInput {
            action: "setup".to_string(),
            input: "version".to_string(),
        };
        assert_eq!(err.to_string(), "action 'setup' requires input 'version'");
    }

    #[test]
    fn test_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: EngineError = io.into();
        assert!(matches!(err, EngineError::Io(_)));
    }
}
