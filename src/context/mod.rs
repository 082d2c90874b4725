//! Variable & Context Store
//!
//! Everything a running step or job conditional can see, and the rules
//! for how values move between scopes:
//!
//! - [`scope`]: the layered per-instance variable stack (workflow, job,
//!   sticky, step), including the env-file sticky bind
//! - [`outputs`]: step-output propagation within an instance and the
//!   run-scoped write-once job output registry
//! - [`secrets`]: the opaque secret store and log masking
//!
//! [`EvalContext`] assembles borrowed views of those pieces into the
//! read-only snapshot the expression evaluator works against.

pub mod outputs;
pub mod scope;
pub mod secrets;

pub use outputs::{NeedsJob, NeedsSnapshot, OutputRegistry, StepOutputs};
pub use scope::{Scope, ScopeStack};
pub use secrets::{SecretStore, MASK};

use std::collections::HashMap;

use log::warn;

use crate::expr::{ExprScope, StatusFlags, Value};
use crate::workflow::matrix::Combination;
use crate::workflow::model::EventContext;

/// Converts a loosely-typed definition scalar into an expression value.
pub fn json_to_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::String(s) => Value::Str(s.clone()),
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => n.as_f64().map(Value::Num).unwrap_or(Value::Empty),
        serde_json::Value::Null => Value::Empty,
        other => Value::Str(other.to_string()),
    }
}

/// Read-only context snapshot for expression evaluation.
///
/// Each namespace is an optional borrowed view; absent namespaces
/// resolve to [`Value::Empty`], matching the permissive interpolation
/// behavior. The `secrets` view is attached only while evaluating a
/// step's `env:` values — everywhere else the namespace reads empty.
#[derive(Default)]
pub struct EvalContext<'a> {
    scopes: Option<&'a ScopeStack>,
    matrix: Option<&'a Combination>,
    steps: Option<&'a StepOutputs>,
    needs: Option<&'a NeedsSnapshot>,
    event: Option<&'a EventContext>,
    inputs: Option<&'a HashMap<String, String>>,
    secrets: Option<&'a SecretStore>,
    status: StatusFlags,
}

impl<'a> EvalContext<'a> {
    /// Creates an empty context with a healthy status aggregate.
    pub fn new() -> Self {
        Self {
            status: StatusFlags::healthy(),
            ..Self::default()
        }
    }

    /// Attaches the variable scope stack (the `env` namespace).
    pub fn with_scopes(mut self, scopes: &'a ScopeStack) -> Self {
        self.scopes = Some(scopes);
        self
    }

    /// Attaches the matrix combination.
    pub fn with_matrix(mut self, matrix: &'a Combination) -> Self {
        self.matrix = Some(matrix);
        self
    }

    /// Attaches the instance's step outputs.
    pub fn with_steps(mut self, steps: &'a StepOutputs) -> Self {
        self.steps = Some(steps);
        self
    }

    /// Attaches the needs snapshot.
    pub fn with_needs(mut self, needs: &'a NeedsSnapshot) -> Self {
        self.needs = Some(needs);
        self
    }

    /// Attaches the triggering event.
    pub fn with_event(mut self, event: &'a EventContext) -> Self {
        self.event = Some(event);
        self
    }

    /// Attaches composite-action inputs (the `inputs` namespace).
    pub fn with_inputs(mut self, inputs: &'a HashMap<String, String>) -> Self {
        self.inputs = Some(inputs);
        self
    }

    /// Attaches the secret store. Only step `env:` evaluation does this.
    pub fn with_secrets(mut self, secrets: &'a SecretStore) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Sets the status aggregate feeding the built-in predicates.
    pub fn with_status(mut self, status: StatusFlags) -> Self {
        self.status = status;
        self
    }

    fn lookup_event(&self, field: &str) -> Value {
        let Some(event) = self.event else {
            return Value::Empty;
        };
        match field {
            "name" | "event" => Value::Str(event.event.clone()),
            "ref" => Value::Str(event.ref_name.clone()),
            "branch" => Value::Str(event.branch().to_string()),
            "actor" => Value::Str(event.actor.clone()),
            "sha" => Value::Str(event.sha.clone()),
            "run_number" => Value::Num(event.run_number as f64),
            _ => Value::Empty,
        }
    }
}

impl<'a> ExprScope for EvalContext<'a> {
    fn lookup(&self, path: &[&str]) -> Value {
        let Some((&head, rest)) = path.split_first() else {
            return Value::Empty;
        };

        match head {
            "env" => rest
                .first()
                .and_then(|name| self.scopes.and_then(|s| s.resolve(name)))
                .map(|v| Value::Str(v.to_string()))
                .unwrap_or(Value::Empty),

            "matrix" => rest
                .first()
                .and_then(|axis| self.matrix.and_then(|m| m.get(*axis)))
                .map(json_to_value)
                .unwrap_or(Value::Empty),

            "steps" => match rest {
                [step_id, "outputs", name] => self
                    .steps
                    .and_then(|s| s.output(step_id, name))
                    .map(|v| Value::Str(v.to_string()))
                    .unwrap_or(Value::Empty),
                [step_id, "result"] => self
                    .steps
                    .and_then(|s| s.result(step_id))
                    .map(|v| Value::Str(v.to_string()))
                    .unwrap_or(Value::Empty),
                _ => Value::Empty,
            },

            "needs" => match rest {
                [job_id, "outputs", name] => self
                    .needs
                    .and_then(|n| n.get(job_id))
                    .and_then(|job| job.outputs.get(*name))
                    .map(|v| Value::Str(v.clone()))
                    .unwrap_or(Value::Empty),
                [job_id, "result"] => self
                    .needs
                    .and_then(|n| n.get(job_id))
                    .map(|job| Value::Str(job.result.clone()))
                    .unwrap_or(Value::Empty),
                _ => Value::Empty,
            },

            "inputs" => rest
                .first()
                .and_then(|name| self.inputs.and_then(|i| i.get(*name)))
                .map(|v| Value::Str(v.clone()))
                .unwrap_or(Value::Empty),

            "event" => rest.first().map(|f| self.lookup_event(f)).unwrap_or(Value::Empty),

            "runner" => match rest.first() {
                Some(&"os") => Value::Str(std::env::consts::OS.to_string()),
                Some(&"arch") => Value::Str(std::env::consts::ARCH.to_string()),
                _ => Value::Empty,
            },

            "job" => match rest.first() {
                Some(&"status") => {
                    let status = if self.status.failure {
                        "failure"
                    } else if self.status.cancelled {
                        "cancelled"
                    } else {
                        "success"
                    };
                    Value::Str(status.to_string())
                }
                _ => Value::Empty,
            },

            "secrets" => match self.secrets {
                Some(store) => rest
                    .first()
                    .and_then(|name| store.get(name))
                    .map(|v| Value::Str(v.to_string()))
                    .unwrap_or(Value::Empty),
                None => {
                    warn!("secrets.* is only available in step env: blocks");
                    Value::Empty
                }
            },

            _ => Value::Empty,
        }
    }

    fn status(&self) -> StatusFlags {
        self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{evaluate, interpolate};
    use serde_json::json;

    #[test]
    fn test_env_namespace() {
        let mut stack = ScopeStack::new();
        stack.push("workflow", {
            let mut m = HashMap::new();
            m.insert("LOG".to_string(), "debug".to_string());
            m
        });
        let ctx = EvalContext::new().with_scopes(&stack);

        assert_eq!(ctx.lookup(&["env", "LOG"]), Value::Str("debug".into()));
        assert_eq!(ctx.lookup(&["env", "MISSING"]), Value::Empty);
    }

    #[test]
    fn test_matrix_namespace() {
        let mut combo = Combination::new();
        combo.insert("os".to_string(), json!("ubuntu"));
        combo.insert("version".to_string(), json!(2));
        let ctx = EvalContext::new().with_matrix(&combo);

        assert_eq!(ctx.lookup(&["matrix", "os"]), Value::Str("ubuntu".into()));
        assert_eq!(ctx.lookup(&["matrix", "version"]), Value::Num(2.0));
    }

    #[test]
    fn test_steps_namespace() {
        let mut steps = StepOutputs::new();
        steps.set_output("build", "artifact", "app.tar");
        steps.set_result("build", "success");
        let ctx = EvalContext::new().with_steps(&steps);

        assert_eq!(
            ctx.lookup(&["steps", "build", "outputs", "artifact"]),
            Value::Str("app.tar".into())
        );
        assert_eq!(
            ctx.lookup(&["steps", "build", "result"]),
            Value::Str("success".into())
        );
        assert_eq!(ctx.lookup(&["steps", "ghost", "outputs", "x"]), Value::Empty);
    }

    #[test]
    fn test_needs_namespace() {
        let mut needs = NeedsSnapshot::new();
        let mut outputs = HashMap::new();
        outputs.insert("version".to_string(), "1.2".to_string());
        needs.insert("build", "success", outputs);
        let ctx = EvalContext::new().with_needs(&needs);

        assert_eq!(
            ctx.lookup(&["needs", "build", "outputs", "version"]),
            Value::Str("1.2".into())
        );
        assert_eq!(
            ctx.lookup(&["needs", "build", "result"]),
            Value::Str("success".into())
        );
    }

    #[test]
    fn test_event_namespace() {
        let event = EventContext::new("push")
            .with_ref("refs/heads/main")
            .with_actor("alice");
        let ctx = EvalContext::new().with_event(&event);

        assert_eq!(ctx.lookup(&["event", "name"]), Value::Str("push".into()));
        assert_eq!(ctx.lookup(&["event", "branch"]), Value::Str("main".into()));
        assert_eq!(ctx.lookup(&["event", "actor"]), Value::Str("alice".into()));
        assert_eq!(ctx.lookup(&["event", "run_number"]), Value::Num(1.0));
    }

    #[test]
    fn test_secrets_gated() {
        let secrets = SecretStore::from_pairs([("TOKEN", "s3cr3t")]);

        // Without the store attached the namespace reads empty.
        let plain = EvalContext::new();
        assert_eq!(plain.lookup(&["secrets", "TOKEN"]), Value::Empty);

        let env_position = EvalContext::new().with_secrets(&secrets);
        assert_eq!(
            env_position.lookup(&["secrets", "TOKEN"]),
            Value::Str("s3cr3t".into())
        );
    }

    #[test]
    fn test_job_status() {
        let healthy = EvalContext::new();
        assert_eq!(
            healthy.lookup(&["job", "status"]),
            Value::Str("success".into())
        );

        let failed = EvalContext::new().with_status(StatusFlags {
            success: false,
            failure: true,
            cancelled: false,
        });
        assert_eq!(
            failed.lookup(&["job", "status"]),
            Value::Str("failure".into())
        );
    }

    #[test]
    fn test_unknown_namespace_is_empty() {
        let ctx = EvalContext::new();
        assert_eq!(ctx.lookup(&["nonsense", "path"]), Value::Empty);
        assert_eq!(ctx.lookup(&[]), Value::Empty);
    }

    #[test]
    fn test_evaluator_integration() {
        let mut combo = Combination::new();
        combo.insert("os".to_string(), json!("ubuntu"));
        let ctx = EvalContext::new().with_matrix(&combo);

        assert_eq!(
            evaluate("matrix.os == 'ubuntu'", &ctx).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            interpolate("image-${{ matrix.os }}", &ctx).unwrap(),
            "image-ubuntu"
        );
    }

    #[test]
    fn test_json_to_value() {
        assert_eq!(json_to_value(&json!("x")), Value::Str("x".into()));
        assert_eq!(json_to_value(&json!(2.5)), Value::Num(2.5));
        assert_eq!(json_to_value(&json!(true)), Value::Bool(true));
        assert_eq!(json_to_value(&json!(null)), Value::Empty);
    }
}
