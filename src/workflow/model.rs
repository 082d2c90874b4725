//! Workflow Data Model
//!
//! Core data structures representing a declarative pipeline definition:
//! jobs, steps, matrices, triggers, and deployment environments.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: build-and-deploy
//! on:
//!   push:
//!     branches: [main, "releases/*"]
//!
//! env:
//!   CARGO_TERM_COLOR: always
//!
//! jobs:
//!   build:
//!     runs-on: linux
//!     strategy:
//!       fail-fast: true
//!       matrix:
//!         os: [ubuntu, macos]
//!         version: ["1.74", "1.75"]
//!     steps:
//!       - id: compile
//!         run: make build TARGET=${{ matrix.os }}
//!     outputs:
//!       artifact: ${{ steps.compile.outputs.artifact }}
//!
//!   deploy:
//!     runs-on: linux
//!     needs: [build]
//!     environment: production
//!     steps:
//!       - run: ./deploy.sh ${{ needs.build.outputs.artifact }}
//!
//! environments:
//!   production:
//!     reviewers: [alice, bob]
//!     approvals: 1
//!     branches: [main]
//! ```

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// A single step within a job.
///
/// A step is either a "run" step (literal command text) or a "uses" step
/// (reference to a reusable action with input bindings). Exactly one of
/// the two must be present; the validator enforces this.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Step {
    /// Optional identifier, required for other steps to reference outputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Optional display name for reports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Conditional expression; defaults to `success()` when absent
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub if_expr: Option<String>,

    /// Command text for a run step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,

    /// Action reference for a uses step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses: Option<String>,

    /// Input bindings for a uses step (values may be interpolated)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub with: HashMap<String, Value>,

    /// Per-step variable bindings; the only place `secrets.*` resolves
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

impl Step {
    /// Creates a run step with the given command.
    pub fn run(command: impl Into<String>) -> Self {
        Self {
            run: Some(command.into()),
            ..Self::default()
        }
    }

    /// Creates a uses step referencing an action.
    pub fn uses(action: impl Into<String>) -> Self {
        Self {
            uses: Some(action.into()),
            ..Self::default()
        }
    }

    /// Sets the step identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the conditional expression.
    pub fn with_if(mut self, expr: impl Into<String>) -> Self {
        self.if_expr = Some(expr.into());
        self
    }

    /// Adds an input binding (for uses steps).
    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.with.insert(name.into(), Value::String(value.into()));
        self
    }

    /// Adds a step-level variable binding.
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    /// Display name for logs and reports: explicit name, id, or a slug of
    /// the command / action reference.
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        if let Some(id) = &self.id {
            return id.clone();
        }
        if let Some(uses) = &self.uses {
            return format!("uses {}", uses);
        }
        let run = self.run.as_deref().unwrap_or("");
        let first = run.lines().next().unwrap_or("");
        if first.len() > 40 {
            format!("{}...", &first[..40])
        } else {
            first.to_string()
        }
    }
}

/// Matrix specification: named axes plus include/exclude overrides.
#[derive(Serialize, Debug, Clone, Default)]
pub struct Matrix {
    /// Axis name -> ordered value list, in declaration order
    pub axes: Vec<(String, Vec<Value>)>,

    /// Entries that extend matching combinations or add standalone ones
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<HashMap<String, Value>>,

    /// Entries that remove every combination matching all their pairs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<HashMap<String, Value>>,
}

impl Matrix {
    /// Returns true if the matrix declares no axes and no includes.
    pub fn is_empty(&self) -> bool {
        self.axes.is_empty() && self.include.is_empty()
    }
}

// A matrix is written in YAML as one mapping where `include` and `exclude`
// are reserved keys and every other key is an axis.
impl<'de> Deserialize<'de> for Matrix {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct MatrixVisitor;

        impl<'de> Visitor<'de> for MatrixVisitor {
            type Value = Matrix;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of matrix axes")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Matrix, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut matrix = Matrix::default();
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "include" => {
                            matrix.include = map.next_value()?;
                        }
                        "exclude" => {
                            matrix.exclude = map.next_value()?;
                        }
                        _ => {
                            let values: Vec<Value> = map.next_value()?;
                            matrix.axes.push((key, values));
                        }
                    }
                }
                Ok(matrix)
            }
        }

        deserializer.deserialize_map(MatrixVisitor)
    }
}

/// Expansion strategy attached to a job.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Strategy {
    /// Matrix axes to expand the job over
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix: Option<Matrix>,

    /// Whether one failing instance cancels its matrix siblings
    #[serde(rename = "fail-fast", default = "default_fail_fast")]
    pub fail_fast: bool,

    /// Cap on concurrently running instances of this job
    #[serde(
        rename = "max-parallel",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub max_parallel: Option<usize>,
}

fn default_fail_fast() -> bool {
    true
}

impl Default for Strategy {
    fn default() -> Self {
        Self {
            matrix: None,
            fail_fast: true,
            max_parallel: None,
        }
    }
}

/// A declared unit of work: an ordered step sequence plus scheduling
/// metadata (`needs`, conditional, environment gate, matrix strategy).
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Job {
    /// Unique identifier (the key in the `jobs:` mapping)
    #[serde(skip)]
    pub id: String,

    /// Runner label this job requires (informational for a local host)
    #[serde(rename = "runs-on", default)]
    pub runs_on: String,

    /// IDs of jobs that must reach a terminal state first
    #[serde(deserialize_with = "single_or_vec", default)]
    pub needs: Vec<String>,

    /// Job-level conditional; defaults to "all needs succeeded"
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub if_expr: Option<String>,

    /// Deployment environment gating this job, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,

    /// Matrix / fail-fast strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,

    /// Job-level variable bindings
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// Declared outputs: name -> expression over step outputs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub outputs: HashMap<String, String>,

    /// Ordered step sequence
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Job {
    /// Creates a job with the given id and steps.
    pub fn new(id: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: id.into(),
            steps,
            ..Self::default()
        }
    }

    /// Adds a dependency on another job.
    pub fn depends_on(mut self, job_id: impl Into<String>) -> Self {
        self.needs.push(job_id.into());
        self
    }

    /// Sets the job-level conditional expression.
    pub fn with_if(mut self, expr: impl Into<String>) -> Self {
        self.if_expr = Some(expr.into());
        self
    }

    /// Sets the deployment environment reference.
    pub fn with_environment(mut self, name: impl Into<String>) -> Self {
        self.environment = Some(name.into());
        self
    }

    /// Sets the expansion strategy.
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Declares a job output.
    pub fn with_output(mut self, name: impl Into<String>, expr: impl Into<String>) -> Self {
        self.outputs.insert(name.into(), expr.into());
        self
    }

    /// The strategy's fail-fast flag, defaulting to true.
    pub fn fail_fast(&self) -> bool {
        self.strategy.as_ref().map(|s| s.fail_fast).unwrap_or(true)
    }
}

/// One trigger: an event name plus an optional branch filter.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Trigger {
    /// Event name (push, pull_request, release, ...)
    pub event: String,

    /// Branch filters; empty means any ref. `prefix/*` matches by prefix.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<String>,
}

/// Deployment environment configuration backing an approval gate.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct EnvironmentSpec {
    /// Reviewers allowed to approve; empty means anyone
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reviewers: Vec<String>,

    /// Number of distinct approvals required
    #[serde(default = "default_approvals")]
    pub approvals: usize,

    /// Branch filters; a non-matching ref rejects the gate outright
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<String>,
}

fn default_approvals() -> usize {
    1
}

/// The event that triggered a run.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EventContext {
    /// Event name (push, pull_request, ...)
    pub event: String,

    /// Git ref the event points at
    #[serde(rename = "ref")]
    pub ref_name: String,

    /// User that caused the event
    pub actor: String,

    /// Commit id
    pub sha: String,

    /// Monotonic run counter supplied by the host
    pub run_number: u64,
}

impl Default for EventContext {
    fn default() -> Self {
        Self {
            event: "push".to_string(),
            ref_name: "refs/heads/main".to_string(),
            actor: String::new(),
            sha: String::new(),
            run_number: 1,
        }
    }
}

impl EventContext {
    /// Creates a context for the given event name.
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            ..Self::default()
        }
    }

    /// Sets the git ref.
    pub fn with_ref(mut self, ref_name: impl Into<String>) -> Self {
        self.ref_name = ref_name.into();
        self
    }

    /// Sets the actor.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    /// Short branch name: the ref with any `refs/heads/` prefix removed.
    pub fn branch(&self) -> &str {
        self.ref_name
            .strip_prefix("refs/heads/")
            .unwrap_or(&self.ref_name)
    }
}

/// A complete workflow definition. Immutable once loaded for a run.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct WorkflowDefinition {
    /// Human-readable workflow name
    #[serde(default)]
    pub name: String,

    /// Trigger predicate
    #[serde(rename = "on", deserialize_with = "triggers", default)]
    pub triggers: Vec<Trigger>,

    /// Workflow-level variable bindings
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// Ordered job list (YAML mapping, declaration order preserved)
    #[serde(deserialize_with = "jobs_map", default)]
    pub jobs: Vec<Job>,

    /// Deployment environments referenced by jobs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environments: HashMap<String, EnvironmentSpec>,
}

impl WorkflowDefinition {
    /// Creates a definition from a list of jobs.
    pub fn from_jobs(jobs: Vec<Job>) -> Self {
        Self {
            jobs,
            ..Self::default()
        }
    }

    /// Gets a job by id.
    pub fn get_job(&self, id: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    /// Evaluates the trigger predicate against an event.
    ///
    /// True when the event name matches a declared trigger and, if that
    /// trigger carries branch filters, the event's ref matches one of
    /// them. An empty trigger list accepts every event.
    pub fn matches_event(&self, event: &EventContext) -> bool {
        if self.triggers.is_empty() {
            return true;
        }
        self.triggers.iter().any(|t| {
            t.event == event.event
                && (t.branches.is_empty() || t.branches.iter().any(|b| branch_matches(b, event)))
        })
    }
}

/// Matches a branch filter against an event ref. Filters ending in `*`
/// match by prefix; otherwise the branch name must match exactly.
pub fn branch_matches(filter: &str, event: &EventContext) -> bool {
    let branch = event.branch();
    if let Some(prefix) = filter.strip_suffix('*') {
        branch.starts_with(prefix) || event.ref_name.starts_with(prefix)
    } else {
        branch == filter || event.ref_name == filter
    }
}

/// Renders a loosely-typed scalar (matrix value, action input) as the
/// string form used for interpolation and process environments.
pub fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Deserializes either a single string or an array of strings.
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("Expected string in array")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

/// Deserializes the `jobs:` mapping into an ordered `Vec<Job>`, assigning
/// each job its mapping key as the id.
fn jobs_map<'de, D>(deserializer: D) -> Result<Vec<Job>, D::Error>
where
    D: Deserializer<'de>,
{
    struct JobsVisitor;

    impl<'de> Visitor<'de> for JobsVisitor {
        type Value = Vec<Job>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a mapping of job id to job")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Vec<Job>, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut jobs = Vec::new();
            while let Some((id, mut job)) = map.next_entry::<String, Job>()? {
                job.id = id;
                jobs.push(job);
            }
            Ok(jobs)
        }
    }

    deserializer.deserialize_map(JobsVisitor)
}

/// Deserializes the `on:` field from a string, a list of strings, or a
/// mapping of event name to `{branches: [...]}`.
fn triggers<'de, D>(deserializer: D) -> Result<Vec<Trigger>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize, Default)]
    struct TriggerBody {
        #[serde(default)]
        branches: Vec<String>,
    }

    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(event) => Ok(vec![Trigger {
            event,
            branches: Vec::new(),
        }]),
        Value::Array(events) => events
            .into_iter()
            .map(|v| match v {
                Value::String(event) => Ok(Trigger {
                    event,
                    branches: Vec::new(),
                }),
                _ => Err(de::Error::custom("Expected event name")),
            })
            .collect(),
        Value::Object(map) => map
            .into_iter()
            .map(|(event, body)| {
                let body: TriggerBody = if body.is_null() {
                    TriggerBody::default()
                } else {
                    serde_json::from_value(body).map_err(de::Error::custom)?
                };
                Ok(Trigger {
                    event,
                    branches: body.branches,
                })
            })
            .collect(),
        _ => Err(de::Error::custom("Expected trigger spec")),
    }
}
