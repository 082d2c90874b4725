//! Conveyor - Workflow Execution Engine
//!
//! A workflow execution engine for declarative CI pipelines: it
//! interprets a parsed pipeline definition (jobs, steps, dependency
//! graph, matrices, conditionals, environment gating, variable
//! propagation, caching) and executes it with correct ordering,
//! isolation, and data-flow semantics.
//!
//! # Architecture
//!
//! The library is organized into five main modules:
//!
//! - [`workflow`]: definition data model, YAML loading, validation,
//!   matrix expansion, and the `needs` execution graph
//! - [`expr`]: conditional and interpolation expression evaluation
//! - [`context`]: layered variable scopes, output propagation, secrets
//! - [`execution`]: the scheduler, step executor, gates, cache, report
//! - [`monitoring`]: execution timeline and resource sampling
//!
//! # Example
//!
//! ```rust,no_run
//! use conveyor::execution::Engine;
//! use conveyor::workflow::{load_workflow, EventContext};
//!
//! fn main() -> Result<(), conveyor::EngineError> {
//!     // Load a workflow from YAML
//!     let def = load_workflow("pipeline.yaml")?;
//!
//!     // Create the engine for a triggering event
//!     let event = EventContext::new("push").with_ref("refs/heads/main");
//!     let mut engine = Engine::new(def, event);
//!     engine.set_max_parallel(4);
//!     engine.set_working_dir("/data/workspace");
//!
//!     // Execute the run
//!     let report = engine.run()?;
//!     println!("{}", report.to_json()?);
//!     Ok(())
//! }
//! ```

pub mod context;
pub mod error;
pub mod execution;
pub mod expr;
pub mod monitoring;
pub mod workflow;

// Re-export commonly used types
pub use error::EngineError;
pub use execution::{Engine, RunReport};
pub use workflow::{load_workflow, EventContext, WorkflowDefinition};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Conveyor";
