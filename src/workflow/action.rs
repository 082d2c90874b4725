//! Composite Actions
//!
//! A composite action is a reusable, named step sequence with declared
//! inputs and outputs. Invoking one from a `uses:` step is equivalent to
//! splicing its steps into the caller's sequence under a nested variable
//! scope populated from the inputs.
//!
//! # Example YAML Format
//!
//! ```yaml
//! setup-toolchain:
//!   description: Install and report a toolchain
//!   inputs:
//!     version:
//!       required: true
//!     channel:
//!       default: stable
//!   steps:
//!     - id: install
//!       run: ./install.sh ${{ inputs.version }} ${{ inputs.channel }}
//!   outputs:
//!     toolchain: ${{ steps.install.outputs.toolchain }}
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::model::Step;

/// A declared action input.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ActionInput {
    /// Whether the caller must supply a value when no default exists
    #[serde(default)]
    pub required: bool,

    /// Fallback value when the caller supplies none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// A composite action definition.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Action {
    /// Optional description for listings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Declared inputs: name -> requirement and default
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inputs: HashMap<String, ActionInput>,

    /// Declared outputs: name -> expression over internal step outputs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub outputs: HashMap<String, String>,

    /// Ordered step sequence spliced into the caller
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// Name the step executor intercepts for cache restore/save behavior.
pub const CACHE_ACTION: &str = "cache";

/// Registry of composite actions available to `uses:` steps.
#[derive(Debug, Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Action>,
}

impl ActionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an action under a name, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, action: Action) {
        self.actions.insert(name.into(), action);
    }

    /// Looks up an action by name.
    pub fn get(&self, name: &str) -> Option<&Action> {
        self.actions.get(name)
    }

    /// Returns the number of registered actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns true if no actions are registered.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl From<HashMap<String, Action>> for ActionRegistry {
    fn from(actions: HashMap<String, Action>) -> Self {
        Self { actions }
    }
}
