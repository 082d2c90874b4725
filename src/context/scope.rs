//! Layered Variable Scopes
//!
//! A `ScopeStack` is an ordered stack of name/value layers owned by one
//! job instance (workflow env, job env, sticky writes, per-step env).
//! Lookup resolves innermost-first; outer layers are never mutated by
//! inner ones. The one sanctioned mid-run write is the sticky bind
//! (env-file semantics), which lands in a dedicated layer that shadows
//! the job defaults for all remaining steps of the same instance.

use std::collections::HashMap;

use log::debug;

/// Reserved label for the sticky layer.
const STICKY_LAYER: &str = "sticky";

/// One named layer of variable bindings.
#[derive(Debug, Clone)]
pub struct Scope {
    /// Layer label, for diagnostics
    pub name: String,
    vars: HashMap<String, String>,
}

impl Scope {
    fn new(name: impl Into<String>, vars: HashMap<String, String>) -> Self {
        Self {
            name: name.into(),
            vars,
        }
    }
}

/// Ordered stack of variable layers, innermost last.
#[derive(Debug, Clone, Default)]
pub struct ScopeStack {
    layers: Vec<Scope>,
}

impl ScopeStack {
    /// Creates an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the stack for a job instance: workflow env, job env, and
    /// an initially-empty sticky layer on top.
    pub fn for_instance(
        workflow_env: HashMap<String, String>,
        job_env: HashMap<String, String>,
    ) -> Self {
        let mut stack = Self::new();
        stack.push("workflow", workflow_env);
        stack.push("job", job_env);
        stack.push(STICKY_LAYER, HashMap::new());
        stack
    }

    /// Pushes a named layer.
    pub fn push(&mut self, name: impl Into<String>, vars: HashMap<String, String>) {
        self.layers.push(Scope::new(name, vars));
    }

    /// Pops the innermost layer.
    pub fn pop(&mut self) -> Option<Scope> {
        self.layers.pop()
    }

    /// Number of layers.
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Resolves a name, innermost layer first.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.layers
            .iter()
            .rev()
            .find_map(|layer| layer.vars.get(name).map(String::as_str))
    }

    /// Binds a sticky variable: visible to later lookups through this
    /// stack, shadowing workflow/job layers but not step layers pushed
    /// above it. Creates the sticky layer if the stack has none.
    pub fn bind_sticky(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        debug!("Sticky bind: {}={}", name, value);

        if let Some(layer) = self
            .layers
            .iter_mut()
            .rev()
            .find(|layer| layer.name == STICKY_LAYER)
        {
            layer.vars.insert(name, value);
            return;
        }

        let mut vars = HashMap::new();
        vars.insert(name, value);
        self.push(STICKY_LAYER, vars);
    }

    /// Flattens the stack into one map, inner layers overriding outer.
    /// Used to assemble a step's process environment.
    pub fn flatten(&self) -> HashMap<String, String> {
        let mut merged = HashMap::new();
        for layer in &self.layers {
            for (k, v) in &layer.vars {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_innermost_wins() {
        let mut stack = ScopeStack::new();
        stack.push("workflow", vars(&[("LEVEL", "workflow"), ("ONLY_OUTER", "x")]));
        stack.push("job", vars(&[("LEVEL", "job")]));

        assert_eq!(stack.resolve("LEVEL"), Some("job"));
        assert_eq!(stack.resolve("ONLY_OUTER"), Some("x"));
        assert_eq!(stack.resolve("MISSING"), None);
    }

    #[test]
    fn test_pop_restores_outer() {
        let mut stack = ScopeStack::new();
        stack.push("job", vars(&[("LEVEL", "job")]));
        stack.push("step", vars(&[("LEVEL", "step")]));

        assert_eq!(stack.resolve("LEVEL"), Some("step"));
        stack.pop();
        assert_eq!(stack.resolve("LEVEL"), Some("job"));
    }

    #[test]
    fn test_sticky_shadows_job_env() {
        let mut stack =
            ScopeStack::for_instance(vars(&[("A", "workflow")]), vars(&[("A", "job")]));
        assert_eq!(stack.resolve("A"), Some("job"));

        stack.bind_sticky("A", "sticky");
        assert_eq!(stack.resolve("A"), Some("sticky"));
    }

    #[test]
    fn test_step_layer_shadows_sticky() {
        let mut stack = ScopeStack::for_instance(HashMap::new(), HashMap::new());
        stack.bind_sticky("A", "sticky");

        stack.push("step", vars(&[("A", "step")]));
        assert_eq!(stack.resolve("A"), Some("step"));

        stack.pop();
        assert_eq!(stack.resolve("A"), Some("sticky"));
    }

    #[test]
    fn test_sticky_bind_under_step_layer() {
        // A sticky bind while a step layer is pushed must land in the
        // sticky layer, not the step layer.
        let mut stack = ScopeStack::for_instance(HashMap::new(), HashMap::new());
        stack.push("step", HashMap::new());
        stack.bind_sticky("NEW", "value");
        stack.pop();

        assert_eq!(stack.resolve("NEW"), Some("value"));
    }

    #[test]
    fn test_sticky_without_layer_creates_one() {
        let mut stack = ScopeStack::new();
        stack.bind_sticky("A", "1");
        assert_eq!(stack.resolve("A"), Some("1"));
    }

    #[test]
    fn test_flatten_inner_overrides() {
        let mut stack = ScopeStack::new();
        stack.push("workflow", vars(&[("A", "outer"), ("B", "outer")]));
        stack.push("step", vars(&[("A", "inner")]));

        let flat = stack.flatten();
        assert_eq!(flat.get("A").unwrap(), "inner");
        assert_eq!(flat.get("B").unwrap(), "outer");
    }

    #[test]
    fn test_isolated_stacks_do_not_share_sticky() {
        let mut a = ScopeStack::for_instance(HashMap::new(), HashMap::new());
        let b = ScopeStack::for_instance(HashMap::new(), HashMap::new());

        a.bind_sticky("ONLY_A", "1");
        assert_eq!(a.resolve("ONLY_A"), Some("1"));
        assert_eq!(b.resolve("ONLY_A"), None);
    }
}
