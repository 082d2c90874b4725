//! Expression Evaluation
//!
//! Evaluates the conditional and interpolation expressions that appear in
//! workflow definitions (`if:` conditions and `${{ ... }}` regions):
//!
//! - [`lexer`]: token scanning
//! - [`eval`]: the expression AST, parser, and evaluator
//!
//! Evaluation is side-effect-free and deterministic for a given context
//! snapshot. Unresolvable context paths produce [`Value::Empty`] rather
//! than an error (permissive interpolation); malformed syntax fails with
//! `EngineError::ExpressionSyntax`.

pub mod eval;
pub mod lexer;

pub use eval::{evaluate, evaluate_condition, Expr};

use crate::error::EngineError;

/// A scalar expression value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A string
    Str(String),
    /// A number (all numerics are f64, as in the source expressions)
    Num(f64),
    /// A boolean
    Bool(bool),
    /// An unresolved context path or explicit null
    Empty,
}

impl Value {
    /// Truthiness: non-empty strings, non-zero numbers, `true`.
    pub fn truthy(&self) -> bool {
        match self {
            Self::Str(s) => !s.is_empty(),
            Self::Num(n) => *n != 0.0,
            Self::Bool(b) => *b,
            Self::Empty => false,
        }
    }

    /// Renders the value for interpolation. Whole numbers drop the
    /// fractional part; `Empty` renders as the empty string.
    pub fn render(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            Self::Num(n) if n.fract() == 0.0 && n.is_finite() => format!("{}", *n as i64),
            Self::Num(n) => format!("{}", n),
            Self::Bool(b) => b.to_string(),
            Self::Empty => String::new(),
        }
    }

    /// Loose equality: numbers compare numerically (coercing numeric
    /// strings), booleans by value, `Empty` equals `Empty` and the empty
    /// string, everything else by string form.
    pub fn loose_eq(&self, other: &Value) -> bool {
        use Value::*;
        match (self, other) {
            (Empty, Empty) => true,
            (Empty, Str(s)) | (Str(s), Empty) => s.is_empty(),
            (Empty, _) | (_, Empty) => false,
            (Num(a), Num(b)) => a == b,
            (Num(a), Str(s)) | (Str(s), Num(a)) => {
                s.trim().parse::<f64>().map(|b| *a == b).unwrap_or(false)
            }
            (Bool(a), Bool(b)) => a == b,
            (a, b) => a.render() == b.render(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Num(n)
    }
}

/// Aggregate status of previously-run steps or `needs` jobs, feeding the
/// built-in predicates. `always()` ignores it entirely.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusFlags {
    /// True when nothing in the current scope failed or was cancelled
    pub success: bool,
    /// True when something in the current scope failed
    pub failure: bool,
    /// True when the current scope was cancelled
    pub cancelled: bool,
}

impl StatusFlags {
    /// Status for a fresh scope: nothing failed yet.
    pub fn healthy() -> Self {
        Self {
            success: true,
            failure: false,
            cancelled: false,
        }
    }
}

/// Read-only context snapshot an expression evaluates against.
pub trait ExprScope {
    /// Resolves a dotted context path (e.g. `["matrix", "os"]`).
    /// Unknown paths return [`Value::Empty`].
    fn lookup(&self, path: &[&str]) -> Value;

    /// Status aggregate for the built-in predicates.
    fn status(&self) -> StatusFlags;
}

/// Substitutes every `${{ ... }}` region in `text`.
///
/// Unresolved paths render as the empty string; an unterminated region
/// or malformed inner expression is a syntax error.
pub fn interpolate(text: &str, scope: &dyn ExprScope) -> Result<String, EngineError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("${{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        let end = after.find("}}").ok_or_else(|| EngineError::ExpressionSyntax {
            expression: text.to_string(),
            message: "unterminated ${{ region".to_string(),
        })?;

        let value = evaluate(&after[..end], scope)?;
        out.push_str(&value.render());
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}
