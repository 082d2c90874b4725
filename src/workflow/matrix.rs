//! Matrix Expansion
//!
//! Expands a job's matrix specification into concrete axis combinations:
//! - Cross-product over the declared axes
//! - `exclude` entries remove matching combinations
//! - `include` entries extend matching combinations or add standalone ones
//!
//! One combination becomes one `JobInstance` in the execution graph.

use std::collections::BTreeMap;

use log::{debug, info};
use serde_json::Value;

use super::model::{scalar_to_string, Matrix};

/// One concrete matrix combination: axis (or include) name -> value.
pub type Combination = BTreeMap<String, Value>;

/// Policy for `include` entries whose axis keys overlap the declared axes
/// but match no existing combination (e.g. a value pair that was excluded
/// or never co-occurs). The documented behavior only covers full matches
/// and entries matching nothing; partial overlap is a configuration knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IncludeOverlap {
    /// Add the entry as a standalone combination (documented "no match adds")
    #[default]
    Add,
    /// Drop the entry and log it
    Ignore,
}

/// Expands a matrix with the default partial-overlap policy.
pub fn expand(matrix: &Matrix) -> Vec<Combination> {
    expand_with(matrix, IncludeOverlap::default())
}

/// Expands a matrix into its concrete combinations.
///
/// Order of operations mirrors the documented platform behavior:
/// cross-product, then `exclude`, then `include`.
pub fn expand_with(matrix: &Matrix, overlap: IncludeOverlap) -> Vec<Combination> {
    let mut cells = cross_product(&matrix.axes);

    // Exclude runs against the base product only.
    for entry in &matrix.exclude {
        cells.retain(|cell| !entry_matches(cell, entry));
    }

    let axis_names: Vec<&str> = matrix.axes.iter().map(|(name, _)| name.as_str()).collect();

    for entry in &matrix.include {
        apply_include(&mut cells, entry, &axis_names, overlap);
    }

    info!(
        "Matrix expanded: {} axes, {} include, {} exclude -> {} combinations",
        matrix.axes.len(),
        matrix.include.len(),
        matrix.exclude.len(),
        cells.len()
    );

    cells
}

/// Cross-product of the declared axes, in declaration order per axis.
fn cross_product(axes: &[(String, Vec<Value>)]) -> Vec<Combination> {
    if axes.is_empty() {
        return Vec::new();
    }

    let mut cells: Vec<Combination> = vec![Combination::new()];
    for (name, values) in axes {
        let mut next = Vec::with_capacity(cells.len() * values.len());
        for cell in &cells {
            for value in values {
                let mut extended = cell.clone();
                extended.insert(name.clone(), value.clone());
                next.push(extended);
            }
        }
        cells = next;
    }
    cells
}

/// True when every key/value pair of `entry` is present in `cell`.
fn entry_matches(cell: &Combination, entry: &std::collections::HashMap<String, Value>) -> bool {
    entry.iter().all(|(k, v)| cell.get(k) == Some(v))
}

/// Applies one `include` entry.
///
/// The entry's keys split into axis keys (present among the declared
/// axes) and extra keys. Combinations matching every axis pair are
/// extended with the extra fields; an entry with no axis keys extends
/// every combination; an entry whose axis pairs match nothing is added
/// as a standalone combination (or dropped, per the overlap policy).
fn apply_include(
    cells: &mut Vec<Combination>,
    entry: &std::collections::HashMap<String, Value>,
    axis_names: &[&str],
    overlap: IncludeOverlap,
) {
    let axis_pairs: Vec<(&String, &Value)> = entry
        .iter()
        .filter(|(k, _)| axis_names.contains(&k.as_str()))
        .collect();
    let extra_pairs: Vec<(&String, &Value)> = entry
        .iter()
        .filter(|(k, _)| !axis_names.contains(&k.as_str()))
        .collect();

    if axis_pairs.is_empty() && !cells.is_empty() {
        // No axis keys: the extra fields apply to every combination.
        for cell in cells.iter_mut() {
            for (k, v) in &extra_pairs {
                cell.insert((*k).clone(), (*v).clone());
            }
        }
        debug!("Include entry extended all {} combinations", cells.len());
        return;
    }

    let mut matched = false;
    for cell in cells.iter_mut() {
        if axis_pairs.iter().all(|(k, v)| cell.get(*k) == Some(*v)) && !axis_pairs.is_empty() {
            for (k, v) in &extra_pairs {
                cell.insert((*k).clone(), (*v).clone());
            }
            matched = true;
        }
    }

    if matched {
        return;
    }

    // No combination carries this exact axis pairing.
    match overlap {
        IncludeOverlap::Add => {
            let cell: Combination = entry
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            debug!("Include entry added standalone combination {:?}", cell);
            cells.push(cell);
        }
        IncludeOverlap::Ignore => {
            debug!("Include entry matched nothing and was ignored: {:?}", entry);
        }
    }
}

/// Renders a combination for instance labels: `(v1, v2, ...)` with values
/// in sorted-key order, or an empty string for the empty combination.
pub fn combination_label(combination: &Combination) -> String {
    if combination.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = combination.values().map(scalar_to_string).collect();
    format!("({})", parts.join(", "))
}
