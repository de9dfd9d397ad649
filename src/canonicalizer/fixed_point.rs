//! Fixed-point refinement: normalize, sort, rename, repeat.
//!
//! ```text
//! S ─▶ sort ─▶ rename ─▶ sort ─▶ rename ─▶ ... until a pass reproduces its input
//! ```
//!
//! Term normalization happens inside [`Equation::new`](crate::types::Equation::new),
//! so every rename re-normalizes the equations it rebuilds. Renaming can
//! change which equation sorts first, so one pass is not idempotent in
//! general; iteration is bounded by `max_iterations`.

use std::collections::HashMap;

use super::CanonicalizeError;
use crate::types::{System, Variable};

/// Steps 1-2: normalized equations sorted by `(signature, terms)`.
pub fn normalize_and_sort(system: &System) -> System {
    system.sorted()
}

/// Step 3: per label, renumber variables 1, 2, 3, ... in order of first
/// appearance, scanning equations, then terms, then variables in order.
pub fn rename_by_first_appearance(system: &System) -> System {
    let mut next_index: HashMap<&str, u32> = HashMap::new();
    let mut renamed: HashMap<&Variable, Variable> = HashMap::new();

    for var in system.equations().iter().flat_map(|eq| eq.variables()) {
        if renamed.contains_key(var) {
            continue;
        }
        let counter = next_index.entry(var.label()).or_insert(0);
        *counter += 1;
        renamed.insert(var, var.with_index(*counter));
    }

    system.map_variables(|v| renamed.get(v).cloned().unwrap_or_else(|| v.clone()))
}

/// Step 4: iterate sort+rename until a full pass is the identity.
pub fn fixed_point(system: &System, max_iterations: usize) -> Result<System, CanonicalizeError> {
    let mut current = normalize_and_sort(&rename_by_first_appearance(&normalize_and_sort(system)));

    for _ in 0..max_iterations {
        let next = normalize_and_sort(&rename_by_first_appearance(&current));
        if next == current {
            return Ok(current);
        }
        current = next;
    }

    Err(CanonicalizeError::FixedPointNotReached {
        iterations: max_iterations,
        system: current.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::parse_system;

    #[test]
    fn test_rename_is_per_label() {
        let system = parse_system(&["q7*p4 + p9", "q2"]).unwrap();
        let renamed = rename_by_first_appearance(&system);
        assert_eq!(renamed.to_string(), "p1*q1 + p2\nq2");
    }

    #[test]
    fn test_rename_is_consistent_across_equations() {
        let system = parse_system(&["a5 + a3", "a3*a5"]).unwrap();
        // Terms normalize to "a3 + a5" first, so a3 -> a1, a5 -> a2.
        let renamed = rename_by_first_appearance(&system);
        assert_eq!(renamed.to_string(), "a1 + a2\na1*a2");
    }

    #[test]
    fn test_fixed_point_is_stable() {
        let system = parse_system(&["b4 + a9*a2", "a2 + a9", "b4*b1 + a9"]).unwrap();
        let once = fixed_point(&system, 32).unwrap();
        let twice = fixed_point(&once, 32).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_fixed_point_sorts_equations_by_signature() {
        let system = parse_system(&["a1*a2 + a3", "a4"]).unwrap();
        let result = fixed_point(&system, 32).unwrap();
        // (0, 1) sorts before (1, 1)
        assert_eq!(result.equations()[0].signature().quadratic, 0);
    }

    #[test]
    fn test_zero_iterations_reports_cap() {
        // Needs at least one confirming pass, so a zero cap always fails.
        let system = parse_system(&["a2 + a1"]).unwrap();
        let err = fixed_point(&system, 0).unwrap_err();
        assert!(matches!(err, CanonicalizeError::FixedPointNotReached { iterations: 0, .. }));
    }
}
