//! System and canonical-system types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::equation::{Equation, Signature};
use super::variable::Variable;
use crate::canonical::{fingerprint_text, Fingerprint};

/// An ordered list of equations: one combinatorial instance.
///
/// The derived `Ord` compares equation lists lexicographically, which is the
/// order used to pick the minimum among canonical candidates.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct System {
    equations: Vec<Equation>,
}

impl System {
    /// Create a system, keeping the given equation order.
    pub fn new(equations: Vec<Equation>) -> Self {
        Self { equations }
    }

    /// Equations in stored order.
    pub fn equations(&self) -> &[Equation] {
        &self.equations
    }

    /// Number of equations.
    pub fn len(&self) -> usize {
        self.equations.len()
    }

    /// Whether the system has no equations.
    pub fn is_empty(&self) -> bool {
        self.equations.is_empty()
    }

    /// Distinct variables, ordered by `(label, index)`.
    pub fn variables(&self) -> BTreeSet<&Variable> {
        self.equations.iter().flat_map(Equation::variables).collect()
    }

    /// Sorted list of equation signatures.
    ///
    /// Invariant under every relabeling and reordering, so two systems with
    /// different signatures can never share a canonical form.
    pub fn signature(&self) -> Vec<Signature> {
        let mut sigs: Vec<_> = self.equations.iter().map(Equation::signature).collect();
        sigs.sort();
        sigs
    }

    /// Copy with equations sorted by `(signature, terms)`.
    pub fn sorted(&self) -> Self {
        let mut equations = self.equations.clone();
        equations.sort();
        Self { equations }
    }

    /// Apply a variable mapping to every equation, keeping equation order.
    pub fn map_variables<F>(&self, mut f: F) -> Self
    where
        F: FnMut(&Variable) -> Variable,
    {
        Self {
            equations: self.equations.iter().map(|e| e.map_variables(&mut f)).collect(),
        }
    }
}

impl fmt::Display for System {
    /// One equation per line, no trailing terminator.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, eq) in self.equations.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{}", eq)?;
        }
        Ok(())
    }
}

/// The canonical representative of a system's equivalence class.
///
/// Only the canonicalizer (and artifact readers that re-canonicalize) can
/// construct one, so holding a `CanonicalSystem` means the form is final.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct CanonicalSystem(System);

impl CanonicalSystem {
    pub(crate) fn from_canonical(system: System) -> Self {
        Self(system)
    }

    /// Borrow the underlying system.
    pub fn as_system(&self) -> &System {
        &self.0
    }

    /// Stable fingerprint of the canonical serialization.
    pub fn fingerprint(&self) -> Fingerprint {
        fingerprint_text(&self.0.to_string())
    }
}

impl std::ops::Deref for CanonicalSystem {
    type Target = System;

    fn deref(&self) -> &System {
        &self.0
    }
}

impl fmt::Display for CanonicalSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
