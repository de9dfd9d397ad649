//! Equation type and its signature.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::term::Term;
use super::variable::Variable;

/// Summary of an equation: `(quadratic count, linear count)`.
///
/// Ordered by quadratic count first, then linear count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Signature {
    /// Number of quadratic terms.
    pub quadratic: usize,
    /// Number of linear terms.
    pub linear: usize,
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.quadratic, self.linear)
    }
}

/// A normalized equation `t_1 + ... + t_r = 1`.
///
/// Terms are kept sorted (quadratic before linear, then lexicographic), and
/// the signature is cached. The derived `Ord` compares `(signature, terms)`,
/// which is exactly the equation sort key used by canonicalization.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Equation {
    signature: Signature,
    terms: Vec<Term>,
}

impl Equation {
    /// Create an equation, normalizing term order.
    pub fn new(mut terms: Vec<Term>) -> Self {
        terms.sort();
        let linear = terms.iter().filter(|t| t.is_linear()).count();
        let signature = Signature {
            quadratic: terms.len() - linear,
            linear,
        };
        Self { signature, terms }
    }

    /// The cached `(q, l)` signature.
    pub fn signature(&self) -> Signature {
        self.signature
    }

    /// Terms in normalized order.
    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    /// Variables in term order, with repetition.
    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.terms.iter().flat_map(Term::variables)
    }

    /// Apply a variable mapping and re-normalize.
    pub fn map_variables<F>(&self, mut f: F) -> Self
    where
        F: FnMut(&Variable) -> Variable,
    {
        Self::new(self.terms.iter().map(|t| t.map_variables(&mut f)).collect())
    }
}

impl fmt::Display for Equation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, term) in self.terms.iter().enumerate() {
            if i > 0 {
                f.write_str(" + ")?;
            }
            write!(f, "{}", term)?;
        }
        Ok(())
    }
}
