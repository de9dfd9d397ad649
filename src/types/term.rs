//! Term type: a product of one or two variables.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::variable::Variable;

/// A linear or quadratic monomial.
///
/// Variant order matters: the derived `Ord` places every quadratic term
/// before every linear term, and compares same-kind terms lexicographically
/// on their variables. A quadratic term always stores its pair sorted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Term {
    /// Product of two variables, stored as `(min, max)`.
    Quadratic(Variable, Variable),
    /// A single variable.
    Linear(Variable),
}

impl Term {
    /// Create a linear term.
    pub fn linear(var: Variable) -> Self {
        Self::Linear(var)
    }

    /// Create a quadratic term with its pair in canonical order.
    pub fn quadratic(a: Variable, b: Variable) -> Self {
        if a <= b {
            Self::Quadratic(a, b)
        } else {
            Self::Quadratic(b, a)
        }
    }

    /// Build a term from 1 or 2 variables. Any other length yields `None`.
    pub fn from_variables(mut vars: Vec<Variable>) -> Option<Self> {
        match vars.len() {
            1 => vars.pop().map(Self::Linear),
            2 => {
                let b = vars.pop()?;
                let a = vars.pop()?;
                Some(Self::quadratic(a, b))
            }
            _ => None,
        }
    }

    /// Whether this is a linear term.
    pub fn is_linear(&self) -> bool {
        matches!(self, Self::Linear(_))
    }

    /// The variables in stored order.
    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        let (first, second) = match self {
            Self::Quadratic(a, b) => (a, Some(b)),
            Self::Linear(a) => (a, None),
        };
        std::iter::once(first).chain(second)
    }

    /// Apply a variable mapping, re-normalizing the pair order.
    pub fn map_variables<F>(&self, mut f: F) -> Self
    where
        F: FnMut(&Variable) -> Variable,
    {
        match self {
            Self::Quadratic(a, b) => Self::quadratic(f(a), f(b)),
            Self::Linear(a) => Self::Linear(f(a)),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Quadratic(a, b) => write!(f, "{}*{}", a, b),
            Self::Linear(a) => write!(f, "{}", a),
        }
    }
}
