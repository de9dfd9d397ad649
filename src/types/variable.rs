//! Variable type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A variable: a class label plus a positive index.
///
/// Ordering is by `(label, index)`, which the derived `Ord` provides through
/// field declaration order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Variable {
    label: String,
    index: u32,
}

impl Variable {
    /// Create a variable from a label and index.
    ///
    /// The codec guarantees a non-empty alphabetic label and an index of at
    /// least 1 for parsed input; this constructor does not re-check.
    pub fn new(label: impl Into<String>, index: u32) -> Self {
        Self {
            label: label.into(),
            index,
        }
    }

    /// The variable class label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The index within the label's class.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Same label, different index.
    pub fn with_index(&self, index: u32) -> Self {
        Self::new(self.label.clone(), index)
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.label, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_by_label_then_index() {
        let a2 = Variable::new("a", 2);
        let a10 = Variable::new("a", 10);
        let b1 = Variable::new("b", 1);

        assert!(a2 < a10);
        assert!(a10 < b1);
    }

    #[test]
    fn test_display() {
        assert_eq!(Variable::new("p", 12).to_string(), "p12");
    }
}
