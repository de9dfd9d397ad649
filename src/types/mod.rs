//! Core types for zero/one equation systems.
//!
//! A system is a list of equations, each meaning "sum of terms = 1". Terms
//! are products of one or two variables; variables are tagged with a label
//! (a variable class such as `p` or `q`) and a positive index.

pub mod variable;
pub mod term;
pub mod equation;
pub mod system;

pub use variable::Variable;
pub use term::Term;
pub use equation::{Equation, Signature};
pub use system::{CanonicalSystem, System};
