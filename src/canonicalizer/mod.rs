//! Canonical form of an equation system.
//!
//! Maps any [`System`] to a [`CanonicalSystem`] that is invariant under:
//!
//! - permuting equations,
//! - permuting terms within an equation,
//! - swapping the two variables of a quadratic term,
//! - any per-label-consistent renumbering of variable indices.
//!
//! ## Algorithm
//!
//! ```text
//! System ─▶ OrderedPartition ─▶ relabeling candidates ─▶ fixed_point each ─▶ min
//! ```
//!
//! The core step is [`fixed_point::fixed_point`]: sort equations by
//! `(signature, terms)`, renumber variables per label by first appearance,
//! and repeat until a pass reproduces its input. On its own that step is a
//! heuristic tie-break: variables whose relative order is decided only by
//! their incoming indices can end up numbered differently for two relabeled
//! copies of the same system.
//!
//! To close that gap, the variables are first split into an ordered
//! partition computed from structure alone ([`partition::OrderedPartition`]).
//! Every relabeling consistent with that partition is fed to the fixed point,
//! and the smallest result wins. Relabeling the input relabels the partition
//! and yields the same candidate set, so the minimum is the same.
//!
//! When the candidate count exceeds `max_candidates` the canonicalizer falls
//! back to a single fixed-point pass and logs a warning. The result is still
//! a relabeling of the input, so deduplication stays sound; it can only fail
//! to merge two equivalent systems.

pub mod fixed_point;
pub mod partition;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec::render_pretty;
use crate::types::{CanonicalSystem, System};
use partition::OrderedPartition;

/// Default cap on fixed-point passes.
pub const DEFAULT_MAX_ITERATIONS: usize = 100;

/// Default cap on relabeling candidates (8!).
///
/// Every candidate costs one fixed-point run, so this bounds the worst case
/// per system. A bare 8-cycle `a1*a2, ..., a8*a1` has no twins and sits
/// exactly at the cap: 40,320 runs, on the order of a second in a release
/// build. Lower it through `canonicalizer.max_candidates` when throughput
/// matters more than merging highly symmetric systems.
pub const DEFAULT_MAX_CANDIDATES: u64 = 40_320;

/// Error type for canonicalization.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CanonicalizeError {
    /// Parsed input violates a model invariant.
    #[error("ill-formed system: {reason}")]
    IllFormed {
        /// What is wrong.
        reason: String,
    },
    /// The refinement did not settle within the iteration cap.
    #[error("fixed point not reached after {iterations} iterations; last state:\n{system}")]
    FixedPointNotReached {
        /// Iteration cap that was hit.
        iterations: usize,
        /// Serialized state at the cap, for diagnosis.
        system: String,
    },
}

/// Limits for the canonicalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanonicalizerConfig {
    /// Maximum fixed-point passes per candidate.
    pub max_iterations: usize,
    /// Maximum relabeling candidates before falling back to a single pass.
    pub max_candidates: u64,
}

impl Default for CanonicalizerConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_candidates: DEFAULT_MAX_CANDIDATES,
        }
    }
}

/// Canonicalizer with configurable limits. Pure: no I/O, no shared state.
#[derive(Debug, Clone, Copy, Default)]
pub struct Canonicalizer {
    config: CanonicalizerConfig,
}

impl Canonicalizer {
    /// Create a canonicalizer with the given limits.
    pub fn new(config: CanonicalizerConfig) -> Self {
        Self { config }
    }

    /// The limits in use.
    pub fn config(&self) -> &CanonicalizerConfig {
        &self.config
    }

    /// Compute the canonical representative of `system`.
    pub fn canonicalize(&self, system: &System) -> Result<CanonicalSystem, CanonicalizeError> {
        validate(system)?;

        let partition = OrderedPartition::compute(system);
        let candidates = partition.candidate_count();

        if candidates > u128::from(self.config.max_candidates) {
            warn!(
                candidates = %candidates,
                cap = %self.config.max_candidates,
                system = %render_pretty(system),
                "Relabeling candidates over cap; using single fixed-point pass"
            );
            let fallback = fixed_point::fixed_point(system, self.config.max_iterations)?;
            return Ok(CanonicalSystem::from_canonical(fallback));
        }

        debug!(candidates = %candidates, "Canonicalizing");

        let mut best: Option<System> = None;
        partition.for_each_relabeling(|mapping| {
            let relabeled = system.map_variables(|v| mapping.get(v).cloned().unwrap_or_else(|| v.clone()));
            let candidate = fixed_point::fixed_point(&relabeled, self.config.max_iterations)?;
            if best.as_ref().map_or(true, |b| candidate < *b) {
                best = Some(candidate);
            }
            Ok::<(), CanonicalizeError>(())
        })?;

        // An empty partition still visits one (empty) relabeling.
        Ok(CanonicalSystem::from_canonical(best.unwrap_or_default()))
    }
}

/// Canonicalize with default limits.
pub fn canonicalize(system: &System) -> Result<CanonicalSystem, CanonicalizeError> {
    Canonicalizer::default().canonicalize(system)
}

fn validate(system: &System) -> Result<(), CanonicalizeError> {
    for (i, eq) in system.equations().iter().enumerate() {
        if eq.terms().is_empty() {
            return Err(CanonicalizeError::IllFormed {
                reason: format!("equation {} has no terms", i + 1),
            });
        }
        for var in eq.variables() {
            if var.index() == 0 {
                return Err(CanonicalizeError::IllFormed {
                    reason: format!("variable {} has index 0", var),
                });
            }
            if var.label().is_empty() || !var.label().chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(CanonicalizeError::IllFormed {
                    reason: format!("variable {} has an invalid label", var),
                });
            }
        }
    }
    Ok(())
}
