//! # zeroone-pipeline
//!
//! Canonicalization, deduplication and batched infeasibility proofs for
//! systems of zero/one quadratic equations.
//!
//! Each equation is a sum of linear and quadratic monomials set equal to 1.
//! The pipeline answers one question per generated system:
//!
//! > Is the ideal generated by `{ e - 1 : e in S }` the unit ideal over ℚ?
//!
//! ## Core Contract
//!
//! 1. Reduce every system to a canonical form invariant under equation order,
//!    term order, factor order and per-label variable renumbering
//! 2. Emit each canonical form once per run, in a deterministic order
//! 3. Prove each emitted system infeasible with an external algebra engine,
//!    in batches, localizing any failure to a single system
//!
//! ## Architecture
//!
//! ```text
//! Solver → Shells → Codec → Canonicalizer → DedupStream → Artifacts
//!                                                            ↓
//!                          ProcessPool ← VerificationBatcher ← Scripts
//!                               ↓
//!                       verified/ + ledger.jsonl
//! ```
//!
//! ## Determinism Guarantees
//!
//! - Same system under any of the symmetries → identical canonical form
//! - Emission order is fixed by (degree, shell order, in-file order)
//! - A completed artifact is never partially written; temp files are
//!   renamed into place only when complete

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod types;
pub mod codec;
pub mod canonical;
pub mod canonicalizer;
pub mod catalog;
pub mod dedup;
pub mod pool;
pub mod solver;
pub mod verify;
pub mod config;
pub mod pipeline;

// Re-exports
pub use types::{CanonicalSystem, Equation, Signature, System, Term, Variable};
pub use codec::{
    parse_equation, parse_system, parse_term, parse_variable, render_pretty, serialize,
    write_block, BlockReader, FormatError, RawBlock,
};
pub use canonical::{fingerprint_text, combine_fingerprints, Fingerprint};
pub use canonicalizer::{canonicalize, CanonicalizeError, Canonicalizer, CanonicalizerConfig};
pub use catalog::{
    all_pairs, pairs_of_degree, ArtifactLayout, MissingInputError, ShellCatalog, ShellKey,
    ShellLayout,
};
pub use dedup::{ArtifactWriter, DedupError, DedupStream, Emission, RunContext, StreamEvent};
pub use pool::{default_capacity, Job, JobFailure, JobReport, PoolError, ProcessPool};
pub use solver::{generate, SolverBackend, SolverCommand, SolverError};
pub use verify::{
    judge, AlgebraEngine, EngineCommand, EngineProtocolError, ParallelVerifier, SystemVerdict,
    VerificationBatcher, Verdict, VerifyError,
};
pub use config::{ConfigError, PipelineConfig};
pub use pipeline::{Pipeline, PipelineError};

/// Format version of shell files and canonical artifacts.
/// Increment on any change to the block grammar or canonical ordering.
pub const ARTIFACT_FORMAT_VERSION: &str = "1.0.0";
