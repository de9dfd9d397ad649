//! Batched infeasibility proofs through an external algebra engine.
//!
//! ## Protocol
//!
//! ```text
//! systems ─▶ batches of N ─▶ one script ─▶ engine ─▶ N tokens
//!                                             │
//!                     accepted ◀── exit 0, empty stderr, N × "0"
//!                     otherwise ─▶ re-run each system alone
//! ```
//!
//! A batch is accepted only as a whole. Any deviation (non-zero exit,
//! anything on stderr, too few or too many tokens, a non-`0` token) is an
//! [`EngineProtocolError`] and sends every system of the batch to
//! isolation. A system that fails on its own is a counterexample: a
//! [`Verdict`], not an error. Infrastructure failures (spawn, I/O) are
//! [`VerifyError`]s and never turn into verdicts.

pub mod batcher;
pub mod engine;
pub mod ledger;
pub mod parallel;
pub mod script;

use std::io;
use std::path::PathBuf;

use serde::Serialize;

use crate::canonical::{combine_fingerprints, fingerprint_text, Fingerprint};
use crate::types::System;

pub use batcher::{BatchOutcome, VerificationBatcher, VerificationSummary};
pub use engine::{AlgebraEngine, EngineCommand, EngineRun};
pub use ledger::LedgerEntry;
pub use parallel::{ArtifactVerification, ParallelVerifier};
pub use script::{EngineScript, ScriptLayout};

/// Default number of systems per engine script.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Infrastructure failure while verifying.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// The engine could not be started.
    #[error("failed to start engine {engine}: {source}")]
    Spawn {
        /// Engine program.
        engine: String,
        /// Underlying error.
        source: io::Error,
    },
    /// Reading or writing a script, output or artifact failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
    /// An artifact could not be read back as systems.
    #[error("malformed artifact {}: {reason}", path.display())]
    Artifact {
        /// Artifact file.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },
    /// The process pool could not be created.
    #[error(transparent)]
    Pool(#[from] crate::pool::PoolError),
}

/// An engine run whose output does not have the accepted shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
pub enum EngineProtocolError {
    /// Exit code other than 0 (`None` if killed by a signal).
    #[error("engine exited with code {code:?}")]
    NonZeroExit {
        /// Exit code.
        code: Option<i32>,
    },
    /// Something was written to stderr.
    #[error("engine wrote to stderr: {excerpt}")]
    Stderr {
        /// First line of stderr.
        excerpt: String,
    },
    /// Token count differs from the query count.
    #[error("expected {expected} result tokens, found {found}")]
    TokenCount {
        /// Queries in the script.
        expected: usize,
        /// Lines printed.
        found: usize,
    },
    /// A query printed something other than `0`.
    #[error("query {index} printed {token:?}")]
    Token {
        /// 0-based query index.
        index: usize,
        /// What it printed.
        token: String,
    },
    /// A pooled run produced no judgeable output (start, poll or publish failed).
    #[error("engine run did not complete: {reason}")]
    Incomplete {
        /// The pool's failure report.
        reason: String,
    },
}

/// Check an engine run against `expected` queries.
///
/// Order of checks: exit status, stderr, token count, each token.
pub fn judge(
    status_code: Option<i32>,
    stdout: &str,
    stderr: &str,
    expected: usize,
) -> Result<(), EngineProtocolError> {
    if status_code != Some(0) {
        return Err(EngineProtocolError::NonZeroExit { code: status_code });
    }
    if !stderr.is_empty() {
        return Err(EngineProtocolError::Stderr {
            excerpt: stderr.lines().next().unwrap_or_default().to_string(),
        });
    }

    let tokens: Vec<&str> = stdout.lines().collect();
    if tokens.len() != expected {
        return Err(EngineProtocolError::TokenCount {
            expected,
            found: tokens.len(),
        });
    }
    match tokens.iter().position(|t| t.trim() != script::PROVED_TOKEN) {
        Some(index) => Err(EngineProtocolError::Token {
            index,
            token: tokens[index].to_string(),
        }),
        None => Ok(()),
    }
}

/// Outcome for one system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// The equations generate the unit ideal: no 0/1 solution exists.
    Verified,
    /// The engine did not prove infeasibility for this system on its own.
    Counterexample {
        /// How its isolated run deviated.
        reason: EngineProtocolError,
    },
}

impl Verdict {
    /// Whether this verdict is a counterexample.
    pub fn is_counterexample(&self) -> bool {
        matches!(self, Self::Counterexample { .. })
    }
}

/// Verdict for one system of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemVerdict {
    /// Position of the system in the batch.
    pub index: usize,
    /// Fingerprint of the system's serialization.
    pub fingerprint: Fingerprint,
    /// The system itself.
    pub system: System,
    /// What the engine concluded.
    pub verdict: Verdict,
}

/// Identity of a batch: the ordered fingerprints of its systems, combined.
pub fn batch_fingerprint(systems: &[System]) -> Fingerprint {
    combine_fingerprints(systems.iter().map(|s| fingerprint_text(&s.to_string())))
}

impl SystemVerdict {
    pub(crate) fn new(index: usize, system: &System, verdict: Verdict) -> Self {
        Self {
            index,
            fingerprint: fingerprint_text(&system.to_string()),
            system: system.clone(),
            verdict,
        }
    }
}
