//! End-to-end drivers for each pipeline stage.
//!
//! ```text
//! generate ─▶ shells ─▶ canonicalize ─▶ artifacts ─▶ verify ─▶ verified/ + ledger
//!                                           └──────▶ export-scripts
//! ```
//!
//! Each stage reads only what earlier stages published, so stages can run in
//! separate processes and be restarted independently.

use std::fs;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::canonical::Fingerprint;
use crate::canonicalizer::Canonicalizer;
use crate::catalog::ShellCatalog;
use crate::config::{ConfigError, PipelineConfig};
use crate::dedup::{ArtifactWriter, DedupError, RunContext, StreamEvent};
use crate::pool::{PoolError, ProcessPool};
use crate::solver::{generate, GenerationSummary, SolverError};
use crate::verify::batcher::read_systems;
use crate::verify::ledger::read_ledger;
use crate::verify::{ArtifactVerification, ParallelVerifier, VerificationBatcher, VerifyError};

/// Error type for pipeline drivers.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The dedup stream failed.
    #[error(transparent)]
    Dedup(#[from] DedupError),
    /// Verification infrastructure failed.
    #[error(transparent)]
    Verify(#[from] VerifyError),
    /// Shell generation failed.
    #[error(transparent)]
    Solver(#[from] SolverError),
    /// The process pool could not be created.
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// A file or directory operation failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// At least one system was not proved infeasible.
    #[error("found {} counterexample(s): {}", fingerprints.len(), join(fingerprints))]
    CounterexampleFound {
        /// Fingerprints of the offending systems.
        fingerprints: Vec<Fingerprint>,
    },
}

fn join(fingerprints: &[Fingerprint]) -> String {
    fingerprints
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn io_error(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> PipelineError {
    let path = path.into();
    move |source| PipelineError::Io { path, source }
}

/// What a canonicalization pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CanonicalizeReport {
    /// First degree processed (the checkpoint).
    pub resumed_from: u32,
    /// Highest degree whose shells were all available.
    pub available_through: u32,
    /// Canonical systems seeded from earlier artifacts.
    pub seeded: usize,
    /// New canonical systems written.
    pub emitted: usize,
    /// Blocks skipped as malformed.
    pub rejected: usize,
    /// Artifacts published by this pass.
    pub published: Vec<PathBuf>,
}

/// What a verification pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    /// Artifacts moved to the verified directory.
    pub verified: Vec<PathBuf>,
    /// Systems proved infeasible.
    pub systems: usize,
    /// Engine batches run.
    pub batches: usize,
    /// Batches that needed isolation.
    pub isolated_batches: usize,
}

/// Snapshot of pipeline progress.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Highest degree with every shell present.
    pub available_degree: u32,
    /// First degree without a completed canonical artifact.
    pub checkpoint: u32,
    /// Degrees with completed, unverified artifacts.
    pub pending: Vec<u32>,
    /// Entries in the verification ledger.
    pub verified: usize,
}

/// Runs pipeline stages with one configuration.
#[derive(Debug, Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    jobs: usize,
    max_degree: Option<u32>,
    run_id: Uuid,
}

impl Pipeline {
    /// Pipeline with `jobs` pool slots and an optional degree bound.
    pub fn new(config: PipelineConfig, jobs: usize, max_degree: Option<u32>) -> Self {
        Self {
            config,
            jobs,
            max_degree,
            run_id: Uuid::new_v4(),
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Identity of this run, recorded in the ledger.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn pool(&self) -> Result<ProcessPool, PipelineError> {
        Ok(ProcessPool::new(self.jobs, self.config.poll_interval())?)
    }

    fn catalog(&self) -> ShellCatalog {
        ShellCatalog::new(self.config.shell_layout())
    }

    /// Generate missing shells through the solver.
    pub fn generate(&self) -> Result<GenerationSummary, PipelineError> {
        let mut pool = self.pool()?;
        info!(jobs = self.jobs, max_degree = ?self.max_degree, "Generating shells");
        let summary = generate(&self.config.solver, &self.config.shell_layout(), &mut pool, self.max_degree)?;
        info!(
            published = summary.published.len(),
            skipped = summary.skipped,
            failed = summary.build_failures.len() + summary.job_failures.len(),
            "Generation finished"
        );
        Ok(summary)
    }

    /// Run the dedup stream from the checkpoint through the highest
    /// available degree, publishing one artifact per degree.
    pub fn canonicalize(&self) -> Result<CanonicalizeReport, PipelineError> {
        let catalog = self.catalog();
        let layout = self.config.artifact_layout();

        let mut ctx = RunContext::new(Canonicalizer::new(self.config.canonicalizer));
        let resumed_from = ctx.seed_from_artifacts(&layout)?;
        let available_through = catalog.available_degree(self.max_degree);

        let mut report = CanonicalizeReport {
            resumed_from,
            available_through,
            seeded: ctx.seen_len(),
            ..CanonicalizeReport::default()
        };

        if resumed_from > available_through {
            info!(
                degree = resumed_from,
                "Files for this degree are not yet available; nothing to do"
            );
            return Ok(report);
        }

        let mut writer = ArtifactWriter::new(layout.clone()).map_err(io_error(&layout.dir))?;
        for event in ctx.stream(&catalog, resumed_from..=available_through) {
            match event {
                Ok(event) => {
                    if matches!(event, StreamEvent::Emitted(_)) {
                        report.emitted += 1;
                    }
                    if let Some(path) = writer.handle(&event).map_err(io_error(&layout.dir))? {
                        report.published.push(path);
                    }
                }
                Err(e) if e.is_item_local() => report.rejected += 1,
                Err(DedupError::Missing(missing)) => {
                    info!(degree = missing.degree, shell = %missing.key, "Shell not yet available");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(
            resumed_from,
            available_through,
            emitted = report.emitted,
            rejected = report.rejected,
            "Canonicalization finished"
        );
        Ok(report)
    }

    fn pending(&self) -> Result<Vec<(u32, PathBuf)>, PipelineError> {
        let layout = self.config.artifact_layout();
        let mut pending = layout.pending().map_err(io_error(&layout.dir))?;
        if let Some(bound) = self.max_degree {
            pending.retain(|(degree, _)| *degree <= bound);
        }
        Ok(pending)
    }

    /// Verify every pending artifact; counterexamples halt with an error.
    pub fn verify(&self) -> Result<VerifyReport, PipelineError> {
        let pending = self.pending()?;
        let script_dir = &self.config.script_dir;
        fs::create_dir_all(script_dir).map_err(io_error(script_dir))?;

        let batcher = VerificationBatcher::new(self.config.engine.clone(), script_dir)
            .with_batch_size(self.config.batch_size)
            .with_poll_interval(self.config.poll_interval());
        let verifier = ParallelVerifier::new(batcher, self.config.script_layout(), self.run_id);

        info!(artifacts = pending.len(), run_id = %self.run_id, "Verifying artifacts");
        let mut pool = self.pool()?;
        let results = verifier.verify_artifacts(&mut pool, &pending, &self.config.verified_dir)?;

        let fingerprints: Vec<Fingerprint> = results
            .iter()
            .flat_map(|r| r.summary.counterexamples.iter().map(|c| c.fingerprint))
            .collect();
        if !fingerprints.is_empty() {
            for result in results.iter().filter(|r| !r.summary.all_verified()) {
                error!(
                    degree = result.degree,
                    artifact = %result.source.display(),
                    counterexamples = result.summary.counterexamples.len(),
                    "FOUND COUNTEREXAMPLE IN ARTIFACT"
                );
            }
            return Err(PipelineError::CounterexampleFound { fingerprints });
        }

        Ok(summarize(&results))
    }

    /// Write engine scripts for every pending artifact without running them.
    pub fn export_scripts(&self) -> Result<Vec<(PathBuf, usize)>, PipelineError> {
        let layout = self.config.script_layout();
        let mut written = Vec::new();
        for (degree, path) in self.pending()? {
            let systems = read_systems(&path)?;
            let scripts = layout
                .export(degree, &systems, self.config.batch_size)
                .map_err(io_error(&layout.dir))?;
            info!(degree, scripts = scripts.len(), systems = systems.len(), "Exported scripts");
            written.extend(scripts);
        }
        Ok(written)
    }

    /// Report availability, checkpoint and verification progress.
    pub fn status(&self) -> Result<StatusReport, PipelineError> {
        let layout = self.config.artifact_layout();
        let mut checkpoint = 0;
        while layout.completed(checkpoint).is_some() {
            checkpoint += 1;
        }

        Ok(StatusReport {
            available_degree: self.catalog().available_degree(self.max_degree),
            checkpoint,
            pending: self.pending()?.into_iter().map(|(d, _)| d).collect(),
            verified: read_ledger(&self.config.verified_dir)?.len(),
        })
    }
}

fn summarize(results: &[ArtifactVerification]) -> VerifyReport {
    let mut report = VerifyReport::default();
    for result in results {
        report.systems += result.summary.systems;
        report.batches += result.summary.batches;
        report.isolated_batches += result.summary.isolated_batches;
        if let Some(path) = &result.verified_path {
            report.verified.push(path.clone());
        }
    }
    report
}
