//! Pooled verification of whole artifacts.
//!
//! Every batch of every artifact becomes one engine job in the
//! [`ProcessPool`]. A job is published only if [`judge`] accepts its output;
//! any other completion sends that batch to sequential isolation. An
//! artifact whose batches are all verified is promoted to the verified
//! directory. After the first counterexample no further batches are
//! submitted; in-flight batches still finish.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::rc::Rc;

use tracing::{info, warn};
use uuid::Uuid;

use super::batcher::{read_systems, BatchOutcome, VerificationBatcher, VerificationSummary};
use super::engine::AlgebraEngine;
use super::ledger::promote;
use super::script::{EngineScript, ScriptLayout};
use super::{batch_fingerprint, judge, EngineProtocolError, SystemVerdict, Verdict, VerifyError};
use crate::canonical::Fingerprint;
use crate::pool::{AcceptFn, Job, JobFailure, JobOutput, JobReport, ProcessPool, StartFn};
use crate::types::System;

/// Result of verifying one artifact.
#[derive(Debug, Clone)]
pub struct ArtifactVerification {
    /// Degree of the artifact.
    pub degree: u32,
    /// Where the artifact was read from.
    pub source: PathBuf,
    /// Where it was moved to, if every system was verified.
    pub verified_path: Option<PathBuf>,
    /// Totals, with counterexample indexes relative to the artifact.
    pub summary: VerificationSummary,
    /// Batches the artifact was split into.
    pub planned_batches: usize,
}

impl ArtifactVerification {
    /// Whether the artifact was promoted.
    pub fn is_verified(&self) -> bool {
        self.verified_path.is_some()
    }
}

struct ArtifactState {
    degree: u32,
    path: PathBuf,
    systems: Vec<System>,
    batches: usize,
    reported: usize,
    summary: VerificationSummary,
    verified_path: Option<PathBuf>,
}

struct PendingBatch {
    artifact: usize,
    batch: usize,
    fingerprint: Fingerprint,
    script: PathBuf,
    output: PathBuf,
    stderr: PathBuf,
    rejection: Rc<RefCell<Option<EngineProtocolError>>>,
}

/// Verifies artifacts by fanning their batches out over a process pool.
#[derive(Debug)]
pub struct ParallelVerifier<E> {
    batcher: VerificationBatcher<E>,
    scripts: ScriptLayout,
    run_id: Uuid,
}

impl<E: AlgebraEngine + Clone + 'static> ParallelVerifier<E> {
    /// Verifier writing batch scripts under `scripts`.
    pub fn new(batcher: VerificationBatcher<E>, scripts: ScriptLayout, run_id: Uuid) -> Self {
        Self {
            batcher,
            scripts,
            run_id,
        }
    }

    /// Identity recorded in the ledger.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Verify `artifacts` (degree, path) and promote those fully verified.
    pub fn verify_artifacts(
        &self,
        pool: &mut ProcessPool,
        artifacts: &[(u32, PathBuf)],
        verified_dir: &Path,
    ) -> Result<Vec<ArtifactVerification>, VerifyError> {
        let batch_size = self.batcher.batch_size();
        let mut states = Vec::with_capacity(artifacts.len());
        for (degree, path) in artifacts {
            let systems = read_systems(path)?;
            states.push(ArtifactState {
                degree: *degree,
                path: path.clone(),
                batches: systems.len().div_ceil(batch_size),
                systems,
                reported: 0,
                summary: VerificationSummary::default(),
                verified_path: None,
            });
        }

        fs::create_dir_all(&self.scripts.dir).map_err(|source| VerifyError::Io {
            path: self.scripts.dir.clone(),
            source,
        })?;

        let mut pending: HashMap<String, PendingBatch> = HashMap::new();
        let mut halted = false;

        'artifacts: for a in 0..states.len() {
            if states[a].batches == 0 {
                self.promote_if_done(&mut states[a], verified_dir)?;
                continue;
            }
            for b in 0..states[a].batches {
                if halted {
                    break 'artifacts;
                }
                let (job, batch) = match self.batch_job(a, b, &states[a]) {
                    Ok(prepared) => prepared,
                    Err(e) => return Err(abandon(pool, &mut pending, e)),
                };
                pending.insert(job.id().to_string(), batch);
                pool.submit(job);

                for report in pool.try_collect() {
                    match self.on_report(report, &mut pending, &mut states, verified_dir) {
                        Ok(found) => halted |= found,
                        Err(e) => return Err(abandon(pool, &mut pending, e)),
                    }
                }
            }
        }

        while let Some(report) = pool.await_next() {
            if let Err(e) = self.on_report(report, &mut pending, &mut states, verified_dir) {
                return Err(abandon(pool, &mut pending, e));
            }
        }

        if halted {
            warn!("Counterexample found; remaining batches were not submitted");
        }

        Ok(states
            .into_iter()
            .map(|s| ArtifactVerification {
                degree: s.degree,
                source: s.path,
                verified_path: s.verified_path,
                summary: s.summary,
                planned_batches: s.batches,
            })
            .collect())
    }

    fn batch_job(
        &self,
        artifact: usize,
        batch: usize,
        state: &ArtifactState,
    ) -> Result<(Job, PendingBatch), VerifyError> {
        let size = self.batcher.batch_size();
        let chunk = batch_slice(&state.systems, batch, size);
        let script = EngineScript::for_batch(chunk);
        let fingerprint = batch_fingerprint(chunk);

        let script_path = self.scripts.path(state.degree, batch);
        script.write_to(&script_path).map_err(|source| VerifyError::Io {
            path: script_path.clone(),
            source,
        })?;

        let output = with_suffix(&script_path, ".out");
        let temp = with_suffix(&script_path, ".out.temp");
        let stderr = with_suffix(&script_path, ".err");
        let rejection = Rc::new(RefCell::new(None));

        let engine = self.batcher.engine().clone();
        let run_script = script_path.clone();
        let err_out = stderr.clone();
        let start: StartFn = Box::new(move |temp, _final| {
            let out = File::create(temp)?;
            let err = File::create(&err_out)?;
            engine
                .command(&run_script)
                .stdin(Stdio::null())
                .stdout(Stdio::from(out))
                .stderr(Stdio::from(err))
                .spawn()
        });

        let slot = Rc::clone(&rejection);
        let err_in = stderr.clone();
        let expected = script.queries;
        let accept: AcceptFn = Box::new(move |out: &JobOutput<'_>| {
            let stdout = fs::read_to_string(out.temp_path).map_err(|e| e.to_string())?;
            let stderr = fs::read_to_string(&err_in).map_err(|e| e.to_string())?;
            judge(out.status.code(), &stdout, &stderr, expected).map_err(|e| {
                let reason = e.to_string();
                *slot.borrow_mut() = Some(e);
                reason
            })
        });

        let id = format!("batch {} ({})", fingerprint, script_path.display());
        let job = Job::new(id, temp, output.clone(), start).with_acceptance(accept);
        Ok((
            job,
            PendingBatch {
                artifact,
                batch,
                fingerprint,
                script: script_path,
                output,
                stderr,
                rejection,
            },
        ))
    }

    /// Returns `true` if the report produced a counterexample.
    fn on_report(
        &self,
        report: JobReport,
        pending: &mut HashMap<String, PendingBatch>,
        states: &mut [ArtifactState],
        verified_dir: &Path,
    ) -> Result<bool, VerifyError> {
        let Some(batch) = pending.remove(&report.id) else {
            warn!(job = %report.id, "Completion for unknown job");
            return Ok(false);
        };
        cleanup(&batch);

        let size = self.batcher.batch_size();
        let state = &mut states[batch.artifact];
        let chunk = batch_slice(&state.systems, batch.batch, size);

        let outcome = match report.outcome {
            Ok(_) => BatchOutcome {
                fingerprint: batch.fingerprint,
                verdicts: chunk
                    .iter()
                    .enumerate()
                    .map(|(i, s)| SystemVerdict::new(i, s, Verdict::Verified))
                    .collect(),
                rejection: None,
            },
            Err(failure) => {
                let rejection = batch
                    .rejection
                    .borrow_mut()
                    .take()
                    .unwrap_or_else(|| protocol_error(&failure));
                warn!(
                    degree = state.degree,
                    batch = %batch.fingerprint,
                    index = batch.batch,
                    error = %rejection,
                    "Batch rejected; isolating systems"
                );
                BatchOutcome {
                    fingerprint: batch.fingerprint,
                    verdicts: self.batcher.isolate(chunk)?,
                    rejection: Some(rejection),
                }
            }
        };

        let found = outcome.counterexamples().next().is_some();
        state.summary.absorb(batch.batch * size, outcome);
        state.reported += 1;
        info!(
            degree = state.degree,
            batch = %batch.fingerprint,
            index = batch.batch,
            done = state.reported,
            of = state.batches,
            "Batch finished"
        );

        self.promote_if_done(state, verified_dir)?;
        Ok(found)
    }

    fn promote_if_done(&self, state: &mut ArtifactState, verified_dir: &Path) -> Result<(), VerifyError> {
        if state.reported < state.batches || !state.summary.all_verified() {
            return Ok(());
        }
        let (dest, _) = promote(
            &state.path,
            verified_dir,
            state.systems.len(),
            state.batches,
            self.run_id,
        )?;
        state.verified_path = Some(dest);
        Ok(())
    }
}

fn batch_slice(systems: &[System], batch: usize, size: usize) -> &[System] {
    let start = (batch * size).min(systems.len());
    let end = (start + size).min(systems.len());
    &systems[start..end]
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn protocol_error(failure: &JobFailure) -> EngineProtocolError {
    match failure {
        JobFailure::Exit { status, .. } => EngineProtocolError::NonZeroExit { code: status.code() },
        other => EngineProtocolError::Incomplete {
            reason: other.to_string(),
        },
    }
}

fn cleanup(batch: &PendingBatch) {
    for path in [&batch.script, &batch.output, &batch.stderr] {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to remove batch file");
            }
        }
    }
}

/// Wait out in-flight jobs and clear their files before surfacing `error`.
fn abandon(
    pool: &mut ProcessPool,
    pending: &mut HashMap<String, PendingBatch>,
    error: VerifyError,
) -> VerifyError {
    pool.drain();
    for (_, batch) in pending.drain() {
        cleanup(&batch);
    }
    error
}
