//! Sequential batch verification with per-system isolation.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::engine::{run_script, AlgebraEngine};
use super::script::EngineScript;
use super::{
    batch_fingerprint, judge, EngineProtocolError, SystemVerdict, Verdict, VerifyError,
    DEFAULT_BATCH_SIZE,
};
use crate::canonical::Fingerprint;
use crate::codec::{render_pretty, BlockReader};
use crate::pool::DEFAULT_POLL_INTERVAL;
use crate::types::System;

/// Verdicts for one batch.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// Batch identity, see [`batch_fingerprint`].
    pub fingerprint: Fingerprint,
    /// One verdict per system, in input order.
    pub verdicts: Vec<SystemVerdict>,
    /// Why the batch run was rejected, if it was.
    pub rejection: Option<EngineProtocolError>,
}

impl BatchOutcome {
    /// Counterexamples found in this batch.
    pub fn counterexamples(&self) -> impl Iterator<Item = &SystemVerdict> {
        self.verdicts.iter().filter(|v| v.verdict.is_counterexample())
    }
}

/// Totals over many batches.
#[derive(Debug, Clone, Default)]
pub struct VerificationSummary {
    /// Systems checked.
    pub systems: usize,
    /// Batches run.
    pub batches: usize,
    /// Batches that needed isolation.
    pub isolated_batches: usize,
    /// Why each isolated batch was rejected, by batch fingerprint.
    pub rejections: Vec<(Fingerprint, EngineProtocolError)>,
    /// Every counterexample, with `index` relative to the whole input.
    pub counterexamples: Vec<SystemVerdict>,
}

impl VerificationSummary {
    /// Whether every system was proved infeasible.
    pub fn all_verified(&self) -> bool {
        self.counterexamples.is_empty()
    }

    /// Fold one batch into the totals. `offset` is the batch's first index.
    pub fn absorb(&mut self, offset: usize, outcome: BatchOutcome) {
        self.systems += outcome.verdicts.len();
        self.batches += 1;
        if let Some(rejection) = outcome.rejection {
            self.isolated_batches += 1;
            self.rejections.push((outcome.fingerprint, rejection));
        }
        self.counterexamples.extend(
            outcome
                .verdicts
                .into_iter()
                .filter(|v| v.verdict.is_counterexample())
                .map(|mut v| {
                    v.index += offset;
                    v
                }),
        );
    }
}

/// Runs batches through an engine one at a time.
#[derive(Debug, Clone)]
pub struct VerificationBatcher<E> {
    engine: E,
    batch_size: usize,
    poll_interval: Duration,
    scratch_dir: PathBuf,
}

impl<E: AlgebraEngine> VerificationBatcher<E> {
    /// Batcher writing scripts into `scratch_dir`.
    pub fn new(engine: E, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Systems per script (at least 1).
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Sleep between polls of a running engine.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// The engine.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Systems per script.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Verify one batch; isolate on any protocol deviation.
    pub fn verify_batch(&self, systems: &[System]) -> Result<BatchOutcome, VerifyError> {
        let fingerprint = batch_fingerprint(systems);
        if systems.is_empty() {
            return Ok(BatchOutcome {
                fingerprint,
                verdicts: Vec::new(),
                rejection: None,
            });
        }

        let script = EngineScript::for_batch(systems);
        let run = self.run(&script)?;

        match judge(run.status.code(), &run.stdout, &run.stderr, script.queries) {
            Ok(()) => {
                debug!(batch = %fingerprint, systems = systems.len(), "Batch accepted");
                Ok(BatchOutcome {
                    fingerprint,
                    verdicts: systems
                        .iter()
                        .enumerate()
                        .map(|(i, s)| SystemVerdict::new(i, s, Verdict::Verified))
                        .collect(),
                    rejection: None,
                })
            }
            Err(rejection) => {
                warn!(
                    batch = %fingerprint,
                    systems = systems.len(),
                    error = %rejection,
                    "Batch rejected; isolating systems"
                );
                Ok(BatchOutcome {
                    fingerprint,
                    verdicts: self.isolate(systems)?,
                    rejection: Some(rejection),
                })
            }
        }
    }

    /// Re-run every system on its own.
    pub fn isolate(&self, systems: &[System]) -> Result<Vec<SystemVerdict>, VerifyError> {
        systems
            .iter()
            .enumerate()
            .map(|(i, s)| self.verify_system(i, s))
            .collect()
    }

    /// Verify a single system in its own script.
    pub fn verify_system(&self, index: usize, system: &System) -> Result<SystemVerdict, VerifyError> {
        let script = EngineScript::for_batch([system]);
        let run = self.run(&script)?;

        let verdict = match judge(run.status.code(), &run.stdout, &run.stderr, 1) {
            Ok(()) => Verdict::Verified,
            Err(reason) => Verdict::Counterexample { reason },
        };
        let result = SystemVerdict::new(index, system, verdict);

        if let Verdict::Counterexample { reason } = &result.verdict {
            error!(
                fingerprint = %result.fingerprint,
                system = %render_pretty(system),
                reason = %reason,
                "FOUND COUNTEREXAMPLE"
            );
        }
        Ok(result)
    }

    /// Verify `systems` in consecutive batches.
    pub fn verify_all(&self, systems: &[System]) -> Result<VerificationSummary, VerifyError> {
        let mut summary = VerificationSummary::default();
        for (b, chunk) in systems.chunks(self.batch_size).enumerate() {
            let outcome = self.verify_batch(chunk)?;
            summary.absorb(b * self.batch_size, outcome);
            info!(verified = summary.systems, total = systems.len(), "Verification progress");
        }
        Ok(summary)
    }

    fn run(&self, script: &EngineScript) -> Result<super::EngineRun, VerifyError> {
        let io_err = |source| VerifyError::Io {
            path: self.scratch_dir.clone(),
            source,
        };

        let mut file = tempfile::Builder::new()
            .prefix("zeroone-")
            .suffix(".m2")
            .tempfile_in(&self.scratch_dir)
            .map_err(io_err)?;
        file.write_all(script.text.as_bytes()).map_err(io_err)?;
        file.flush().map_err(io_err)?;

        run_script(&self.engine, file.path(), self.poll_interval)
    }
}

/// Read every block of an artifact as a system.
pub fn read_systems(path: &Path) -> Result<Vec<System>, VerifyError> {
    let reader = BlockReader::open(path).map_err(|source| VerifyError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    reader
        .map(|block| {
            block.and_then(|b| b.parse()).map_err(|e| VerifyError::Artifact {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        })
        .collect()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::codec::parse_system;
    use crate::verify::EngineCommand;
    use tempfile::TempDir;

    /// Prints `1` for queries mentioning `c1`, `0` otherwise.
    const FAKE_ENGINE: &str = r#"bad=0
while IFS= read -r line; do
  case "$line" in
    *ideal*c1*) bad=1 ;;
    print*) if [ "$bad" = 1 ]; then echo 1; else echo 0; fi; bad=0 ;;
  esac
done < "$1"
"#;

    fn batcher(dir: &TempDir) -> VerificationBatcher<EngineCommand> {
        let fake = dir.path().join("engine.sh");
        std::fs::write(&fake, FAKE_ENGINE).unwrap();
        let engine = EngineCommand {
            program: "/bin/sh".to_string(),
            args: vec![fake.to_string_lossy().into_owned()],
        };
        VerificationBatcher::new(engine, dir.path()).with_poll_interval(Duration::from_millis(5))
    }

    fn systems(blocks: &[&[&str]]) -> Vec<System> {
        blocks.iter().map(|b| parse_system(b).unwrap()).collect()
    }

    #[test]
    fn test_clean_batch_is_accepted_whole() {
        let dir = TempDir::new().unwrap();
        let outcome = batcher(&dir)
            .verify_batch(&systems(&[&["a1 + a2"], &["a1*a2", "b1"]]))
            .unwrap();
        assert!(outcome.rejection.is_none());
        assert!(outcome.verdicts.iter().all(|v| v.verdict == Verdict::Verified));
    }

    #[test]
    fn test_counterexample_is_found_by_isolation() {
        let dir = TempDir::new().unwrap();
        let batch = systems(&[&["a1 + a2"], &["c1 + a1"], &["a1*a2"]]);
        let outcome = batcher(&dir).verify_batch(&batch).unwrap();

        assert_eq!(
            outcome.rejection,
            Some(EngineProtocolError::Token { index: 1, token: "1".to_string() })
        );
        let verdicts: Vec<bool> = outcome.verdicts.iter().map(|v| v.verdict.is_counterexample()).collect();
        assert_eq!(verdicts, vec![false, true, false]);
        assert_eq!(outcome.counterexamples().count(), 1);
    }

    #[test]
    fn test_summary_indexes_are_global() {
        let dir = TempDir::new().unwrap();
        let batch = systems(&[&["a1"], &["a2"], &["c1"]]);
        let summary = batcher(&dir).with_batch_size(2).verify_all(&batch).unwrap();

        assert_eq!(summary.batches, 2);
        assert_eq!(summary.isolated_batches, 1);
        assert_eq!(summary.counterexamples.len(), 1);
        assert_eq!(summary.counterexamples[0].index, 2);
    }

    #[test]
    fn test_missing_engine_is_infrastructure_error() {
        let dir = TempDir::new().unwrap();
        let engine = EngineCommand::parse("/nonexistent/engine --script").unwrap();
        let batcher = VerificationBatcher::new(engine, dir.path());
        let err = batcher.verify_batch(&systems(&[&["a1"]])).unwrap_err();
        assert!(matches!(err, VerifyError::Spawn { .. }));
    }
}
