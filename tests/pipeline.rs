//! End-to-end tests for the dedup stream, the process pool and verification.
//!
//! The algebra engine is replaced by a small shell script that answers `1`
//! for any system mentioning `c1` and `0` otherwise, so these tests need
//! `/bin/sh` but not Macaulay2.

#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use zeroone_pipeline::catalog::ShellKey;
use zeroone_pipeline::verify::ledger::read_ledger;
use zeroone_pipeline::{
    canonicalize, parse_system, ArtifactLayout, Canonicalizer, EngineCommand, Job, Pipeline,
    PipelineConfig, PipelineError, ProcessPool, RunContext, ShellCatalog, ShellLayout,
    StreamEvent, System, VerificationBatcher, Verdict,
};

/// Prints `1` for queries whose ideal mentions `c1`, `0` otherwise.
const FAKE_ENGINE: &str = r#"bad=0
while IFS= read -r line; do
  case "$line" in
    *ideal*c1*) bad=1 ;;
    print*) if [ "$bad" = 1 ]; then echo 1; else echo 0; fi; bad=0 ;;
  esac
done < "$1"
"#;

// ─────────────────────────────────────────────────────────────────────────────
// Test Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn fake_engine(dir: &Path) -> EngineCommand {
    let script = dir.join("engine.sh");
    fs::write(&script, FAKE_ENGINE).unwrap();
    EngineCommand {
        program: "/bin/sh".to_string(),
        args: vec![script.to_string_lossy().into_owned()],
    }
}

fn write_shell(layout: &ShellLayout, m: u32, n: u32, blocks: &[&[&str]]) {
    let key = ShellKey::new(m, n).unwrap();
    let mut text = String::new();
    for block in blocks {
        for line in *block {
            text.push_str(line);
            text.push('\n');
        }
        text.push('\n');
    }
    fs::create_dir_all(&layout.dir).unwrap();
    fs::write(layout.path(key), text).unwrap();
}

fn config(root: &Path) -> PipelineConfig {
    PipelineConfig {
        data_dir: root.join("data"),
        canonical_dir: root.join("data"),
        verified_dir: root.join("verified"),
        script_dir: root.join("scripts"),
        engine: fake_engine(root),
        poll_interval_ms: 5,
        ..PipelineConfig::default()
    }
}

fn systems(blocks: &[&[&str]]) -> Vec<System> {
    blocks.iter().map(|b| parse_system(b).unwrap()).collect()
}

fn files_with_suffix(dir: &Path, suffix: &str) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.to_string_lossy().ends_with(suffix))
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Dedup Stream
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_relabeled_duplicates_emit_once_across_degrees() {
    let dir = TempDir::new().unwrap();
    let layout = ShellLayout::new(dir.path());
    write_shell(
        &layout,
        1,
        2,
        &[&["a1*a2 + b1", "b1*b2 + a1"], &["a2*a1 + b2", "b2*b1 + a2"]],
    );
    write_shell(&layout, 1, 3, &[&["b7*b3 + a5", "a5*a9 + b3"], &["a1 + a2"]]);

    let catalog = ShellCatalog::new(layout);
    let mut ctx = RunContext::new(Canonicalizer::default());
    let events: Vec<StreamEvent> = ctx
        .stream(&catalog, 0..=4)
        .collect::<Result<_, _>>()
        .unwrap();

    let emitted: Vec<(u32, usize)> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Emitted(em) => Some((em.degree, em.block)),
            _ => None,
        })
        .collect();
    assert_eq!(emitted, vec![(3, 0), (4, 1)]);

    let finished: Vec<(u32, usize)> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::DegreeFinished { degree, stats } => Some((*degree, stats.duplicates)),
            _ => None,
        })
        .collect();
    assert_eq!(finished, vec![(0, 0), (1, 0), (2, 0), (3, 1), (4, 1)]);
    assert_eq!(ctx.seen_len(), 2);
}

// ─────────────────────────────────────────────────────────────────────────────
// Process Pool
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_pool_bounds_concurrency_and_publishes_atomically() {
    let dir = TempDir::new().unwrap();
    let mut pool = ProcessPool::new(2, Duration::from_millis(5)).unwrap();

    for i in 0..6 {
        let script = if i == 3 {
            "echo partial; exit 1".to_string()
        } else {
            format!("sleep 0.05; echo job{}", i)
        };
        pool.submit(Job::command(
            format!("job {}", i),
            "/bin/sh",
            vec!["-c".to_string(), script],
            dir.path().join(format!("out{}.txt.temp", i)),
            dir.path().join(format!("out{}.txt", i)),
        ));
        assert!(pool.in_flight() <= 2);
    }
    let mut reports = pool.try_collect();
    reports.extend(pool.drain());

    assert_eq!(reports.len(), 6);
    assert!(pool.peak_in_flight() <= 2);
    assert_eq!(reports.iter().filter(|r| r.is_success()).count(), 5);

    for i in 0..6 {
        let published = dir.path().join(format!("out{}.txt", i));
        if i == 3 {
            assert!(!published.exists());
        } else {
            assert_eq!(fs::read_to_string(published).unwrap(), format!("job{}\n", i));
        }
    }
    assert!(files_with_suffix(dir.path(), ".temp").is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Verification
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_batch_failure_is_localized_to_one_system() {
    let dir = TempDir::new().unwrap();
    let batcher = VerificationBatcher::new(fake_engine(dir.path()), dir.path())
        .with_poll_interval(Duration::from_millis(5));

    let batch = systems(&[&["a1*a2 + b1"], &["a1 + c1"], &["b1*b2"]]);
    let outcome = batcher.verify_batch(&batch).unwrap();

    let verdicts: Vec<&Verdict> = outcome.verdicts.iter().map(|v| &v.verdict).collect();
    assert_eq!(verdicts[0], &Verdict::Verified);
    assert!(verdicts[1].is_counterexample());
    assert_eq!(verdicts[2], &Verdict::Verified);
    assert!(outcome.rejection.is_some());

    let found: Vec<usize> = outcome.counterexamples().map(|v| v.index).collect();
    assert_eq!(found, vec![1]);
}

#[test]
fn test_pipeline_canonicalize_verify_status() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path());
    let shells = config.shell_layout();
    write_shell(
        &shells,
        1,
        2,
        &[&["a1*a2 + b1", "b1*b2 + a1"], &["a2*a1 + b2", "b2*b1 + a2"]],
    );
    write_shell(&shells, 1, 3, &[&["a1 + a2"], &["b1*b2 + a1", "a1*a2 + b1"]]);

    let pipeline = Pipeline::new(config.clone(), 2, None);

    let report = pipeline.canonicalize().unwrap();
    assert_eq!(report.resumed_from, 0);
    assert_eq!(report.available_through, 4);
    assert_eq!(report.emitted, 2);
    assert_eq!(report.published.len(), 5);

    // Nothing new until degree 5 shells exist.
    let again = pipeline.canonicalize().unwrap();
    assert_eq!(again.resumed_from, 5);
    assert!(again.published.is_empty());
    assert_eq!(again.seeded, 2);

    let verified = pipeline.verify().unwrap();
    assert_eq!(verified.verified.len(), 5);
    assert_eq!(verified.systems, 2);
    assert_eq!(verified.isolated_batches, 0);

    let layout: ArtifactLayout = config.artifact_layout();
    assert!(layout.verified_path(3).is_file());
    assert!(!layout.path(3).exists());
    assert_eq!(read_ledger(&config.verified_dir).unwrap().len(), 5);

    let status = pipeline.status().unwrap();
    assert_eq!(status.available_degree, 4);
    assert_eq!(status.checkpoint, 5);
    assert!(status.pending.is_empty());
    assert_eq!(status.verified, 5);

    assert!(fs::read_dir(&config.script_dir).unwrap().next().is_none());
}

#[test]
fn test_counterexample_halts_and_blocks_promotion() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path());
    write_shell(&config.shell_layout(), 1, 2, &[&["a1 + a2"], &["c4 + a3"]]);

    let pipeline = Pipeline::new(config.clone(), 2, Some(3));
    pipeline.canonicalize().unwrap();

    let err = pipeline.verify().unwrap_err();
    let expected = canonicalize(&parse_system(&["a1 + c1"]).unwrap()).unwrap();
    match err {
        PipelineError::CounterexampleFound { fingerprints } => {
            assert_eq!(fingerprints, vec![expected.fingerprint()]);
        }
        other => panic!("expected a counterexample, got {other}"),
    }

    let layout = config.artifact_layout();
    assert!(layout.path(3).is_file());
    assert!(!layout.verified_path(3).exists());
    assert_eq!(pipeline.status().unwrap().pending, vec![3]);
}
