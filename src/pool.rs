//! Bounded pool of external processes with rename-to-publish.
//!
//! ## Contract
//!
//! - At most `capacity` children run at once.
//! - A job writes to its temp path; only a successful, accepted job is
//!   renamed to its final path. Failed jobs have their temp file removed, so
//!   the final artifact set never contains partial output.
//! - A failed job is reported with its identity and the run continues.
//! - The controller never blocks on a child: it polls with `try_wait` and
//!   sleeps `poll_interval` between rounds while it has nothing else to do.
//!
//! Completion order is first-finished, not first-submitted. There is no
//! cancellation: stop submitting and [`ProcessPool::drain`] the rest.

use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

/// Default sleep between poll rounds.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Available parallelism minus one, never less than one.
pub fn default_capacity() -> usize {
    thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

/// Wait for `child` by polling `try_wait`, sleeping `poll_interval` between
/// polls.
pub fn wait_polling(child: &mut Child, poll_interval: Duration) -> io::Result<ExitStatus> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        thread::sleep(poll_interval);
    }
}

/// Starts a child given `(temp_path, final_path)`.
pub type StartFn = Box<dyn FnOnce(&Path, &Path) -> io::Result<Child>>;

/// Inspects a successful child's output before publication.
pub type AcceptFn = Box<dyn FnOnce(&JobOutput<'_>) -> Result<(), String>>;

/// What an acceptance check gets to look at.
#[derive(Debug)]
pub struct JobOutput<'a> {
    /// Job identity.
    pub id: &'a str,
    /// Unpublished output.
    pub temp_path: &'a Path,
    /// Exit status (always success when acceptance runs).
    pub status: ExitStatus,
}

/// Pool construction error.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// A pool must have at least one slot.
    #[error("pool capacity must be at least 1")]
    ZeroCapacity,
}

/// Why a job did not publish.
#[derive(Debug, thiserror::Error)]
pub enum JobFailure {
    /// The child could not be started.
    #[error("job {id}: failed to start: {source}")]
    Spawn {
        /// Job identity.
        id: String,
        /// Underlying error.
        source: io::Error,
    },
    /// The child's status could not be read.
    #[error("job {id}: failed to poll: {source}")]
    Wait {
        /// Job identity.
        id: String,
        /// Underlying error.
        source: io::Error,
    },
    /// The child exited unsuccessfully.
    #[error("job {id}: exited with {status}")]
    Exit {
        /// Job identity.
        id: String,
        /// Exit status.
        status: ExitStatus,
    },
    /// The child exited 0 but its output was rejected.
    #[error("job {id}: output rejected: {reason}")]
    Rejected {
        /// Job identity.
        id: String,
        /// Why the output was rejected.
        reason: String,
    },
    /// The rename to the final path failed.
    #[error("job {id}: failed to publish: {source}")]
    Publish {
        /// Job identity.
        id: String,
        /// Underlying error.
        source: io::Error,
    },
}

impl JobFailure {
    /// Identity of the failed job.
    pub fn id(&self) -> &str {
        match self {
            Self::Spawn { id, .. }
            | Self::Wait { id, .. }
            | Self::Exit { id, .. }
            | Self::Rejected { id, .. }
            | Self::Publish { id, .. } => id,
        }
    }
}

/// One unit of external work.
pub struct Job {
    id: String,
    temp_path: PathBuf,
    final_path: PathBuf,
    start: StartFn,
    accept: Option<AcceptFn>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("temp_path", &self.temp_path)
            .field("final_path", &self.final_path)
            .field("accept", &self.accept.is_some())
            .finish()
    }
}

impl Job {
    /// Job with a custom start function.
    pub fn new(
        id: impl Into<String>,
        temp_path: impl Into<PathBuf>,
        final_path: impl Into<PathBuf>,
        start: StartFn,
    ) -> Self {
        Self {
            id: id.into(),
            temp_path: temp_path.into(),
            final_path: final_path.into(),
            start,
            accept: None,
        }
    }

    /// Job running `program args...` with stdout captured to the temp path.
    pub fn command(
        id: impl Into<String>,
        program: impl Into<PathBuf>,
        args: Vec<String>,
        temp_path: impl Into<PathBuf>,
        final_path: impl Into<PathBuf>,
    ) -> Self {
        let program = program.into();
        let start: StartFn = Box::new(move |temp, _final| {
            let stdout = File::create(temp)?;
            Command::new(&program)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::from(stdout))
                .spawn()
        });
        Self::new(id, temp_path, final_path, start)
    }

    /// Add an acceptance check run after a zero exit.
    pub fn with_acceptance(mut self, accept: AcceptFn) -> Self {
        self.accept = Some(accept);
        self
    }

    /// Job identity.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Where output is published.
    pub fn final_path(&self) -> &Path {
        &self.final_path
    }
}

/// Result of one finished job.
#[derive(Debug)]
pub struct JobReport {
    /// Job identity.
    pub id: String,
    /// Wall time from start to completion.
    pub elapsed: Duration,
    /// Published path, or why nothing was published.
    pub outcome: Result<PathBuf, JobFailure>,
}

impl JobReport {
    /// Whether the job published its output.
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

struct Running {
    id: String,
    temp_path: PathBuf,
    final_path: PathBuf,
    accept: Option<AcceptFn>,
    child: Child,
    started: Instant,
}

/// Bounded worker-slot pool over child processes.
pub struct ProcessPool {
    capacity: usize,
    poll_interval: Duration,
    running: Vec<Running>,
    completed: VecDeque<JobReport>,
    peak: usize,
}

impl fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessPool")
            .field("capacity", &self.capacity)
            .field("poll_interval", &self.poll_interval)
            .field("in_flight", &self.running.len())
            .field("completed", &self.completed.len())
            .finish()
    }
}

impl ProcessPool {
    /// Create a pool with `capacity` slots.
    pub fn new(capacity: usize, poll_interval: Duration) -> Result<Self, PoolError> {
        if capacity == 0 {
            return Err(PoolError::ZeroCapacity);
        }
        Ok(Self {
            capacity,
            poll_interval,
            running: Vec::with_capacity(capacity),
            completed: VecDeque::new(),
            peak: 0,
        })
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Children currently running.
    pub fn in_flight(&self) -> usize {
        self.running.len()
    }

    /// Highest number of children ever running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak
    }

    /// Start `job`, first waiting for a free slot if the pool is saturated.
    ///
    /// Jobs that finish while waiting, and the submitted job itself if it
    /// fails to start, are queued for [`ProcessPool::await_next`].
    pub fn submit(&mut self, job: Job) {
        while self.running.len() >= self.capacity {
            self.reap();
            if self.running.len() >= self.capacity {
                thread::sleep(self.poll_interval);
            }
        }

        let Job {
            id,
            temp_path,
            final_path,
            start,
            accept,
        } = job;

        let started = Instant::now();
        match start(&temp_path, &final_path) {
            Ok(child) => {
                debug!(job = %id, temp = %temp_path.display(), "Job started");
                self.running.push(Running {
                    id,
                    temp_path,
                    final_path,
                    accept,
                    child,
                    started,
                });
                self.peak = self.peak.max(self.running.len());
            }
            Err(source) => {
                discard(&temp_path);
                let failure = JobFailure::Spawn { id: id.clone(), source };
                warn!(job = %id, error = %failure, "Job failed");
                self.completed.push_back(JobReport {
                    id,
                    elapsed: started.elapsed(),
                    outcome: Err(failure),
                });
            }
        }
    }

    /// Every completion available right now, without blocking.
    pub fn try_collect(&mut self) -> Vec<JobReport> {
        self.reap();
        self.completed.drain(..).collect()
    }

    /// Wait for the next completion; `None` once nothing is queued or running.
    pub fn await_next(&mut self) -> Option<JobReport> {
        loop {
            if let Some(report) = self.completed.pop_front() {
                return Some(report);
            }
            if self.running.is_empty() {
                return None;
            }
            self.reap();
            if self.completed.is_empty() {
                thread::sleep(self.poll_interval);
            }
        }
    }

    /// Wait for every running child and return all remaining completions.
    pub fn drain(&mut self) -> Vec<JobReport> {
        let mut reports = Vec::new();
        while let Some(report) = self.await_next() {
            reports.push(report);
        }
        reports
    }

    /// Move every finished child into the completion queue.
    fn reap(&mut self) {
        let mut i = 0;
        while i < self.running.len() {
            match self.running[i].child.try_wait() {
                Ok(None) => i += 1,
                Ok(Some(status)) => {
                    let running = self.running.swap_remove(i);
                    self.completed.push_back(finish(running, status));
                }
                Err(source) => {
                    let mut running = self.running.swap_remove(i);
                    // Stop it so it cannot write after its temp file is gone.
                    let _ = running.child.kill();
                    let _ = running.child.wait();
                    discard(&running.temp_path);
                    let failure = JobFailure::Wait {
                        id: running.id.clone(),
                        source,
                    };
                    warn!(job = %running.id, error = %failure, "Job failed");
                    self.completed.push_back(JobReport {
                        id: running.id,
                        elapsed: running.started.elapsed(),
                        outcome: Err(failure),
                    });
                }
            }
        }
    }
}

fn finish(running: Running, status: ExitStatus) -> JobReport {
    let Running {
        id,
        temp_path,
        final_path,
        accept,
        started,
        ..
    } = running;

    let outcome = publish(&id, &temp_path, &final_path, accept, status);
    let elapsed = started.elapsed();
    match &outcome {
        Ok(path) => info!(
            job = %id,
            path = %path.display(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Job published"
        ),
        Err(failure) => warn!(job = %id, error = %failure, "Job failed"),
    }

    JobReport {
        id,
        elapsed,
        outcome,
    }
}

fn publish(
    id: &str,
    temp_path: &Path,
    final_path: &Path,
    accept: Option<AcceptFn>,
    status: ExitStatus,
) -> Result<PathBuf, JobFailure> {
    if !status.success() {
        discard(temp_path);
        return Err(JobFailure::Exit {
            id: id.to_string(),
            status,
        });
    }

    if let Some(accept) = accept {
        let output = JobOutput {
            id,
            temp_path,
            status,
        };
        if let Err(reason) = accept(&output) {
            discard(temp_path);
            return Err(JobFailure::Rejected {
                id: id.to_string(),
                reason,
            });
        }
    }

    fs::rename(temp_path, final_path).map_err(|source| {
        discard(temp_path);
        JobFailure::Publish {
            id: id.to_string(),
            source,
        }
    })?;
    Ok(final_path.to_path_buf())
}

fn discard(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Discarded temp output"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to discard temp output"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(dir: &Path, id: &str, script: &str) -> Job {
        Job::command(
            id,
            "/bin/sh",
            vec!["-c".to_string(), script.to_string()],
            dir.join(format!("{}.out.temp", id)),
            dir.join(format!("{}.out", id)),
        )
    }

    fn pool(capacity: usize) -> ProcessPool {
        ProcessPool::new(capacity, Duration::from_millis(10)).unwrap()
    }

    fn temp_files(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.to_string_lossy().ends_with(".temp"))
            .collect()
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            ProcessPool::new(0, DEFAULT_POLL_INTERVAL),
            Err(PoolError::ZeroCapacity)
        ));
        assert!(default_capacity() >= 1);
    }

    #[test]
    fn test_capacity_bounds_concurrency() {
        let dir = TempDir::new().unwrap();
        let mut pool = pool(2);

        for i in 0..6 {
            pool.submit(sh(dir.path(), &format!("job{}", i), &format!("sleep 0.1; echo {}", i)));
            assert!(pool.in_flight() <= 2);
        }
        let reports = pool.drain();

        assert_eq!(reports.len(), 6);
        assert!(reports.iter().all(JobReport::is_success));
        assert_eq!(pool.peak_in_flight(), 2);
        assert_eq!(fs::read_to_string(dir.path().join("job4.out")).unwrap(), "4\n");
        assert!(temp_files(dir.path()).is_empty());
    }

    #[test]
    fn test_failed_job_discards_temp_and_run_continues() {
        let dir = TempDir::new().unwrap();
        let mut pool = pool(2);

        pool.submit(sh(dir.path(), "bad", "echo partial; exit 3"));
        pool.submit(sh(dir.path(), "good", "echo done"));
        let reports = pool.drain();

        let bad = reports.iter().find(|r| r.id == "bad").unwrap();
        assert!(matches!(bad.outcome, Err(JobFailure::Exit { .. })));
        assert!(!dir.path().join("bad.out").exists());
        assert!(dir.path().join("good.out").is_file());
        assert!(temp_files(dir.path()).is_empty());
    }

    #[test]
    fn test_rejected_output_is_not_published() {
        let dir = TempDir::new().unwrap();
        let mut pool = pool(1);

        let job = sh(dir.path(), "check", "echo 1").with_acceptance(Box::new(|out| {
            let text = fs::read_to_string(out.temp_path).map_err(|e| e.to_string())?;
            if text == "0\n" {
                Ok(())
            } else {
                Err(format!("unexpected output {:?}", text))
            }
        }));
        pool.submit(job);

        let report = pool.await_next().unwrap();
        assert!(matches!(report.outcome, Err(JobFailure::Rejected { .. })));
        assert!(!dir.path().join("check.out").exists());
        assert!(temp_files(dir.path()).is_empty());
    }

    #[test]
    fn test_spawn_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let mut pool = pool(1);

        pool.submit(Job::command(
            "missing",
            dir.path().join("no-such-binary"),
            Vec::new(),
            dir.path().join("missing.temp"),
            dir.path().join("missing.out"),
        ));

        let report = pool.await_next().unwrap();
        assert_eq!(report.outcome.as_ref().unwrap_err().id(), "missing");
        assert!(matches!(report.outcome, Err(JobFailure::Spawn { .. })));
        assert!(temp_files(dir.path()).is_empty());
        assert!(pool.await_next().is_none());
    }
}
