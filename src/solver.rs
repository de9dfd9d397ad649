//! Shell generation through an external solver.
//!
//! The solver is consumed as a capability contract, not reimplemented:
//!
//! - `build(m, n)` produces a binary able to generate shell `(m, n)`,
//! - running it writes the shell's blocks to stdout,
//! - `cleanup(m, n)` releases whatever `build` produced.
//!
//! [`SolverCommand`] implements the contract with command-line templates in
//! which `{m}`, `{n}` and `{k}` (the degree) are substituted.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::{all_pairs, ShellKey, ShellLayout};
use crate::pool::{wait_polling, Job, JobFailure, JobReport, ProcessPool, DEFAULT_POLL_INTERVAL};

/// Default solver binary.
pub const DEFAULT_SOLVER_BINARY: &str = "bin/ZeroOneSolver";

/// Error type for the solver contract.
#[derive(Debug, thiserror::Error)]
pub enum SolverError {
    /// A build or cleanup command could not be started.
    #[error("failed to run `{command}` for shell {key}: {source}")]
    Spawn {
        /// Shell being prepared.
        key: ShellKey,
        /// Rendered command line.
        command: String,
        /// Underlying error.
        source: io::Error,
    },
    /// A build or cleanup command exited unsuccessfully.
    #[error("`{command}` for shell {key} exited with code {code:?}")]
    Failed {
        /// Shell being prepared.
        key: ShellKey,
        /// Rendered command line.
        command: String,
        /// Exit code, `None` if killed by a signal.
        code: Option<i32>,
    },
    /// A template rendered to an empty command line.
    #[error("empty command template for shell {key}")]
    EmptyCommand {
        /// Shell being prepared.
        key: ShellKey,
    },
    /// The shell directory could not be created.
    #[error("cannot create shell directory {}: {source}", path.display())]
    Io {
        /// Directory involved.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
}

/// The external solver capability.
pub trait SolverBackend {
    /// Prepare a binary for `key` and return its path.
    fn build(&self, key: ShellKey) -> Result<PathBuf, SolverError>;

    /// Arguments for running the built binary.
    fn args(&self, key: ShellKey) -> Vec<String>;

    /// Release what `build` produced once the run has finished.
    fn cleanup(&self, key: ShellKey) -> Result<(), SolverError>;
}

/// Solver contract expressed as command-line templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverCommand {
    /// Binary path template.
    pub binary: String,
    /// Argument templates.
    pub args: Vec<String>,
    /// Optional command run before each shell, e.g. a per-pair compile.
    pub build: Option<String>,
    /// Optional command run after each shell finishes.
    pub cleanup: Option<String>,
}

impl Default for SolverCommand {
    fn default() -> Self {
        Self {
            binary: DEFAULT_SOLVER_BINARY.to_string(),
            args: vec!["{n}".to_string(), "{m}".to_string(), "--paranoid".to_string()],
            build: None,
            cleanup: None,
        }
    }
}

impl SolverCommand {
    /// Solver running `binary` with the default arguments.
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            ..Self::default()
        }
    }

    fn run_hook(&self, key: ShellKey, template: &str) -> Result<(), SolverError> {
        let rendered = render(template, key);
        let mut parts = rendered.split_whitespace();
        let program = parts.next().ok_or(SolverError::EmptyCommand { key })?;

        debug!(shell = %key, command = %rendered, "Running solver hook");
        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| SolverError::Spawn {
                key,
                command: rendered.clone(),
                source,
            })?;
        let status = wait_polling(&mut child, DEFAULT_POLL_INTERVAL).map_err(|source| {
            SolverError::Spawn {
                key,
                command: rendered.clone(),
                source,
            }
        })?;

        if status.success() {
            Ok(())
        } else {
            Err(SolverError::Failed {
                key,
                command: rendered,
                code: status.code(),
            })
        }
    }
}

impl SolverBackend for SolverCommand {
    fn build(&self, key: ShellKey) -> Result<PathBuf, SolverError> {
        if let Some(build) = &self.build {
            self.run_hook(key, build)?;
        }
        Ok(PathBuf::from(render(&self.binary, key)))
    }

    fn args(&self, key: ShellKey) -> Vec<String> {
        self.args.iter().map(|a| render(a, key)).collect()
    }

    fn cleanup(&self, key: ShellKey) -> Result<(), SolverError> {
        match &self.cleanup {
            Some(cleanup) => self.run_hook(key, cleanup),
            None => Ok(()),
        }
    }
}

/// Substitute `{m}`, `{n}` and `{k}`.
pub fn render(template: &str, key: ShellKey) -> String {
    template
        .replace("{m}", &key.m.to_string())
        .replace("{n}", &key.n.to_string())
        .replace("{k}", &key.degree().to_string())
}

/// What a generation pass did.
#[derive(Debug, Default)]
pub struct GenerationSummary {
    /// Shells that already existed.
    pub skipped: usize,
    /// Shells published by this pass.
    pub published: Vec<ShellKey>,
    /// Shells whose build failed before a job was started.
    pub build_failures: Vec<(ShellKey, String)>,
    /// Jobs that ran but did not publish.
    pub job_failures: Vec<JobFailure>,
}

impl GenerationSummary {
    /// Whether every attempted shell was published.
    pub fn is_clean(&self) -> bool {
        self.build_failures.is_empty() && self.job_failures.is_empty()
    }
}

/// Generate missing shells in degree order up to `max_degree`.
///
/// With no bound the walk never ends; the caller stops the process. Failures
/// are item-local: logged, recorded, and the walk continues.
pub fn generate<S: SolverBackend>(
    solver: &S,
    layout: &ShellLayout,
    pool: &mut ProcessPool,
    max_degree: Option<u32>,
) -> Result<GenerationSummary, SolverError> {
    fs::create_dir_all(&layout.dir).map_err(|source| SolverError::Io {
        path: layout.dir.clone(),
        source,
    })?;

    let mut summary = GenerationSummary::default();
    let mut running: HashMap<String, ShellKey> = HashMap::new();

    let pairs = all_pairs().take_while(|k| max_degree.map_or(true, |d| k.degree() <= d));
    for key in pairs {
        let final_path = layout.path(key);
        if final_path.is_file() {
            debug!(shell = %key, path = %final_path.display(), "Already computed");
            summary.skipped += 1;
            continue;
        }

        let binary = match solver.build(key) {
            Ok(binary) => binary,
            Err(e) => {
                warn!(shell = %key, error = %e, "Solver build failed");
                summary.build_failures.push((key, e.to_string()));
                continue;
            }
        };

        let args = solver.args(key);
        let id = format!("shell {}: {} {}", key, binary.display(), args.join(" "));
        info!(shell = %key, job = %id, "Starting computation");
        running.insert(id.clone(), key);
        pool.submit(Job::command(id, binary, args, layout.temp_path(key), final_path));

        for report in pool.try_collect() {
            record(solver, report, &mut running, &mut summary);
        }
    }

    for report in pool.drain() {
        record(solver, report, &mut running, &mut summary);
    }
    Ok(summary)
}

fn record<S: SolverBackend>(
    solver: &S,
    report: JobReport,
    running: &mut HashMap<String, ShellKey>,
    summary: &mut GenerationSummary,
) {
    let Some(key) = running.remove(&report.id) else {
        warn!(job = %report.id, "Completion for unknown job");
        return;
    };

    match report.outcome {
        Ok(_) => summary.published.push(key),
        Err(failure) => summary.job_failures.push(failure),
    }

    if let Err(e) = solver.cleanup(key) {
        warn!(shell = %key, error = %e, "Solver cleanup failed");
    }
}
