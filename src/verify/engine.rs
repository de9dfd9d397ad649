//! External algebra engine invocation.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::VerifyError;
use crate::pool::wait_polling;

/// Default engine command line: Macaulay2 in script mode.
pub const DEFAULT_ENGINE: &str = "M2 --script";

/// Something that can run an engine script non-interactively.
pub trait AlgebraEngine {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Command that runs `script`. Stdio is configured by the caller.
    fn command(&self, script: &Path) -> Command;
}

/// An engine given as a program plus leading arguments; the script path is
/// appended last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCommand {
    /// Program to run.
    pub program: String,
    /// Arguments placed before the script path.
    pub args: Vec<String>,
}

impl EngineCommand {
    /// Macaulay2 in script mode.
    pub fn macaulay2() -> Self {
        Self::parse(DEFAULT_ENGINE).unwrap_or_else(|| Self {
            program: "M2".to_string(),
            args: vec!["--script".to_string()],
        })
    }

    /// Split a whitespace-separated command line; `None` if empty.
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl Default for EngineCommand {
    fn default() -> Self {
        Self::macaulay2()
    }
}

impl AlgebraEngine for EngineCommand {
    fn name(&self) -> &str {
        &self.program
    }

    fn command(&self, script: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg(script);
        cmd
    }
}

/// Captured result of one engine run.
#[derive(Debug, Clone)]
pub struct EngineRun {
    /// Exit status.
    pub status: ExitStatus,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

/// Run `script` to completion, polling with `poll_interval` sleeps.
///
/// Output goes to anonymous temp files rather than pipes so a chatty engine
/// cannot block on a full pipe while the controller sleeps.
pub fn run_script<E: AlgebraEngine + ?Sized>(
    engine: &E,
    script: &Path,
    poll_interval: Duration,
) -> Result<EngineRun, VerifyError> {
    let io_err = |source| VerifyError::Io {
        path: script.to_path_buf(),
        source,
    };

    let mut stdout = tempfile::tempfile().map_err(io_err)?;
    let mut stderr = tempfile::tempfile().map_err(io_err)?;

    let mut child = engine
        .command(script)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout.try_clone().map_err(io_err)?))
        .stderr(Stdio::from(stderr.try_clone().map_err(io_err)?))
        .spawn()
        .map_err(|source| VerifyError::Spawn {
            engine: engine.name().to_string(),
            source,
        })?;

    let status = wait_polling(&mut child, poll_interval).map_err(io_err)?;

    debug!(engine = engine.name(), script = %script.display(), %status, "Engine run finished");

    Ok(EngineRun {
        status,
        stdout: read_back(&mut stdout).map_err(io_err)?,
        stderr: read_back(&mut stderr).map_err(io_err)?,
    })
}

fn read_back(file: &mut File) -> std::io::Result<String> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_line() {
        let engine = EngineCommand::parse("  M2   --script ").unwrap();
        assert_eq!(engine.program, "M2");
        assert_eq!(engine.args, vec!["--script"]);
        assert!(EngineCommand::parse("   ").is_none());
        assert_eq!(EngineCommand::default(), engine);
    }

    #[test]
    fn test_script_path_is_appended() {
        let engine = EngineCommand::macaulay2();
        let cmd = engine.command(Path::new("batch.m2"));
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(cmd.get_program(), "M2");
        assert_eq!(args, vec!["--script", "batch.m2"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_run_script_captures_both_channels() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("s.sh");
        std::fs::write(&script, "echo 0\necho oops >&2\nexit 2\n").unwrap();

        let engine = EngineCommand::parse("/bin/sh").unwrap();
        let run = run_script(&engine, &script, Duration::from_millis(5)).unwrap();
        assert_eq!(run.stdout, "0\n");
        assert_eq!(run.stderr, "oops\n");
        assert_eq!(run.status.code(), Some(2));
    }
}
