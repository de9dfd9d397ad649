//! Pipeline configuration.
//!
//! ## Sources
//!
//! Lowest to highest precedence: built-in defaults, an optional JSON file,
//! environment variables, then command-line flags (applied by the binary).
//!
//! Environment variables:
//! - `ZEROONE_DATA_DIR`: shell and canonical artifact directory (default: `data`)
//! - `ZEROONE_VERIFIED_DIR`: verified artifact directory (default: `verified`)
//! - `ZEROONE_ENGINE`: engine command line (default: `M2 --script`)
//! - `ZEROONE_SOLVER`: solver binary (default: `bin/ZeroOneSolver`)
//! - `ZEROONE_BATCH_SIZE`: systems per engine script (default: 500)
//! - `ZEROONE_POLL_MS`: poll interval in milliseconds (default: 250)

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::canonicalizer::CanonicalizerConfig;
use crate::catalog::{ArtifactLayout, ShellLayout, DEFAULT_CANONICAL_PREFIX, DEFAULT_SHELL_PREFIX};
use crate::solver::SolverCommand;
use crate::verify::script::{ScriptLayout, DEFAULT_SCRIPT_PREFIX};
use crate::verify::{EngineCommand, DEFAULT_BATCH_SIZE};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("cannot read config {}: {source}", path.display())]
    Read {
        /// Config file.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The config file is not valid JSON for [`PipelineConfig`].
    #[error("invalid config {}: {source}", path.display())]
    Parse {
        /// Config file.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },
    /// An environment variable has an unusable value.
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// Value found.
        value: String,
    },
    /// A setting is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Everything a pipeline run needs to know.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory holding generated shells.
    pub data_dir: PathBuf,
    /// Directory holding per-degree canonical artifacts.
    pub canonical_dir: PathBuf,
    /// Directory verified artifacts are moved into.
    pub verified_dir: PathBuf,
    /// Directory for engine batch scripts.
    pub script_dir: PathBuf,
    /// Shell file prefix.
    pub shell_prefix: String,
    /// Canonical artifact file prefix.
    pub canonical_prefix: String,
    /// Batch script file prefix.
    pub script_prefix: String,
    /// Algebra engine command.
    pub engine: EngineCommand,
    /// Solver contract.
    pub solver: SolverCommand,
    /// Systems per engine script.
    pub batch_size: usize,
    /// Sleep between polls of running children, in milliseconds.
    pub poll_interval_ms: u64,
    /// Canonicalizer limits.
    pub canonicalizer: CanonicalizerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            canonical_dir: PathBuf::from("data"),
            verified_dir: PathBuf::from("verified"),
            script_dir: PathBuf::from("scripts"),
            shell_prefix: DEFAULT_SHELL_PREFIX.to_string(),
            canonical_prefix: DEFAULT_CANONICAL_PREFIX.to_string(),
            script_prefix: DEFAULT_SCRIPT_PREFIX.to_string(),
            engine: EngineCommand::default(),
            solver: SolverCommand::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval_ms: 250,
            canonicalizer: CanonicalizerConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Defaults, then `file` if given, then the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config; missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override settings from environment variables looked up via `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("ZEROONE_DATA_DIR") {
            self.data_dir = PathBuf::from(&dir);
            self.canonical_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("ZEROONE_VERIFIED_DIR") {
            self.verified_dir = PathBuf::from(dir);
        }
        if let Some(engine) = lookup("ZEROONE_ENGINE") {
            self.engine = EngineCommand::parse(&engine).ok_or(ConfigError::InvalidEnv {
                var: "ZEROONE_ENGINE",
                value: engine.clone(),
            })?;
        }
        if let Some(solver) = lookup("ZEROONE_SOLVER") {
            self.solver.binary = solver;
        }
        if let Some(value) = lookup("ZEROONE_BATCH_SIZE") {
            self.batch_size = parse_env("ZEROONE_BATCH_SIZE", value)?;
        }
        if let Some(value) = lookup("ZEROONE_POLL_MS") {
            self.poll_interval_ms = parse_env("ZEROONE_POLL_MS", value)?;
        }
        Ok(())
    }

    /// Reject settings no run can use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".to_string()));
        }
        if self.engine.program.is_empty() {
            return Err(ConfigError::Invalid("engine program is empty".to_string()));
        }
        if self.solver.binary.is_empty() {
            return Err(ConfigError::Invalid("solver binary is empty".to_string()));
        }
        Ok(())
    }

    /// Sleep between polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Where shells live.
    pub fn shell_layout(&self) -> ShellLayout {
        ShellLayout {
            dir: self.data_dir.clone(),
            prefix: self.shell_prefix.clone(),
        }
    }

    /// Where canonical artifacts live.
    pub fn artifact_layout(&self) -> ArtifactLayout {
        ArtifactLayout {
            dir: self.canonical_dir.clone(),
            verified_dir: self.verified_dir.clone(),
            prefix: self.canonical_prefix.clone(),
        }
    }

    /// Where batch scripts are written.
    pub fn script_layout(&self) -> ScriptLayout {
        ScriptLayout {
            dir: self.script_dir.clone(),
            prefix: self.script_prefix.clone(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_default_settings() {
        let config = PipelineConfig::default();
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.engine.program, "M2");
        assert_eq!(config.solver.args, vec!["{n}", "{m}", "--paranoid"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = PipelineConfig::default();
        config
            .apply_env(env(&[
                ("ZEROONE_DATA_DIR", "/tmp/shells"),
                ("ZEROONE_ENGINE", "/opt/m2/bin/M2 --script --silent"),
                ("ZEROONE_BATCH_SIZE", "64"),
            ]))
            .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/shells"));
        assert_eq!(config.artifact_layout().dir, PathBuf::from("/tmp/shells"));
        assert_eq!(config.engine.args, vec!["--script", "--silent"]);
        assert_eq!(config.batch_size, 64);
    }

    #[test]
    fn test_bad_env_value_is_an_error() {
        let mut config = PipelineConfig::default();
        let err = config
            .apply_env(env(&[("ZEROONE_POLL_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: "ZEROONE_POLL_MS", .. }));
    }

    #[test]
    fn test_partial_json_file_keeps_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("zeroone.json");
        fs::write(
            &path,
            r#"{ "batch_size": 10, "canonicalizer": { "max_iterations": 7, "max_candidates": 5 } }"#,
        )
        .unwrap();

        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.canonicalizer.max_iterations, 7);
        assert_eq!(config.verified_dir, PathBuf::from("verified"));
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let config = PipelineConfig {
            batch_size: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
