//! Engine script generation.
//!
//! One query per system, each in its own ring so queries are independent:
//!
//! ```text
//! R = QQ[a1, a2, b1, b2]
//! I = ideal((a1*a2 + b1 - 1), (b1*b2 + a1 - 1))
//! print(1 % I)
//! ```
//!
//! `1 % I` reduces the constant 1 modulo a Gröbner basis of `I`; it prints
//! `0` exactly when `I` is the unit ideal.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::codec::render_engine_generators;
use crate::types::System;

/// Extension of generated engine scripts.
pub const SCRIPT_EXTENSION: &str = "m2";

/// Default file prefix for exported batch scripts.
pub const DEFAULT_SCRIPT_PREFIX: &str = "CanonicalBlock";

/// Token printed for a proved-infeasible query.
pub const PROVED_TOKEN: &str = "0";

/// Render one independent ideal-membership query.
pub fn render_query(system: &System) -> String {
    let vars: Vec<String> = system.variables().into_iter().map(ToString::to_string).collect();
    format!(
        "R = QQ[{}]\nI = ideal({})\nprint(1 % I)\n",
        vars.join(", "),
        render_engine_generators(system)
    )
}

/// A batch script and the number of result lines it must print.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineScript {
    /// Script source.
    pub text: String,
    /// Number of queries (and expected result tokens).
    pub queries: usize,
}

impl EngineScript {
    /// Script with one query per system, in order.
    pub fn for_batch<'a, I>(systems: I) -> Self
    where
        I: IntoIterator<Item = &'a System>,
    {
        let mut text = String::new();
        let mut queries = 0;
        for system in systems {
            text.push_str(&render_query(system));
            queries += 1;
        }
        Self { text, queries }
    }

    /// Write the script to `path`.
    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        fs::write(path, &self.text)
    }
}

/// Naming for exported batch scripts: `<prefix>_<k:04>_<b:06>.m2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptLayout {
    /// Directory scripts are written to.
    pub dir: PathBuf,
    /// File name prefix.
    pub prefix: String,
}

impl ScriptLayout {
    /// Layout with the default prefix.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            prefix: DEFAULT_SCRIPT_PREFIX.to_string(),
        }
    }

    /// Path of batch `batch` of degree `degree`.
    pub fn path(&self, degree: u32, batch: usize) -> PathBuf {
        self.dir.join(format!(
            "{}_{:04}_{:06}.{}",
            self.prefix, degree, batch, SCRIPT_EXTENSION
        ))
    }

    /// Write one script per `batch_size` systems. Returns each script's path
    /// and query count, in batch order.
    pub fn export(
        &self,
        degree: u32,
        systems: &[System],
        batch_size: usize,
    ) -> io::Result<Vec<(PathBuf, usize)>> {
        fs::create_dir_all(&self.dir)?;
        systems
            .chunks(batch_size.max(1))
            .enumerate()
            .map(|(b, chunk)| {
                let script = EngineScript::for_batch(chunk);
                let path = self.path(degree, b);
                script.write_to(&path)?;
                Ok((path, script.queries))
            })
            .collect()
    }
}
