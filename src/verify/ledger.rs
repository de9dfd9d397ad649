//! Verified-artifact promotion and the append-only ledger.
//!
//! Promotion moves an artifact into the verified directory and appends one
//! JSON line to `ledger.jsonl` there. The ledger line is written after the
//! move, so an entry always names a file that exists in the verified dir.
//! If the append fails the move is undone and the artifact stays pending.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::VerifyError;

/// Ledger file name inside the verified directory.
pub const LEDGER_FILE: &str = "ledger.jsonl";

/// One verified artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Artifact file name.
    pub artifact: String,
    /// Artifact format version.
    pub format: String,
    /// Hex SHA-256 of the artifact contents.
    pub sha256: String,
    /// Systems verified.
    pub systems: usize,
    /// Engine batches used.
    pub batches: usize,
    /// Run that verified it.
    pub run_id: Uuid,
    /// When it was verified.
    pub verified_at: DateTime<Utc>,
}

/// Hex SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> Result<String, VerifyError> {
    let bytes = fs::read(path).map_err(|source| VerifyError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Move `artifact` into `verified_dir` and record it in the ledger.
pub fn promote(
    artifact: &Path,
    verified_dir: &Path,
    systems: usize,
    batches: usize,
    run_id: Uuid,
) -> Result<(PathBuf, LedgerEntry), VerifyError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| VerifyError::Io { path, source }
    };

    let name = artifact
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| VerifyError::Artifact {
            path: artifact.to_path_buf(),
            reason: "path has no file name".to_string(),
        })?;

    let entry = LedgerEntry {
        sha256: sha256_file(artifact)?,
        artifact: name.clone(),
        format: crate::ARTIFACT_FORMAT_VERSION.to_string(),
        systems,
        batches,
        run_id,
        verified_at: Utc::now(),
    };

    fs::create_dir_all(verified_dir).map_err(io_err(verified_dir))?;
    let destination = verified_dir.join(&name);
    fs::rename(artifact, &destination).map_err(io_err(artifact))?;

    if let Err(err) = append_entry(verified_dir, &entry) {
        match fs::rename(&destination, artifact) {
            Ok(()) => warn!(artifact = %name, error = %err, "Ledger append failed; promotion undone"),
            Err(e) => error!(
                artifact = %name,
                error = %err,
                rollback_error = %e,
                "Ledger append failed and the artifact could not be moved back"
            ),
        }
        return Err(err);
    }

    info!(
        artifact = %name,
        sha256 = %entry.sha256,
        systems,
        batches,
        run_id = %run_id,
        "Artifact verified"
    );
    Ok((destination, entry))
}

fn append_entry(verified_dir: &Path, entry: &LedgerEntry) -> Result<(), VerifyError> {
    let ledger = verified_dir.join(LEDGER_FILE);
    let io_err = |source: std::io::Error| VerifyError::Io {
        path: ledger.clone(),
        source,
    };

    let line = serde_json::to_string(entry).map_err(|e| io_err(e.into()))?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&ledger)
        .map_err(io_err)?;
    writeln!(file, "{}", line).map_err(io_err)
}

/// Read every ledger entry, oldest first. A missing ledger is empty.
pub fn read_ledger(verified_dir: &Path) -> Result<Vec<LedgerEntry>, VerifyError> {
    let path = verified_dir.join(LEDGER_FILE);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(VerifyError::Io { path, source }),
    };

    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            serde_json::from_str(l).map_err(|e| VerifyError::Artifact {
                path: path.clone(),
                reason: e.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_promote_moves_and_records() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("CanonicalEquations_0005.txt");
        fs::write(&artifact, "a1\n\n").unwrap();
        let verified = dir.path().join("verified");
        let run_id = Uuid::new_v4();

        let (dest, entry) = promote(&artifact, &verified, 1, 1, run_id).unwrap();

        assert!(!artifact.exists());
        assert_eq!(fs::read_to_string(&dest).unwrap(), "a1\n\n");
        assert_eq!(entry.sha256.len(), 64);
        assert_eq!(entry.format, crate::ARTIFACT_FORMAT_VERSION);
        assert_eq!(entry.sha256, sha256_file(&dest).unwrap());

        let ledger = read_ledger(&verified).unwrap();
        assert_eq!(ledger, vec![entry]);
        assert_eq!(ledger[0].run_id, run_id);
    }

    #[test]
    fn test_failed_ledger_append_undoes_promotion() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("CanonicalEquations_0005.txt");
        fs::write(&artifact, "a1\n\n").unwrap();
        let verified = dir.path().join("verified");
        // A directory where the ledger file should be makes the append fail.
        fs::create_dir_all(verified.join(LEDGER_FILE)).unwrap();

        let err = promote(&artifact, &verified, 1, 1, Uuid::new_v4()).unwrap_err();

        assert!(matches!(err, VerifyError::Io { ref path, .. } if path.ends_with(LEDGER_FILE)));
        assert_eq!(fs::read_to_string(&artifact).unwrap(), "a1\n\n");
        assert!(!verified.join("CanonicalEquations_0005.txt").exists());
    }

    #[test]
    fn test_missing_ledger_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(read_ledger(dir.path()).unwrap().is_empty());
    }
}
