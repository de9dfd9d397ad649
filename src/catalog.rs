//! Shell catalog: which generated shells exist and in what order to read them.
//!
//! A shell is the set of generated systems for one `(m, n)` pair with
//! `0 < m < n`. Shells are grouped by degree `k = m + n`; within a degree,
//! pairs enumerate by ascending `m`. A degree with no valid pairs (0, 1, 2)
//! is trivially available.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Default file prefix for generated shells.
pub const DEFAULT_SHELL_PREFIX: &str = "ZeroOneEquations";

/// Default file prefix for per-degree canonical artifacts.
pub const DEFAULT_CANONICAL_PREFIX: &str = "CanonicalEquations";

/// Suffix marking a file that is still being written.
pub const TEMP_SUFFIX: &str = "temp";

/// The parameter pair identifying one shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShellKey {
    /// Smaller parameter.
    pub m: u32,
    /// Larger parameter.
    pub n: u32,
}

impl ShellKey {
    /// Create a key; `None` unless `0 < m < n`.
    pub fn new(m: u32, n: u32) -> Option<Self> {
        (0 < m && m < n).then_some(Self { m, n })
    }

    /// Degree `m + n`.
    pub fn degree(&self) -> u32 {
        self.m + self.n
    }
}

impl fmt::Display for ShellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.m, self.n)
    }
}

/// Valid pairs of degree `d` in catalog order (ascending `m`).
pub fn pairs_of_degree(d: u32) -> impl Iterator<Item = ShellKey> {
    (1..=d.saturating_sub(1) / 2).filter_map(move |m| ShellKey::new(m, d - m))
}

/// Every valid pair, degree by degree, without end.
pub fn all_pairs() -> impl Iterator<Item = ShellKey> {
    (0u32..).flat_map(pairs_of_degree)
}

/// An expected shell is absent. Halts only the stage that needs it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("shell {key} for degree {degree} is not yet available at {}", path.display())]
pub struct MissingInputError {
    /// Degree that cannot be processed.
    pub degree: u32,
    /// First missing shell of that degree.
    pub key: ShellKey,
    /// Where the shell was expected.
    pub path: PathBuf,
}

/// Maps shell keys to file paths.
///
/// Files are named `<prefix>_<n:04>_<m:04>.txt`, larger parameter first,
/// matching the solver's argument order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellLayout {
    /// Directory holding shell files.
    pub dir: PathBuf,
    /// File name prefix.
    pub prefix: String,
}

impl ShellLayout {
    /// Layout with the default prefix.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            prefix: DEFAULT_SHELL_PREFIX.to_string(),
        }
    }

    /// Final path of a shell.
    pub fn path(&self, key: ShellKey) -> PathBuf {
        self.dir.join(format!("{}_{:04}_{:04}.txt", self.prefix, key.n, key.m))
    }

    /// Scratch path for an in-progress shell, unique per key.
    pub fn temp_path(&self, key: ShellKey) -> PathBuf {
        let mut name = self.path(key).into_os_string();
        name.push(format!(".{}.{}", key.degree(), TEMP_SUFFIX));
        PathBuf::from(name)
    }
}

/// Maps degrees to per-degree canonical artifact paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLayout {
    /// Directory holding in-progress and completed artifacts.
    pub dir: PathBuf,
    /// Directory verified artifacts are moved into.
    pub verified_dir: PathBuf,
    /// File name prefix.
    pub prefix: String,
}

impl ArtifactLayout {
    /// Layout with the default prefix.
    pub fn new(dir: impl Into<PathBuf>, verified_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            verified_dir: verified_dir.into(),
            prefix: DEFAULT_CANONICAL_PREFIX.to_string(),
        }
    }

    /// File name of the degree-`k` artifact.
    pub fn file_name(&self, degree: u32) -> String {
        format!("{}_{:04}.txt", self.prefix, degree)
    }

    /// Path of the completed degree-`k` artifact awaiting verification.
    pub fn path(&self, degree: u32) -> PathBuf {
        self.dir.join(self.file_name(degree))
    }

    /// Scratch path used while the degree is being written.
    pub fn temp_path(&self, degree: u32) -> PathBuf {
        self.dir.join(format!("{}.{}", self.file_name(degree), TEMP_SUFFIX))
    }

    /// Where the artifact lives once verified.
    pub fn verified_path(&self, degree: u32) -> PathBuf {
        self.verified_dir.join(self.file_name(degree))
    }

    /// The completed artifact for `degree`, wherever it currently lives.
    pub fn completed(&self, degree: u32) -> Option<PathBuf> {
        [self.path(degree), self.verified_path(degree)]
            .into_iter()
            .find(|p| p.is_file())
    }

    /// Degree encoded in an artifact file name, if it is one of ours.
    pub fn degree_of(&self, path: &Path) -> Option<u32> {
        let name = path.file_name()?.to_str()?;
        let digits = name
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix('_')?
            .strip_suffix(".txt")?;
        if digits.len() < 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    /// Completed, not-yet-verified artifacts in ascending degree order.
    pub fn pending(&self) -> std::io::Result<Vec<(u32, PathBuf)>> {
        let mut found = Vec::new();
        if !self.dir.is_dir() {
            return Ok(found);
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if let Some(degree) = self.degree_of(&path) {
                found.push((degree, path));
            }
        }
        found.sort();
        Ok(found)
    }
}

/// Determines which shells exist and how far processing can go.
#[derive(Debug, Clone)]
pub struct ShellCatalog {
    layout: ShellLayout,
}

impl ShellCatalog {
    /// Create a catalog over a shell layout.
    pub fn new(layout: ShellLayout) -> Self {
        Self { layout }
    }

    /// The underlying layout.
    pub fn layout(&self) -> &ShellLayout {
        &self.layout
    }

    /// Whether the shell's final file exists.
    pub fn is_available(&self, key: ShellKey) -> bool {
        self.layout.path(key).is_file()
    }

    /// Shells of degree `d` with their paths, in catalog order.
    pub fn shells(&self, d: u32) -> Vec<(ShellKey, PathBuf)> {
        pairs_of_degree(d).map(|k| (k, self.layout.path(k))).collect()
    }

    /// Fail with the first missing shell of degree `d`, if any.
    pub fn require_degree(&self, d: u32) -> Result<(), MissingInputError> {
        match pairs_of_degree(d).find(|k| !self.is_available(*k)) {
            None => Ok(()),
            Some(key) => Err(MissingInputError {
                degree: d,
                key,
                path: self.layout.path(key),
            }),
        }
    }

    /// Maximal `k` such that every degree in `0..=k` is fully available,
    /// optionally capped at `bound`.
    pub fn available_degree(&self, bound: Option<u32>) -> u32 {
        let mut k = 0;
        loop {
            if bound.is_some_and(|b| k >= b) {
                return k;
            }
            if self.require_degree(k + 1).is_err() {
                return k;
            }
            k += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        std::fs::write(path, "").unwrap();
    }

    #[test]
    fn test_pairs_of_degree() {
        assert_eq!(pairs_of_degree(0).count(), 0);
        assert_eq!(pairs_of_degree(2).count(), 0);
        let five: Vec<_> = pairs_of_degree(5).collect();
        assert_eq!(five, vec![ShellKey { m: 1, n: 4 }, ShellKey { m: 2, n: 3 }]);
        let six: Vec<_> = pairs_of_degree(6).collect();
        assert_eq!(six, vec![ShellKey { m: 1, n: 5 }, ShellKey { m: 2, n: 4 }]);
    }

    #[test]
    fn test_all_pairs_starts_at_degree_three() {
        let first: Vec<_> = all_pairs().take(3).collect();
        assert_eq!(
            first,
            vec![ShellKey { m: 1, n: 2 }, ShellKey { m: 1, n: 3 }, ShellKey { m: 1, n: 4 }]
        );
    }

    #[test]
    fn test_shell_path_format() {
        let layout = ShellLayout::new("data");
        let key = ShellKey::new(2, 7).unwrap();
        assert_eq!(layout.path(key), PathBuf::from("data/ZeroOneEquations_0007_0002.txt"));
        assert_eq!(
            layout.temp_path(key),
            PathBuf::from("data/ZeroOneEquations_0007_0002.txt.9.temp")
        );
    }

    #[test]
    fn test_available_degree_trivial_prefix() {
        let dir = TempDir::new().unwrap();
        let catalog = ShellCatalog::new(ShellLayout::new(dir.path()));
        // Degrees 0..=2 have no pairs, degree 3 needs (1, 2).
        assert_eq!(catalog.available_degree(None), 2);
    }

    #[test]
    fn test_available_degree_stops_at_first_gap() {
        let dir = TempDir::new().unwrap();
        let layout = ShellLayout::new(dir.path());
        for (m, n) in [(1, 2), (1, 3), (1, 4), (1, 5), (2, 4)] {
            touch(&layout.path(ShellKey::new(m, n).unwrap()));
        }
        let catalog = ShellCatalog::new(layout);
        // Degree 5 is missing (2, 3), so degree 6 does not count.
        assert_eq!(catalog.available_degree(None), 4);
        assert_eq!(catalog.available_degree(Some(3)), 3);

        let err = catalog.require_degree(5).unwrap_err();
        assert_eq!(err.key, ShellKey { m: 2, n: 3 });
    }

    #[test]
    fn test_artifact_degree_parsing() {
        let layout = ArtifactLayout::new("data", "verified");
        assert_eq!(layout.degree_of(&layout.path(12)), Some(12));
        assert_eq!(layout.degree_of(&layout.temp_path(12)), None);
        assert_eq!(layout.degree_of(Path::new("data/ZeroOneEquations_0004_0001.txt")), None);
    }

    #[test]
    fn test_artifact_prefix_may_contain_separators() {
        let dir = TempDir::new().unwrap();
        for prefix in ["Canonical_Equations", "canon-eq"] {
            let layout = ArtifactLayout {
                prefix: prefix.to_string(),
                ..ArtifactLayout::new(dir.path(), dir.path().join("verified"))
            };
            touch(&layout.path(3));

            assert_eq!(layout.degree_of(&layout.path(3)), Some(3));
            assert_eq!(layout.degree_of(&layout.path(10_000)), Some(10_000));
            assert_eq!(layout.pending().unwrap(), vec![(3, layout.path(3))]);
        }

        let layout = ArtifactLayout {
            prefix: "Canonical_Equations".to_string(),
            ..ArtifactLayout::new("data", "verified")
        };
        assert_eq!(layout.degree_of(Path::new("data/Canonical_Equations_0004_0001.txt")), None);
        assert_eq!(layout.degree_of(Path::new("data/Canonical_Equations_004.txt")), None);
        assert_eq!(layout.degree_of(Path::new("data/canon-eq_0003.txt")), None);
    }
}
