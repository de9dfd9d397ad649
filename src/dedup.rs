//! Streaming deduplication of canonical systems across degree shells.
//!
//! ## Contract
//!
//! For each degree in ascending order, for each shell in catalog order, for
//! each block in file order: parse, canonicalize, and emit only if the
//! canonical form is new to the run. Every canonical form is recorded in the
//! run's "seen" set whether or not it was emitted.
//!
//! ```text
//! ShellCatalog ─▶ BlockReader ─▶ parse ─▶ Canonicalizer ─▶ seen? ─▶ StreamEvent
//!                                                                      │
//!                                         ArtifactWriter (temp ─▶ rename per degree)
//! ```
//!
//! Emission order is a deterministic function of (degree, shell order,
//! in-file order). Malformed blocks are item-local: the stream logs them,
//! yields an error, and continues with the next block.
//!
//! ## Resumption
//!
//! [`RunContext::seed_from_artifacts`] reloads every completed per-degree
//! artifact (pending or verified) into the seen set and reports the first
//! degree without one, so a crash after N completed degrees resumes at N+1.

use std::collections::{HashSet, VecDeque};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::canonicalizer::{CanonicalizeError, Canonicalizer, CanonicalizerConfig};
use crate::catalog::{ArtifactLayout, MissingInputError, ShellCatalog, ShellKey};
use crate::codec::{write_block, BlockReader, FormatError};
use crate::types::CanonicalSystem;

/// Error type for the dedup stream.
#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    /// A shell needed for the next degree does not exist yet.
    #[error(transparent)]
    Missing(#[from] MissingInputError),
    /// A block could not be parsed (item-local).
    #[error("{}: block {block} (line {line}): {source}", path.display())]
    Format {
        /// Shell file.
        path: PathBuf,
        /// 0-based block index within the file.
        block: usize,
        /// 1-based line of the block start.
        line: usize,
        /// Underlying format error.
        source: FormatError,
    },
    /// A parsed block could not be canonicalized (item-local).
    #[error("{}: block {block} (line {line}): {source}", path.display())]
    Canonicalize {
        /// Shell file.
        path: PathBuf,
        /// 0-based block index within the file.
        block: usize,
        /// 1-based line of the block start.
        line: usize,
        /// Underlying canonicalization error.
        source: CanonicalizeError,
    },
    /// A completed artifact used as a seed is malformed.
    #[error("corrupt artifact {}: {reason}", path.display())]
    CorruptArtifact {
        /// Artifact file.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },
    /// A file could not be opened or read.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
}

impl DedupError {
    /// Whether the stream skips this item and keeps going.
    pub fn is_item_local(&self) -> bool {
        matches!(self, Self::Format { .. } | Self::Canonicalize { .. })
    }
}

/// Counters for one degree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DegreeStats {
    /// Blocks read (including rejected ones).
    pub read: usize,
    /// New canonical systems emitted.
    pub emitted: usize,
    /// Blocks whose canonical form was already seen.
    pub duplicates: usize,
    /// Blocks skipped for format or canonicalization errors.
    pub rejected: usize,
}

/// One newly seen canonical system and where it came from.
#[derive(Debug, Clone)]
pub struct Emission {
    /// Degree being processed.
    pub degree: u32,
    /// Shell the block came from.
    pub shell: ShellKey,
    /// 0-based block index within the shell file.
    pub block: usize,
    /// The canonical form.
    pub system: CanonicalSystem,
}

/// Events produced by [`DedupStream`].
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// All shells of `degree` exist; its blocks follow.
    DegreeStarted {
        /// Degree being started.
        degree: u32,
    },
    /// A system not seen before in this run.
    Emitted(Emission),
    /// Every shell of `degree` has been read.
    DegreeFinished {
        /// Degree just completed.
        degree: u32,
        /// Counters for the degree.
        stats: DegreeStats,
    },
}

/// Run-scoped state: the "seen" set and the canonicalizer.
///
/// Single writer; constructed per run and dropped at its end. Cross-run
/// persistence goes through [`RunContext::seed_from_artifacts`].
#[derive(Debug)]
pub struct RunContext {
    seen: HashSet<CanonicalSystem>,
    canonicalizer: Canonicalizer,
}

impl RunContext {
    /// Empty context.
    pub fn new(canonicalizer: Canonicalizer) -> Self {
        Self {
            seen: HashSet::new(),
            canonicalizer,
        }
    }

    /// Number of distinct canonical systems seen.
    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    /// Record a canonical system; `true` if it was new.
    pub fn observe(&mut self, system: CanonicalSystem) -> bool {
        self.seen.insert(system)
    }

    /// Load completed artifacts for degrees `0, 1, 2, ...` until the first
    /// gap. Returns the first degree without a completed artifact.
    pub fn seed_from_artifacts(&mut self, layout: &ArtifactLayout) -> Result<u32, DedupError> {
        let mut degree = 0;
        while let Some(path) = layout.completed(degree) {
            let loaded = self.seed_from_file(&path)?;
            debug!(degree, path = %path.display(), loaded, "Seeded from artifact");
            degree += 1;
        }
        info!(resume_degree = degree, seen = self.seen.len(), "Run context seeded");
        Ok(degree)
    }

    fn seed_from_file(&mut self, path: &Path) -> Result<usize, DedupError> {
        let reader = BlockReader::open(path).map_err(|source| DedupError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut loaded = 0;
        let corrupt = |reason: String| DedupError::CorruptArtifact {
            path: path.to_path_buf(),
            reason,
        };
        for block in reader {
            let system = block
                .and_then(|b| b.parse())
                .map_err(|e| corrupt(e.to_string()))?;
            let canonical = self
                .canonicalizer
                .canonicalize(&system)
                .map_err(|e| corrupt(e.to_string()))?;
            self.observe(canonical);
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Stream degrees in `degrees` through this context.
    pub fn stream<'a>(
        &'a mut self,
        catalog: &'a ShellCatalog,
        degrees: RangeInclusive<u32>,
    ) -> DedupStream<'a> {
        DedupStream {
            ctx: self,
            catalog,
            next_degree: *degrees.start(),
            last_degree: *degrees.end(),
            current: None,
            finished: degrees.is_empty(),
        }
    }
}

struct OpenShell {
    key: ShellKey,
    path: PathBuf,
    blocks: BlockReader<BufReader<File>>,
    next_block: usize,
}

struct DegreeState {
    degree: u32,
    pending: VecDeque<(ShellKey, PathBuf)>,
    open: Option<OpenShell>,
    stats: DegreeStats,
}

/// Lazy, deterministic stream of [`StreamEvent`]s.
///
/// Stops after the last requested degree, or after the first
/// non-item-local error (missing shell or I/O failure).
pub struct DedupStream<'a> {
    ctx: &'a mut RunContext,
    catalog: &'a ShellCatalog,
    next_degree: u32,
    last_degree: u32,
    current: Option<DegreeState>,
    finished: bool,
}

impl<'a> DedupStream<'a> {
    fn start_degree(&mut self) -> Option<Result<StreamEvent, DedupError>> {
        if self.next_degree > self.last_degree {
            self.finished = true;
            return None;
        }

        let degree = self.next_degree;
        if let Err(missing) = self.catalog.require_degree(degree) {
            self.finished = true;
            return Some(Err(missing.into()));
        }

        match self.next_degree.checked_add(1) {
            Some(next) => self.next_degree = next,
            None => self.last_degree = 0,
        }
        self.current = Some(DegreeState {
            degree,
            pending: self.catalog.shells(degree).into(),
            open: None,
            stats: DegreeStats::default(),
        });
        Some(Ok(StreamEvent::DegreeStarted { degree }))
    }

    fn fail(&mut self, path: PathBuf, source: io::Error) -> Option<Result<StreamEvent, DedupError>> {
        self.finished = true;
        Some(Err(DedupError::Io { path, source }))
    }
}

impl<'a> Iterator for DedupStream<'a> {
    type Item = Result<StreamEvent, DedupError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }

            let Some(state) = self.current.as_mut() else {
                return self.start_degree();
            };

            if state.open.is_none() {
                let Some((key, path)) = state.pending.pop_front() else {
                    let degree = state.degree;
                    let stats = state.stats;
                    self.current = None;
                    info!(
                        degree,
                        read = stats.read,
                        emitted = stats.emitted,
                        duplicates = stats.duplicates,
                        rejected = stats.rejected,
                        "Degree finished"
                    );
                    return Some(Ok(StreamEvent::DegreeFinished { degree, stats }));
                };
                match BlockReader::open(&path) {
                    Ok(blocks) => {
                        debug!(shell = %key, path = %path.display(), "Reading shell");
                        state.open = Some(OpenShell { key, path, blocks, next_block: 0 });
                    }
                    Err(e) => return self.fail(path, e),
                }
            }

            let Some(shell) = state.open.as_mut() else {
                continue;
            };
            let Some(next) = shell.blocks.next() else {
                state.open = None;
                continue;
            };

            let block = shell.next_block;
            shell.next_block += 1;

            let raw = match next {
                Ok(raw) => raw,
                Err(FormatError::Io(e)) => {
                    let path = shell.path.clone();
                    return self.fail(path, e);
                }
                Err(source) => {
                    state.stats.read += 1;
                    state.stats.rejected += 1;
                    let err = DedupError::Format {
                        path: shell.path.clone(),
                        block,
                        line: format_error_line(&source),
                        source,
                    };
                    warn!(error = %err, "Skipping malformed block");
                    return Some(Err(err));
                }
            };

            state.stats.read += 1;
            let system = match raw.parse() {
                Ok(system) => system,
                Err(source) => {
                    state.stats.rejected += 1;
                    let err = DedupError::Format {
                        path: shell.path.clone(),
                        block,
                        line: raw.line,
                        source,
                    };
                    warn!(error = %err, "Skipping malformed block");
                    return Some(Err(err));
                }
            };

            let canonical = match self.ctx.canonicalizer.canonicalize(&system) {
                Ok(c) => c,
                Err(source) => {
                    state.stats.rejected += 1;
                    let err = DedupError::Canonicalize {
                        path: shell.path.clone(),
                        block,
                        line: raw.line,
                        source,
                    };
                    warn!(error = %err, "Skipping block that failed to canonicalize");
                    return Some(Err(err));
                }
            };

            if !self.ctx.observe(canonical.clone()) {
                state.stats.duplicates += 1;
                continue;
            }
            state.stats.emitted += 1;

            return Some(Ok(StreamEvent::Emitted(Emission {
                degree: state.degree,
                shell: shell.key,
                block,
                system: canonical,
            })));
        }
    }
}

fn format_error_line(err: &FormatError) -> usize {
    match err {
        FormatError::EmptyBlock { line } | FormatError::UnterminatedBlock { line } => *line,
        _ => 0,
    }
}

/// Writes stream events into per-degree artifacts.
///
/// Each degree is written to `<artifact>.temp`, flushed after every
/// emission, and renamed to its final name when the degree finishes.
#[derive(Debug)]
pub struct ArtifactWriter {
    layout: ArtifactLayout,
    open: Option<(u32, BufWriter<File>)>,
}

impl ArtifactWriter {
    /// Create a writer; the artifact directory is created if missing.
    pub fn new(layout: ArtifactLayout) -> io::Result<Self> {
        fs::create_dir_all(&layout.dir)?;
        Ok(Self { layout, open: None })
    }

    /// The layout written to.
    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Apply one stream event. Returns the published path on degree finish.
    pub fn handle(&mut self, event: &StreamEvent) -> io::Result<Option<PathBuf>> {
        match event {
            StreamEvent::DegreeStarted { degree } => {
                self.begin(*degree)?;
                Ok(None)
            }
            StreamEvent::Emitted(emission) => {
                self.append(&emission.system)?;
                Ok(None)
            }
            StreamEvent::DegreeFinished { degree, .. } => self.finish(*degree).map(Some),
        }
    }

    /// Open (truncating) the temp file for `degree`.
    pub fn begin(&mut self, degree: u32) -> io::Result<()> {
        let file = File::create(self.layout.temp_path(degree))?;
        self.open = Some((degree, BufWriter::new(file)));
        Ok(())
    }

    /// Append one canonical system and flush.
    pub fn append(&mut self, system: &CanonicalSystem) -> io::Result<()> {
        let (_, writer) = self
            .open
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no degree open for writing"))?;
        write_block(writer, system.as_system())?;
        writer.flush()
    }

    /// Sync and publish the temp file under its final name.
    pub fn finish(&mut self, degree: u32) -> io::Result<PathBuf> {
        let (open_degree, writer) = self
            .open
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no degree open for writing"))?;
        if open_degree != degree {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("degree {} finished while {} was open", degree, open_degree),
            ));
        }

        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        let final_path = self.layout.path(degree);
        fs::rename(self.layout.temp_path(degree), &final_path)?;
        info!(degree, path = %final_path.display(), "Published canonical artifact");
        Ok(final_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ShellLayout;
    use tempfile::TempDir;

    fn write_shell(layout: &ShellLayout, m: u32, n: u32, body: &str) {
        fs::write(layout.path(ShellKey::new(m, n).unwrap()), body).unwrap();
    }

    fn emitted(events: &[Result<StreamEvent, DedupError>]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                Ok(StreamEvent::Emitted(em)) => Some(em.system.to_string()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_relabeled_duplicate_emits_once() {
        let dir = TempDir::new().unwrap();
        let layout = ShellLayout::new(dir.path());
        write_shell(&layout, 1, 2, "a1*a2 + b1\nb1*b2 + a1\n\nb3*b7 + a5\na5*a9 + b3\n\n");

        let catalog = ShellCatalog::new(layout);
        let mut ctx = RunContext::new(Canonicalizer::default());
        let events: Vec<_> = ctx.stream(&catalog, 3..=3).collect();

        assert_eq!(emitted(&events).len(), 1);
        match events.last() {
            Some(Ok(StreamEvent::DegreeFinished { degree: 3, stats })) => {
                assert_eq!(stats.read, 2);
                assert_eq!(stats.duplicates, 1);
            }
            other => panic!("unexpected last event: {:?}", other),
        }
        assert_eq!(ctx.seen_len(), 1);
    }

    #[test]
    fn test_trivial_degrees_start_and_finish() {
        let dir = TempDir::new().unwrap();
        let catalog = ShellCatalog::new(ShellLayout::new(dir.path()));
        let mut ctx = RunContext::new(Canonicalizer::default());

        let events: Vec<_> = ctx.stream(&catalog, 0..=2).collect();
        assert_eq!(events.len(), 6);
        assert!(events.iter().all(|e| e.is_ok()));
    }

    #[test]
    fn test_missing_shell_stops_stream() {
        let dir = TempDir::new().unwrap();
        let catalog = ShellCatalog::new(ShellLayout::new(dir.path()));
        let mut ctx = RunContext::new(Canonicalizer::default());

        let events: Vec<_> = ctx.stream(&catalog, 2..=4).collect();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[2], Err(DedupError::Missing(_))));
    }

    #[test]
    fn test_malformed_block_is_skipped() {
        let dir = TempDir::new().unwrap();
        let layout = ShellLayout::new(dir.path());
        write_shell(&layout, 1, 2, "a1*a2*a3\n\na1 + a2\n\n");

        let catalog = ShellCatalog::new(layout);
        let mut ctx = RunContext::new(Canonicalizer::default());
        let events: Vec<_> = ctx.stream(&catalog, 3..=3).collect();

        let errors: Vec<_> = events.iter().filter_map(|e| e.as_ref().err()).collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_item_local());
        assert_eq!(emitted(&events), vec!["a1 + a2"]);
    }

    #[test]
    fn test_canonicalize_failure_is_skipped_and_stream_continues() {
        let dir = TempDir::new().unwrap();
        let layout = ShellLayout::new(dir.path());
        write_shell(&layout, 1, 2, "a1 + a2\n\n");
        write_shell(&layout, 1, 3, "b1\n\n");

        let catalog = ShellCatalog::new(layout);
        // A zero iteration cap can never confirm a fixed point.
        let canonicalizer = Canonicalizer::new(CanonicalizerConfig {
            max_iterations: 0,
            ..CanonicalizerConfig::default()
        });
        let mut ctx = RunContext::new(canonicalizer);
        let events: Vec<_> = ctx.stream(&catalog, 3..=4).collect();

        assert_eq!(events.len(), 6);
        assert!(matches!(events[0], Ok(StreamEvent::DegreeStarted { degree: 3 })));
        match &events[1] {
            Err(err) => {
                assert!(err.is_item_local());
                assert!(matches!(
                    err,
                    DedupError::Canonicalize {
                        block: 0,
                        line: 1,
                        source: CanonicalizeError::FixedPointNotReached { .. },
                        ..
                    }
                ));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match &events[2] {
            Ok(StreamEvent::DegreeFinished { degree: 3, stats }) => {
                assert_eq!(stats.read, 1);
                assert_eq!(stats.rejected, 1);
                assert_eq!(stats.emitted, 0);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(events[3], Ok(StreamEvent::DegreeStarted { degree: 4 })));
        assert!(matches!(events[4], Err(DedupError::Canonicalize { .. })));
        assert_eq!(ctx.seen_len(), 0);
    }

    #[test]
    fn test_unterminated_shell_is_format_error() {
        let dir = TempDir::new().unwrap();
        let layout = ShellLayout::new(dir.path());
        write_shell(&layout, 1, 2, "a1\n\nb1\n");

        let catalog = ShellCatalog::new(layout);
        let mut ctx = RunContext::new(Canonicalizer::default());
        let events: Vec<_> = ctx.stream(&catalog, 3..=3).collect();

        assert_eq!(emitted(&events), vec!["a1"]);
        assert!(events.iter().any(|e| matches!(
            e,
            Err(DedupError::Format { source: FormatError::UnterminatedBlock { .. }, .. })
        )));
    }

    #[test]
    fn test_writer_publishes_and_seed_resumes() {
        let dir = TempDir::new().unwrap();
        let shells = ShellLayout::new(dir.path().join("data"));
        fs::create_dir_all(&shells.dir).unwrap();
        write_shell(&shells, 1, 2, "a1 + a2\n\n");
        write_shell(&shells, 1, 3, "a2 + a1\n\na1*a2\n\n");

        let artifacts = ArtifactLayout::new(dir.path().join("canon"), dir.path().join("verified"));
        let catalog = ShellCatalog::new(shells);

        let mut ctx = RunContext::new(Canonicalizer::default());
        let mut writer = ArtifactWriter::new(artifacts.clone()).unwrap();
        for event in ctx.stream(&catalog, 0..=4) {
            writer.handle(&event.unwrap()).unwrap();
        }

        for degree in 0..=4 {
            assert!(artifacts.path(degree).is_file());
            assert!(!artifacts.temp_path(degree).exists());
        }
        assert_eq!(fs::read_to_string(artifacts.path(3)).unwrap(), "a1 + a2\n\n");
        assert_eq!(fs::read_to_string(artifacts.path(4)).unwrap(), "a1*a2\n\n");

        let mut resumed = RunContext::new(Canonicalizer::default());
        assert_eq!(resumed.seed_from_artifacts(&artifacts).unwrap(), 5);
        assert_eq!(resumed.seen_len(), 2);
    }
}
