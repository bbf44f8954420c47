//! Filesystem collector: walks registered root paths and captures a tree of
//! [`FsEntry`] values per root.

pub mod db;
mod diff;
mod entry;
mod walk;

pub use diff::{TreeDiff, make_diff};
pub use entry::{DiffFile, EntryKind, FsEntry, same_children};

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use rusqlite::Connection;
use tracing::{error, info};

use crate::codec::{CodecError, Reader, put_varint};
use crate::collector::traits::{FileSystem, RealFs};
use crate::collector::{CollectError, Collector, CollectorKind, CollectorState};

use walk::Walker;

pub struct FileSystemCollector {
    fs: Arc<dyn FileSystem>,
    rules: Vec<PathBuf>,
    exclusions: Vec<PathBuf>,
    state: CollectorState,
    roots: Vec<FsEntry>,
    result: Vec<u8>,
    errors: Vec<CollectError>,
}

impl FileSystemCollector {
    /// Collector over the real host filesystem.
    pub fn new() -> Self {
        Self::with_fs(Arc::new(RealFs::new()))
    }

    pub fn with_fs(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            rules: Vec::new(),
            exclusions: Vec::new(),
            state: CollectorState::Idle,
            roots: Vec::new(),
            result: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Finished collector holding already built trees.
    pub fn from_roots(roots: Vec<FsEntry>) -> Result<Self, CodecError> {
        let mut collector = Self::new();
        collector.result = encode_roots(&roots)?;
        collector.roots = roots;
        collector.state = CollectorState::Finished;
        Ok(collector)
    }

    /// Adds a root path to walk.
    pub fn set_rule(&mut self, path: impl Into<PathBuf>) {
        self.rules.push(path.into());
    }

    /// Replaces the root paths to walk.
    pub fn set_rules<P: Into<PathBuf>>(&mut self, paths: impl IntoIterator<Item = P>) {
        self.rules = paths.into_iter().map(Into::into).collect();
    }

    /// Paths below `path` are not entered.
    pub fn exclude(&mut self, path: impl Into<PathBuf>) {
        self.exclusions.push(path.into());
    }

    pub fn rules(&self) -> &[PathBuf] {
        &self.rules
    }

    /// One tree per rule that could be captured, in rule order.
    pub fn roots(&self) -> &[FsEntry] {
        &self.roots
    }
}

impl Default for FileSystemCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_roots(roots: &[FsEntry]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    put_varint(&mut out, roots.len() as u64)?;
    for root in roots {
        root.encode_under(None, &mut out)?;
    }
    Ok(out)
}

impl Collector for FileSystemCollector {
    fn kind(&self) -> CollectorKind {
        CollectorKind::FileSystem
    }

    fn state(&self) -> CollectorState {
        self.state
    }

    /// Walks every rule on its own worker thread and joins them all.
    fn run(&mut self) {
        self.state = CollectorState::Running;
        self.errors.clear();

        let fs: &dyn FileSystem = self.fs.as_ref();
        let exclusions = &self.exclusions;
        let outcomes: Vec<(PathBuf, thread::Result<(Option<FsEntry>, Vec<CollectError>)>)> =
            thread::scope(|scope| {
                let handles: Vec<_> = self
                    .rules
                    .iter()
                    .map(|rule| {
                        let handle = scope.spawn(move || {
                            let mut walker = Walker::new(fs, exclusions);
                            let root = walker.walk(rule);
                            (root, walker.into_errors())
                        });
                        (rule.clone(), handle)
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|(rule, handle)| (rule, handle.join()))
                    .collect()
            });

        let mut roots = Vec::with_capacity(outcomes.len());
        let mut errors = Vec::new();
        for (rule, outcome) in outcomes {
            match outcome {
                Ok((root, worker_errors)) => {
                    roots.extend(root);
                    errors.extend(worker_errors);
                }
                Err(_) => {
                    error!(rule = %rule.display(), "filesystem worker panicked");
                    errors.push(CollectError::WorkerPanicked(rule.display().to_string()));
                }
            }
        }

        match encode_roots(&roots) {
            Ok(result) => self.result = result,
            Err(e) => {
                error!(error = %e, "cannot encode filesystem result");
                self.result.clear();
                errors.push(e.into());
            }
        }

        let entries: usize = roots.iter().map(FsEntry::entry_count).sum();
        info!(
            rules = self.rules.len(),
            entries,
            errors = errors.len(),
            "filesystem collection finished"
        );
        self.roots = roots;
        self.errors = errors;
        self.state = CollectorState::Finished;
    }

    fn result(&self) -> &[u8] {
        &self.result
    }

    fn errors(&self) -> &[CollectError] {
        &self.errors
    }

    fn import_bin(&mut self, payload: &[u8]) -> Result<(), CodecError> {
        let mut reader = Reader::new(payload);
        let count = reader.count()?;
        let mut roots = Vec::with_capacity(count);
        for _ in 0..count {
            roots.push(FsEntry::decode_under(&mut reader, None)?);
        }
        if !reader.is_empty() {
            return Err(CodecError::Invalid(format!(
                "{} trailing bytes after filesystem payload",
                reader.remaining().len()
            )));
        }
        self.roots = roots;
        self.result = payload.to_vec();
        self.state = CollectorState::Finished;
        Ok(())
    }

    fn export_db(&self, conn: &Connection, run_id: &str) -> rusqlite::Result<()> {
        db::export_snapshot(conn, run_id, &self.roots)
    }

    fn import_db(&mut self, conn: &Connection, run_id: &str) -> rusqlite::Result<()> {
        let roots = db::import_snapshot(conn, run_id)?;
        self.result = encode_roots(&roots)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        self.roots = roots;
        self.state = CollectorState::Finished;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
