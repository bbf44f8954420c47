//! Orchestration of snapshot runs, diffs and persistence.
//!
//! The manager stages collectors, runs each of them on its own thread, keeps
//! finished runs in memory keyed by run id, and builds diff reports between
//! two runs. Files and the relational store are reached through the
//! collectors' and reports' own codecs.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::codec::CodecError;
use crate::collector::{Collector, CollectorKind, CollectorRegistry, DiffError};
use crate::report::{DiffReport, Filter, decode_report, encode_report};
use crate::storage::{Database, decode_blocks, encode_snapshot, write_atomic};

/// Where the manager keeps its files.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub data_dir: PathBuf,
    /// Extension of snapshot files, without the dot. Default: `snap`.
    pub snapshot_extension: String,
    /// Extension of report files, without the dot. Default: `rep`.
    pub report_extension: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            snapshot_extension: "snap".to_string(),
            report_extension: "rep".to_string(),
        }
    }
}

impl ManagerConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("no collector staged for the snapshot")]
    NoCollectors,

    #[error("{0} is already staged")]
    DuplicateCollector(CollectorKind),

    #[error("{0} is not registered")]
    UnregisteredCollector(CollectorKind),

    #[error("run {0:?} already exists")]
    RunExists(String),

    #[error("run {0:?} not found")]
    UnknownRun(String),

    #[error("run {0:?} is still in progress")]
    RunInProgress(String),

    #[error("report {0:?} already exists")]
    ReportExists(String),

    #[error("report {0:?} not found")]
    UnknownReport(String),

    #[error("cannot start collector thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Diff(#[from] DiffError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

fn find(run: &[Box<dyn Collector>], kind: CollectorKind) -> Option<&dyn Collector> {
    run.iter().find(|c| c.kind() == kind).map(|c| c.as_ref())
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ManagerError + '_ {
    move |source| ManagerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

struct InFlight {
    run_id: String,
    kind: CollectorKind,
    handle: JoinHandle<Box<dyn Collector>>,
}

pub struct AnalysisManager {
    config: ManagerConfig,
    registry: CollectorRegistry,
    staged: Vec<Box<dyn Collector>>,
    in_flight: Vec<InFlight>,
    runs: BTreeMap<String, Vec<Box<dyn Collector>>>,
    reports: BTreeMap<String, DiffReport>,
}

impl AnalysisManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_registry(config, CollectorRegistry::default())
    }

    pub fn with_registry(config: ManagerConfig, registry: CollectorRegistry) -> Self {
        Self {
            config,
            registry,
            staged: Vec::new(),
            in_flight: Vec::new(),
            runs: BTreeMap::new(),
            reports: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &CollectorRegistry {
        &self.registry
    }

    /// Stages a collector for the next [`run_snapshot`](Self::run_snapshot).
    pub fn add_collector(&mut self, collector: Box<dyn Collector>) -> Result<(), ManagerError> {
        let kind = collector.kind();
        if !self.registry.contains(kind) {
            return Err(ManagerError::UnregisteredCollector(kind));
        }
        if self.staged.iter().any(|c| c.kind() == kind) {
            return Err(ManagerError::DuplicateCollector(kind));
        }
        self.staged.push(collector);
        Ok(())
    }

    pub fn staged(&self) -> usize {
        self.staged.len()
    }

    /// Starts every staged collector on its own thread and returns.
    ///
    /// Completion is observed by polling [`is_running`](Self::is_running).
    pub fn run_snapshot(&mut self, run_id: &str) -> Result<(), ManagerError> {
        if self.staged.is_empty() {
            return Err(ManagerError::NoCollectors);
        }
        if self.runs.contains_key(run_id) || self.in_progress(run_id) {
            return Err(ManagerError::RunExists(run_id.to_string()));
        }

        let staged = std::mem::take(&mut self.staged);
        let collectors = staged.len();
        let mut started = Vec::with_capacity(collectors);
        for mut collector in staged {
            let kind = collector.kind();
            let handle = thread::Builder::new()
                .name(format!("collector-{:02x}", kind.tag()))
                .spawn(move || {
                    collector.run();
                    collector
                })
                .map_err(ManagerError::Spawn)?;
            started.push(InFlight {
                run_id: run_id.to_string(),
                kind,
                handle,
            });
        }
        self.runs.insert(run_id.to_string(), Vec::new());
        self.in_flight.append(&mut started);
        info!(run_id, collectors, "snapshot started");
        Ok(())
    }

    /// Whether any collector thread is still executing.
    ///
    /// Finished collectors are moved into their run. Never blocks.
    pub fn is_running(&mut self) -> bool {
        let (finished, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|f| f.handle.is_finished());
        self.in_flight = pending;

        for flight in finished {
            match flight.handle.join() {
                Ok(collector) => {
                    for e in collector.errors() {
                        warn!(run_id = %flight.run_id, collector = %flight.kind, error = %e, "collector error");
                    }
                    info!(
                        run_id = %flight.run_id,
                        collector = %flight.kind,
                        bytes = collector.result().len(),
                        "collector finished"
                    );
                    self.attach(&flight.run_id, collector);
                }
                Err(_) => {
                    error!(run_id = %flight.run_id, collector = %flight.kind, "collector thread panicked");
                }
            }
        }
        !self.in_flight.is_empty()
    }

    fn in_progress(&self, run_id: &str) -> bool {
        self.in_flight.iter().any(|f| f.run_id == run_id)
    }

    fn attach(&mut self, run_id: &str, collector: Box<dyn Collector>) {
        let order: Vec<CollectorKind> = self.registry.kinds().collect();
        let position = |kind: CollectorKind| order.iter().position(|k| *k == kind);
        let run = self.runs.entry(run_id.to_string()).or_default();
        run.push(collector);
        run.sort_by_key(|c| position(c.kind()));
    }

    fn finished_run(&self, run_id: &str) -> Result<&[Box<dyn Collector>], ManagerError> {
        if self.in_progress(run_id) {
            return Err(ManagerError::RunInProgress(run_id.to_string()));
        }
        self.runs
            .get(run_id)
            .map(Vec::as_slice)
            .ok_or_else(|| ManagerError::UnknownRun(run_id.to_string()))
    }

    pub fn run_ids(&self) -> impl Iterator<Item = &str> {
        self.runs.keys().map(String::as_str)
    }

    /// Collectors of a finished run, in registry order.
    pub fn run(&self, run_id: &str) -> Option<&[Box<dyn Collector>]> {
        if self.in_progress(run_id) {
            return None;
        }
        self.runs.get(run_id).map(Vec::as_slice)
    }

    pub fn collector(&self, run_id: &str, kind: CollectorKind) -> Option<&dyn Collector> {
        find(self.run(run_id)?, kind)
    }

    /// Diffs two finished runs into the report `report_id`, replacing any
    /// report already stored under that id.
    ///
    /// Only collector kinds present in both runs are compared.
    pub fn make_diff(&mut self, run_id_a: &str, run_id_b: &str, report_id: &str) -> Result<&DiffReport, ManagerError> {
        let a = self.finished_run(run_id_a)?;
        let b = self.finished_run(run_id_b)?;
        let mut report = DiffReport::new(run_id_a, run_id_b);
        for kind in self.registry.kinds() {
            let (Some(ca), Some(cb)) = (find(a, kind), find(b, kind)) else {
                debug!(%kind, run_id_a, run_id_b, "collector missing from one run, skipped");
                continue;
            };
            kind.make_diff(run_id_a, run_id_b, Some(ca), Some(cb), &mut report)?;
        }
        info!(report_id, run_id_a, run_id_b, elements = report.len(), "diff computed");
        Ok(self.store_report(report_id, report))
    }

    fn store_report(&mut self, report_id: &str, report: DiffReport) -> &DiffReport {
        self.reports.insert(report_id.to_string(), report);
        &self.reports[report_id]
    }

    pub fn report(&self, report_id: &str) -> Option<&DiffReport> {
        self.reports.get(report_id)
    }

    pub fn report_ids(&self) -> impl Iterator<Item = &str> {
        self.reports.keys().map(String::as_str)
    }

    /// Stores a filtered copy of `report_id` under `filtered_id`.
    pub fn filter_report(
        &mut self,
        report_id: &str,
        filter: &Filter,
        filtered_id: &str,
    ) -> Result<&DiffReport, ManagerError> {
        let filtered = filter.apply(self.known_report(report_id)?);
        Ok(self.store_report(filtered_id, filtered))
    }

    fn known_report(&self, report_id: &str) -> Result<&DiffReport, ManagerError> {
        self.reports
            .get(report_id)
            .ok_or_else(|| ManagerError::UnknownReport(report_id.to_string()))
    }

    pub fn snapshot_path(&self, run_id: &str) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{run_id}.{}", self.config.snapshot_extension))
    }

    pub fn report_path(&self, report_id: &str) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{report_id}.{}", self.config.report_extension))
    }

    /// Encoded snapshot file of a finished run.
    pub fn dump(&self, run_id: &str) -> Result<Vec<u8>, ManagerError> {
        let run = self.finished_run(run_id)?;
        Ok(encode_snapshot(run.iter().map(|c| c.as_ref()))?)
    }

    /// Writes the snapshot file of a finished run.
    pub fn save(&self, run_id: &str) -> Result<PathBuf, ManagerError> {
        let bytes = self.dump(run_id)?;
        let path = self.snapshot_path(run_id);
        self.write(&path, &bytes)?;
        info!(run_id, path = %path.display(), bytes = bytes.len(), "snapshot saved");
        Ok(path)
    }

    fn write(&self, path: &Path, bytes: &[u8]) -> Result<(), ManagerError> {
        fs::create_dir_all(&self.config.data_dir).map_err(io_error(&self.config.data_dir))?;
        write_atomic(path, bytes).map_err(io_error(path))
    }

    /// Reads the snapshot file of `run_id` back into memory.
    pub fn load(&mut self, run_id: &str) -> Result<(), ManagerError> {
        if self.runs.contains_key(run_id) || self.in_progress(run_id) {
            return Err(ManagerError::RunExists(run_id.to_string()));
        }
        let path = self.snapshot_path(run_id);
        let data = fs::read(&path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                ManagerError::UnknownRun(run_id.to_string())
            } else {
                io_error(&path)(source)
            }
        })?;

        let mut collectors = Vec::new();
        for (kind, payload) in decode_blocks(&data)? {
            let mut collector = self
                .registry
                .create(kind)
                .ok_or(ManagerError::UnregisteredCollector(kind))?;
            collector.import_bin(payload)?;
            collectors.push(collector);
        }
        debug!(run_id, collectors = collectors.len(), "snapshot loaded");
        self.runs.insert(run_id.to_string(), collectors);
        Ok(())
    }

    pub fn dump_report(&self, report_id: &str) -> Result<Vec<u8>, ManagerError> {
        Ok(encode_report(self.known_report(report_id)?)?)
    }

    /// Writes the report file of `report_id`.
    pub fn export_report(&self, report_id: &str) -> Result<PathBuf, ManagerError> {
        let bytes = self.dump_report(report_id)?;
        let path = self.report_path(report_id);
        self.write(&path, &bytes)?;
        info!(report_id, path = %path.display(), bytes = bytes.len(), "report exported");
        Ok(path)
    }

    /// Reads the report file of `report_id` back into memory.
    pub fn import_report(&mut self, report_id: &str) -> Result<&DiffReport, ManagerError> {
        if self.reports.contains_key(report_id) {
            return Err(ManagerError::ReportExists(report_id.to_string()));
        }
        let path = self.report_path(report_id);
        let data = fs::read(&path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                ManagerError::UnknownReport(report_id.to_string())
            } else {
                io_error(&path)(source)
            }
        })?;
        let report = decode_report(&data)?;
        Ok(self.store_report(report_id, report))
    }

    /// Stores a finished run in the relational store.
    pub fn save_db(&self, db: &Database, run_id: &str) -> Result<(), ManagerError> {
        let run = self.finished_run(run_id)?;
        if db.has_snapshot(run_id)? {
            return Err(ManagerError::RunExists(run_id.to_string()));
        }
        let tx = db.connection().unchecked_transaction()?;
        for collector in run {
            collector.export_db(&tx, run_id)?;
            db.record_snapshot(run_id, collector.kind())?;
        }
        tx.commit()?;
        info!(run_id, collectors = run.len(), "snapshot stored in database");
        Ok(())
    }

    /// Loads a run from the relational store into memory.
    pub fn load_db(&mut self, db: &Database, run_id: &str) -> Result<(), ManagerError> {
        if self.runs.contains_key(run_id) || self.in_progress(run_id) {
            return Err(ManagerError::RunExists(run_id.to_string()));
        }
        let kinds = db.snapshot_kinds(run_id)?;
        if kinds.is_empty() {
            return Err(ManagerError::UnknownRun(run_id.to_string()));
        }
        let mut collectors = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let mut collector = self
                .registry
                .create(kind)
                .ok_or(ManagerError::UnregisteredCollector(kind))?;
            collector.import_db(db.connection(), run_id)?;
            collectors.push(collector);
        }
        for collector in collectors {
            self.attach(run_id, collector);
        }
        debug!(run_id, "snapshot loaded from database");
        Ok(())
    }

    /// Stores a report in the relational store.
    ///
    /// Report rows link to entity rows, so both runs are stored first when
    /// they are only held in memory.
    pub fn export_report_db(&self, db: &Database, report_id: &str) -> Result<(), ManagerError> {
        let report = self.known_report(report_id)?;
        if db.has_report(report_id)? {
            return Err(ManagerError::ReportExists(report_id.to_string()));
        }
        for run_id in report.run_ids() {
            if !db.has_snapshot(run_id)? {
                self.save_db(db, run_id)?;
            }
        }
        db.save_report(report_id, report)?;
        info!(report_id, "report stored in database");
        Ok(())
    }

    /// Loads a report from the relational store into memory, replacing any
    /// report held under the same id.
    pub fn import_report_db(&mut self, db: &Database, report_id: &str) -> Result<&DiffReport, ManagerError> {
        if !db.has_report(report_id)? {
            return Err(ManagerError::UnknownReport(report_id.to_string()));
        }
        let report = db.load_report(report_id)?;
        Ok(self.store_report(report_id, report))
    }
}
