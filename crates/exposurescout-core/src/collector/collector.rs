//! Collector contract and per-type dispatch.

use std::any::Any;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde::Serialize;
use thiserror::Error;

use crate::codec::{CodecError, Reader};
use crate::report::{DiffElement, DiffReport, ElementType};

use super::filesystem::{self, FileSystemCollector};
use super::identity::{self, IdentityCollector};

/// Collector types known to the system, with their snapshot tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum CollectorKind {
    /// Users, groups and sudoers. Tag `0x00`.
    Users,
    /// Filesystem trees. Tag `0x01`.
    FileSystem,
}

impl CollectorKind {
    pub const ALL: [CollectorKind; 2] = [CollectorKind::Users, CollectorKind::FileSystem];

    pub fn tag(self) -> u8 {
        match self {
            CollectorKind::Users => 0x00,
            CollectorKind::FileSystem => 0x01,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, CodecError> {
        Self::ALL
            .into_iter()
            .find(|k| k.tag() == tag)
            .ok_or(CodecError::UnknownTag {
                what: "collector",
                tag,
            })
    }

    pub fn name(self) -> &'static str {
        match self {
            CollectorKind::Users => "Users Collector",
            CollectorKind::FileSystem => "File System Collector",
        }
    }

    /// Element types reported by this collector, in section order.
    pub fn element_types(self) -> &'static [ElementType] {
        match self {
            CollectorKind::Users => &[ElementType::User, ElementType::Group, ElementType::Sudoer],
            CollectorKind::FileSystem => &[ElementType::File],
        }
    }

    /// Adds the differences between two collector results to `report`.
    ///
    /// Either side may be absent when the collector only ran in one of the
    /// two runs; both absent is an error.
    pub fn make_diff(
        self,
        run_id_a: &str,
        run_id_b: &str,
        a: Option<&dyn Collector>,
        b: Option<&dyn Collector>,
        report: &mut DiffReport,
    ) -> Result<(), DiffError> {
        match self {
            CollectorKind::FileSystem => {
                let a = downcast::<FileSystemCollector>(self, a)?;
                let b = downcast::<FileSystemCollector>(self, b)?;
                filesystem::make_diff(run_id_a, run_id_b, a, b, report)
            }
            CollectorKind::Users => {
                let a = downcast::<IdentityCollector>(self, a)?;
                let b = downcast::<IdentityCollector>(self, b)?;
                identity::make_diff(run_id_a, run_id_b, a, b, report)
            }
        }
    }

    /// Creates the report linkage tables of this collector.
    pub fn create_report_tables(self, conn: &Connection) -> rusqlite::Result<()> {
        match self {
            CollectorKind::FileSystem => filesystem::db::create_report_tables(conn),
            CollectorKind::Users => identity::db::create_report_tables(conn),
        }
    }

    /// Decodes this collector's report sections into `report`.
    pub fn import_diff_from_report(
        self,
        reader: &mut Reader<'_>,
        run_ids: &[String],
        report: &mut DiffReport,
    ) -> Result<(), CodecError> {
        crate::report::codec::decode_sections(self, reader, run_ids, report)
    }

    /// Loads the elements of one report section from the relational store.
    pub fn import_diff_from_report_db(
        self,
        conn: &Connection,
        report_id: &str,
        element_type: ElementType,
    ) -> rusqlite::Result<Vec<DiffElement>> {
        match self {
            CollectorKind::FileSystem => filesystem::db::load_report_section(conn, report_id),
            CollectorKind::Users => identity::db::load_report_section(conn, report_id, element_type),
        }
    }
}

impl fmt::Display for CollectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn downcast<T: 'static>(
    kind: CollectorKind,
    collector: Option<&dyn Collector>,
) -> Result<Option<&T>, DiffError> {
    match collector {
        None => Ok(None),
        Some(c) => c
            .as_any()
            .downcast_ref::<T>()
            .map(Some)
            .ok_or(DiffError::UnexpectedCollector {
                expected: kind,
                found: c.kind(),
            }),
    }
}

/// Lifecycle of a collector instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectorState {
    #[default]
    Idle,
    Running,
    Finished,
}

/// Failure inside one collector worker.
///
/// Workers record these and carry on; they never abort sibling workers.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("permission denied: {}", path.display())]
    PermissionDenied { path: PathBuf },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("command {command:?} failed: {message}")]
    Command { command: String, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("worker for {0} panicked")]
    WorkerPanicked(String),

    #[error("cannot encode result: {0}")]
    Encode(#[from] CodecError),
}

impl CollectError {
    pub fn from_io(path: &Path, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::PermissionDenied {
            CollectError::PermissionDenied {
                path: path.to_path_buf(),
            }
        } else {
            CollectError::Io {
                path: path.to_path_buf(),
                source: err,
            }
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiffError {
    /// Two entries believed to be the same entity carry different inodes.
    #[error("cannot compare entries whose inodes differ ({a} != {b})")]
    IdentityMismatch { a: u64, b: u64 },

    #[error("at least one side must be provided to compute a diff")]
    NothingToCompare,

    #[error("expected a {expected} result, got {found}")]
    UnexpectedCollector {
        expected: CollectorKind,
        found: CollectorKind,
    },
}

/// A data-source module producing one result per snapshot run.
///
/// Instances start idle; [`run`](Collector::run) gathers data (fanning out
/// over internal workers) and leaves the collector finished with both its
/// in-memory result and the canonical encoding available.
pub trait Collector: Send {
    fn kind(&self) -> CollectorKind;

    fn state(&self) -> CollectorState;

    /// Gathers data. Blocks until every internal worker has completed.
    fn run(&mut self);

    /// Canonical encoding of the result (a snapshot block payload).
    fn result(&self) -> &[u8];

    /// Failures recorded by workers during the last run.
    fn errors(&self) -> &[CollectError];

    /// Restores the result of a previous run from its encoded payload.
    fn import_bin(&mut self, payload: &[u8]) -> Result<(), CodecError>;

    /// Stores the result under `run_id` in the relational store.
    fn export_db(&self, conn: &Connection, run_id: &str) -> rusqlite::Result<()>;

    /// Restores the result stored under `run_id`.
    fn import_db(&mut self, conn: &Connection, run_id: &str) -> rusqlite::Result<()>;

    fn as_any(&self) -> &dyn Any;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        assert_eq!(CollectorKind::Users.tag(), 0x00);
        assert_eq!(CollectorKind::FileSystem.tag(), 0x01);
        assert_eq!(CollectorKind::from_tag(0x01).unwrap(), CollectorKind::FileSystem);
        assert!(matches!(
            CollectorKind::from_tag(0x07),
            Err(CodecError::UnknownTag { tag: 0x07, .. })
        ));
    }

    #[test]
    fn test_permission_error_classification() {
        let err = CollectError::from_io(
            Path::new("/root"),
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(matches!(err, CollectError::PermissionDenied { .. }));

        let err = CollectError::from_io(
            Path::new("/gone"),
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert!(matches!(err, CollectError::Io { .. }));
    }

    #[test]
    fn test_mismatched_collector_is_rejected() {
        let fs = FileSystemCollector::with_fs(std::sync::Arc::new(
            crate::collector::MockFs::new(),
        ));
        let mut report = DiffReport::new("a", "b");
        let err = CollectorKind::Users
            .make_diff("a", "b", Some(&fs as &dyn Collector), None, &mut report)
            .unwrap_err();
        assert_eq!(
            err,
            DiffError::UnexpectedCollector {
                expected: CollectorKind::Users,
                found: CollectorKind::FileSystem,
            }
        );
    }
}
