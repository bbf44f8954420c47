//! SQLite relational store.
//!
//! Holds the run and report registries. Each collector creates and fills its
//! own entity and report linkage tables through the connection exposed here.

use std::path::Path;

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, ToSql, params};
use tracing::debug;

use crate::codec::CodecError;
use crate::collectible::ReportRow;
use crate::collector::CollectorKind;
use crate::digest::Digest;
use crate::report::{DiffReport, ElementType, Section, Status};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS snapshots (
    run_id TEXT NOT NULL,
    collector_type INTEGER NOT NULL,
    PRIMARY KEY (run_id, collector_type)
);
CREATE TABLE IF NOT EXISTS reports (
    report_id TEXT PRIMARY KEY,
    run_id_a TEXT NOT NULL,
    run_id_b TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS report_sections (
    report_id TEXT NOT NULL,
    collector_type INTEGER NOT NULL,
    element_type INTEGER NOT NULL,
    no_diff INTEGER NOT NULL,
    PRIMARY KEY (report_id, collector_type, element_type)
);
";

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        let db = Database { conn };
        db.configure_pragmas()?;
        db.init_schema()?;
        Ok(db)
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.configure_pragmas()?;
        db.init_schema()?;
        Ok(db)
    }

    fn configure_pragmas(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        debug!("SQLite pragmas configured");
        Ok(())
    }

    fn init_schema(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        debug!("SQLite schema initialized");
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Collector types stored for `run_id`, in tag order.
    pub fn snapshot_kinds(&self, run_id: &str) -> rusqlite::Result<Vec<CollectorKind>> {
        let mut stmt = self.conn.prepare(
            "SELECT collector_type FROM snapshots WHERE run_id = ?1 ORDER BY collector_type",
        )?;
        let tags = stmt
            .query_map([run_id], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        tags.into_iter().map(|tag| kind_from_sql(0, tag)).collect()
    }

    pub fn has_snapshot(&self, run_id: &str) -> rusqlite::Result<bool> {
        Ok(!self.snapshot_kinds(run_id)?.is_empty())
    }

    pub fn record_snapshot(&self, run_id: &str, kind: CollectorKind) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO snapshots (run_id, collector_type) VALUES (?1, ?2)",
            params![run_id, kind.tag()],
        )?;
        Ok(())
    }

    pub fn has_report(&self, report_id: &str) -> rusqlite::Result<bool> {
        Ok(self
            .conn
            .query_row(
                "SELECT 1 FROM reports WHERE report_id = ?1",
                [report_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }

    /// Stores a report: its sections, then one linkage row per element.
    pub fn save_report(&self, report_id: &str, report: &DiffReport) -> rusqlite::Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO reports (report_id, run_id_a, run_id_b) VALUES (?1, ?2, ?3)",
            params![report_id, report.run_id_a(), report.run_id_b()],
        )?;
        for kind in report.collectors() {
            kind.create_report_tables(&tx)?;
            let Some(sections) = report.sections(kind) else {
                continue;
            };
            for (element_type, section) in sections {
                tx.execute(
                    "INSERT INTO report_sections (report_id, collector_type, element_type, no_diff)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![report_id, kind.tag(), element_type.code(), section.is_no_diff()],
                )?;
                for (seq, element) in section.elements().iter().enumerate() {
                    let row = ReportRow {
                        report_id,
                        run_id: &element.run_id,
                        seq,
                        status: element.status,
                    };
                    element.element.export_report_db(&tx, &row)?;
                }
            }
        }
        tx.commit()?;
        debug!(report_id, elements = report.len(), "report stored");
        Ok(())
    }

    /// Rebuilds a report from its sections and the entity rows they link to.
    pub fn load_report(&self, report_id: &str) -> rusqlite::Result<DiffReport> {
        let (run_id_a, run_id_b): (String, String) = self.conn.query_row(
            "SELECT run_id_a, run_id_b FROM reports WHERE report_id = ?1",
            [report_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let mut report = DiffReport::new(run_id_a, run_id_b);

        let mut stmt = self.conn.prepare(
            "SELECT collector_type, element_type, no_diff FROM report_sections
             WHERE report_id = ?1 ORDER BY collector_type, element_type",
        )?;
        let sections = stmt
            .query_map([report_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, bool>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for (tag, code, no_diff) in sections {
            let kind = kind_from_sql(0, tag)?;
            let element_type = element_type_from_sql(1, code)?;
            let section = if no_diff {
                Section::NoDiff
            } else {
                Section::Elements(kind.import_diff_from_report_db(
                    &self.conn,
                    report_id,
                    element_type,
                )?)
            };
            report.insert_section(kind, element_type, section);
        }
        Ok(report)
    }
}

fn conversion_error(column: usize, ty: Type, err: CodecError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, ty, Box::new(err))
}

fn small_code(column: usize, value: i64) -> rusqlite::Result<u8> {
    u8::try_from(value).map_err(|_| {
        conversion_error(
            column,
            Type::Integer,
            CodecError::OutOfRange {
                field: "code",
                value: value as u64,
            },
        )
    })
}

pub(crate) fn kind_from_sql(column: usize, value: i64) -> rusqlite::Result<CollectorKind> {
    CollectorKind::from_tag(small_code(column, value)?)
        .map_err(|e| conversion_error(column, Type::Integer, e))
}

pub(crate) fn element_type_from_sql(column: usize, value: i64) -> rusqlite::Result<ElementType> {
    ElementType::from_code(small_code(column, value)?)
        .map_err(|e| conversion_error(column, Type::Integer, e))
}

pub(crate) fn status_from_sql(column: usize, value: i64) -> rusqlite::Result<Status> {
    Status::from_code(small_code(column, value)?)
        .map_err(|e| conversion_error(column, Type::Integer, e))
}

pub(crate) fn digest_from_sql(column: usize, bytes: Vec<u8>) -> rusqlite::Result<Digest> {
    let raw: [u8; 16] = bytes.as_slice().try_into().map_err(|_| {
        conversion_error(
            column,
            Type::Blob,
            CodecError::Invalid(format!("digest of {} bytes", bytes.len())),
        )
    })?;
    Ok(Digest::from_bytes(raw))
}

pub(crate) fn u32_from_sql(column: usize, value: i64) -> rusqlite::Result<u32> {
    u32::try_from(value).map_err(|_| {
        conversion_error(
            column,
            Type::Integer,
            CodecError::OutOfRange {
                field: "integer",
                value: value as u64,
            },
        )
    })
}

/// Inserts one report linkage row into `table`, keyed by `key_column`.
pub(crate) fn insert_report_row(
    conn: &Connection,
    table: &str,
    key_column: &str,
    row: &ReportRow<'_>,
    key: impl ToSql,
) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO {table} (report_id, seq, run_id, {key_column}, status)
             VALUES (?1, ?2, ?3, ?4, ?5)"
        ),
        params![
            row.report_id,
            row.seq as i64,
            row.run_id,
            key,
            row.status.code()
        ],
    )?;
    Ok(())
}
