//! Relational storage of filesystem snapshots and report linkage.
//!
//! The tree is stored flat in `files`. Rows are keyed by `(run_id, root,
//! path)` where `root` is the index of the walked rule, so hard links and
//! overlapping rules keep one row per walked path. `parent` holds the
//! parent's inode; the tree is rebuilt from path parents within a root.

use std::collections::HashMap;
use std::path::Path;

use rusqlite::{Connection, Row, params};
use tracing::debug;

use crate::collectible::ReportRow;
use crate::collector::traits::EntryType;
use crate::report::{DiffElement, Status};
use crate::storage::db::{digest_from_sql, insert_report_row as insert_linkage, status_from_sql, u32_from_sql};

use super::entry::{DiffFile, EntryKind, FsEntry};

pub fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS files (
            run_id TEXT NOT NULL,
            root INTEGER NOT NULL,
            inode INTEGER NOT NULL,
            mode INTEGER NOT NULL,
            uid INTEGER NOT NULL,
            gid INTEGER NOT NULL,
            size INTEGER NOT NULL,
            path TEXT NOT NULL,
            parent INTEGER,
            metadata_hash BLOB NOT NULL,
            content_hash BLOB,
            PRIMARY KEY (run_id, root, path)
        );",
    )
}

pub fn create_report_tables(conn: &Connection) -> rusqlite::Result<()> {
    create_tables(conn)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS reports_files (
            report_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            run_id TEXT NOT NULL,
            path TEXT NOT NULL,
            status INTEGER NOT NULL,
            PRIMARY KEY (report_id, seq)
        );",
    )
}

pub(crate) fn insert_report_row(conn: &Connection, row: &ReportRow<'_>, path: &str) -> rusqlite::Result<()> {
    insert_linkage(conn, "reports_files", "path", row, path)
}

pub fn export_snapshot(conn: &Connection, run_id: &str, roots: &[FsEntry]) -> rusqlite::Result<()> {
    create_tables(conn)?;
    let mut stmt = conn.prepare(
        "INSERT INTO files
            (run_id, root, inode, mode, uid, gid, size, path, parent, metadata_hash, content_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )?;

    let mut stack: Vec<(usize, &FsEntry, Option<u64>)> = roots
        .iter()
        .enumerate()
        .rev()
        .map(|(root, entry)| (root, entry, None))
        .collect();
    let mut rows = 0usize;
    while let Some((root, entry, parent)) = stack.pop() {
        rows += stmt.execute(params![
            run_id,
            root as i64,
            entry.inode as i64,
            entry.mode,
            entry.uid,
            entry.gid,
            entry.size as i64,
            entry.path,
            parent.map(|p| p as i64),
            entry.metadata_hash.as_bytes().as_slice(),
            entry.content_hash().map(|h| h.as_bytes().to_vec()),
        ])?;
        stack.extend(entry.children().iter().rev().map(|c| (root, c, Some(entry.inode))));
    }
    debug!(run_id, rows, "filesystem snapshot stored");
    Ok(())
}

struct FileRow {
    path: String,
    mode: u32,
    inode: u64,
    uid: u32,
    gid: u32,
    size: u64,
    parent: Option<u64>,
    metadata_hash: crate::digest::Digest,
    content_hash: Option<crate::digest::Digest>,
}

impl FileRow {
    /// Reads `path, mode, inode, uid, gid, size, parent, metadata_hash,
    /// content_hash` starting at column `at`.
    fn read(row: &Row<'_>, at: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            path: row.get(at)?,
            mode: u32_from_sql(at + 1, row.get(at + 1)?)?,
            inode: row.get::<_, i64>(at + 2)? as u64,
            uid: u32_from_sql(at + 3, row.get(at + 3)?)?,
            gid: u32_from_sql(at + 4, row.get(at + 4)?)?,
            size: row.get::<_, i64>(at + 5)? as u64,
            parent: row.get::<_, Option<i64>>(at + 6)?.map(|p| p as u64),
            metadata_hash: digest_from_sql(at + 7, row.get(at + 7)?)?,
            content_hash: row
                .get::<_, Option<Vec<u8>>>(at + 8)?
                .map(|bytes| digest_from_sql(at + 8, bytes))
                .transpose()?,
        })
    }

    fn is_dir(&self) -> bool {
        EntryType::from_mode(self.mode) == EntryType::Directory
    }
}

fn missing_content_hash(path: &str) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(9, format!("content_hash of {path}"), rusqlite::types::Type::Null)
}

/// Children of each `(root, directory path)`, in walk order.
type ChildIndex<'a> = HashMap<(i64, &'a str), Vec<usize>>;

pub fn import_snapshot(conn: &Connection, run_id: &str) -> rusqlite::Result<Vec<FsEntry>> {
    create_tables(conn)?;
    let mut stmt = conn.prepare(
        "SELECT root, path, mode, inode, uid, gid, size, parent, metadata_hash, content_hash
         FROM files WHERE run_id = ?1 ORDER BY root, rowid",
    )?;
    let rows = stmt
        .query_map([run_id], |row| -> rusqlite::Result<(i64, FileRow)> {
            Ok((row.get(0)?, FileRow::read(row, 1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut children: ChildIndex<'_> = HashMap::new();
    for (i, (root, row)) in rows.iter().enumerate() {
        if row.parent.is_none() {
            continue;
        }
        if let Some(dir) = Path::new(&row.path).parent().and_then(Path::to_str) {
            children.entry((*root, dir)).or_default().push(i);
        }
    }

    rows.iter()
        .enumerate()
        .filter(|(_, (_, row))| row.parent.is_none())
        .map(|(i, _)| build(i, &rows, &children))
        .collect()
}

fn build<'a>(i: usize, rows: &'a [(i64, FileRow)], children: &ChildIndex<'a>) -> rusqlite::Result<FsEntry> {
    let (root, row) = &rows[i];
    let kind = if row.is_dir() {
        let entries = children
            .get(&(*root, row.path.as_str()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
            .iter()
            .map(|&child| build(child, rows, children))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        EntryKind::Directory { children: entries }
    } else {
        EntryKind::File {
            content_hash: row.content_hash.ok_or_else(|| missing_content_hash(&row.path))?,
        }
    };
    Ok(FsEntry {
        path: row.path.clone(),
        mode: row.mode,
        inode: row.inode,
        uid: row.uid,
        gid: row.gid,
        size: row.size,
        metadata_hash: row.metadata_hash,
        kind,
    })
}

/// Loads the file section of a report, joining linkage rows to `files`.
///
/// A path walked under several rules resolves to its lowest rule index.
pub fn load_report_section(conn: &Connection, report_id: &str) -> rusqlite::Result<Vec<DiffElement>> {
    create_report_tables(conn)?;
    let mut stmt = conn.prepare(
        "SELECT r.run_id, r.status,
                f.path, f.mode, f.inode, f.uid, f.gid, f.size, f.parent, f.metadata_hash, f.content_hash
         FROM reports_files r
         LEFT JOIN files f ON f.run_id = r.run_id AND f.path = r.path
             AND f.root = (SELECT MIN(m.root) FROM files m
                           WHERE m.run_id = r.run_id AND m.path = r.path)
         WHERE r.report_id = ?1
         ORDER BY r.seq",
    )?;
    let rows = stmt
        .query_map([report_id], |row| {
            let run_id: String = row.get(0)?;
            let status: Status = status_from_sql(1, row.get(1)?)?;
            if row.get::<_, Option<String>>(2)?.is_none() {
                return Err(rusqlite::Error::QueryReturnedNoRows);
            }
            let file = FileRow::read(row, 2)?;
            let content_hash = if file.is_dir() {
                None
            } else {
                Some(file.content_hash.ok_or_else(|| missing_content_hash(&file.path))?)
            };
            let element = DiffFile {
                path: file.path,
                mode: file.mode,
                inode: file.inode,
                uid: file.uid,
                gid: file.gid,
                size: file.size,
                metadata_hash: file.metadata_hash,
                content_hash,
            };
            Ok(DiffElement::new(run_id, element, status))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::super::entry::tests::{dir, file};
    use super::*;
    use crate::collectible::Collectible;

    fn tree() -> FsEntry {
        dir(
            "/srv",
            1,
            vec![
                dir("/srv/a", 2, vec![file("/srv/a/x", 3, "x"), file("/srv/a/y", 4, "yy")]),
                file("/srv/z", 5, "zzz"),
            ],
        )
    }

    #[test]
    fn test_snapshot_round_trip() {
        let conn = Connection::open_in_memory().unwrap();
        let roots = vec![tree(), dir("/tmp", 9, vec![])];
        export_snapshot(&conn, "r1", &roots).unwrap();
        export_snapshot(&conn, "r2", &[file("/etc/hosts", 7, "h")]).unwrap();

        assert_eq!(import_snapshot(&conn, "r1").unwrap(), roots);
        assert_eq!(import_snapshot(&conn, "r2").unwrap().len(), 1);
        assert!(import_snapshot(&conn, "missing").unwrap().is_empty());
    }

    #[test]
    fn test_hard_links_and_overlapping_rules_round_trip() {
        let shared = |path: &str| file(path, 3, "same");
        let srv = dir(
            "/srv",
            1,
            vec![dir("/srv/a", 2, vec![shared("/srv/a/x"), shared("/srv/a/y")])],
        );
        let roots = vec![srv.clone(), srv.children()[0].clone()];
        let conn = Connection::open_in_memory().unwrap();
        export_snapshot(&conn, "r1", &roots).unwrap();

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM files WHERE run_id = 'r1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 7);
        assert_eq!(import_snapshot(&conn, "r1").unwrap(), roots);
        assert!(export_snapshot(&conn, "r1", &roots).is_err());
    }

    #[test]
    fn test_report_linkage_resolves_hard_link_by_path() {
        let t = dir(
            "/srv",
            1,
            vec![file("/srv/x", 3, "same"), file("/srv/y", 3, "same")],
        );
        let conn = Connection::open_in_memory().unwrap();
        export_snapshot(&conn, "r1", std::slice::from_ref(&t)).unwrap();
        create_report_tables(&conn).unwrap();

        let second = DiffFile::from(&t.children()[1]);
        let row = ReportRow {
            report_id: "rep",
            run_id: "r1",
            seq: 0,
            status: Status::Modified,
        };
        second.export_report_db(&conn, &row).unwrap();
        assert_eq!(
            load_report_section(&conn, "rep").unwrap(),
            vec![DiffElement::new("r1", second, Status::Modified)]
        );
    }

    #[test]
    fn test_report_linkage_joins_entities() {
        let conn = Connection::open_in_memory().unwrap();
        let t = tree();
        export_snapshot(&conn, "r1", std::slice::from_ref(&t)).unwrap();
        create_report_tables(&conn).unwrap();

        let leaf = DiffFile::from(&t.children()[1]);
        let folder = DiffFile::from(&t.children()[0]);
        for (seq, (entry, status)) in [(&leaf, Status::Deleted), (&folder, Status::Unknown)]
            .into_iter()
            .enumerate()
        {
            let row = ReportRow {
                report_id: "rep",
                run_id: "r1",
                seq,
                status,
            };
            entry.export_report_db(&conn, &row).unwrap();
        }

        let loaded = load_report_section(&conn, "rep").unwrap();
        assert_eq!(
            loaded,
            vec![
                DiffElement::new("r1", leaf, Status::Deleted),
                DiffElement::new("r1", folder, Status::Unknown),
            ]
        );
    }

    #[test]
    fn test_report_row_without_entity_fails() {
        let conn = Connection::open_in_memory().unwrap();
        create_report_tables(&conn).unwrap();
        let row = ReportRow {
            report_id: "rep",
            run_id: "never-stored",
            seq: 0,
            status: Status::Created,
        };
        insert_report_row(&conn, &row, "/srv/gone").unwrap();
        assert!(load_report_section(&conn, "rep").is_err());
    }
}
