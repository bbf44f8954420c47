//! Relational storage of identity snapshots and report linkage.
//!
//! Categories are keyed by `(run_id, uid)` or `(run_id, gid)`; an account
//! database listing the same id twice keeps only the first record.

use std::collections::BTreeSet;

use rusqlite::types::Value;
use rusqlite::{Connection, params};
use tracing::debug;

use crate::codec::CodecError;
use crate::report::{DiffElement, Element, ElementType, Status};
use crate::storage::db::{digest_from_sql, status_from_sql, u32_from_sql};

use super::model::{Group, IdentitySnapshot, Sudoer, User};

pub fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS user_collector (
            run_id TEXT PRIMARY KEY,
            passwd_digest BLOB NOT NULL,
            group_digest BLOB NOT NULL
        );
        CREATE TABLE IF NOT EXISTS users (
            run_id TEXT NOT NULL,
            uid INTEGER NOT NULL,
            name TEXT NOT NULL,
            PRIMARY KEY (run_id, uid)
        );
        CREATE TABLE IF NOT EXISTS \"groups\" (
            run_id TEXT NOT NULL,
            gid INTEGER NOT NULL,
            name TEXT NOT NULL,
            PRIMARY KEY (run_id, gid)
        );
        CREATE TABLE IF NOT EXISTS groups_list (
            run_id TEXT NOT NULL,
            uid INTEGER NOT NULL,
            gid INTEGER NOT NULL,
            PRIMARY KEY (run_id, uid, gid)
        );
        CREATE TABLE IF NOT EXISTS sudoers (
            run_id TEXT NOT NULL,
            uid INTEGER NOT NULL,
            PRIMARY KEY (run_id, uid)
        );",
    )
}

pub fn create_report_tables(conn: &Connection) -> rusqlite::Result<()> {
    create_tables(conn)?;
    for (table, key) in [
        ("reports_users", "uid"),
        ("reports_groups", "gid"),
        ("reports_sudoers", "uid"),
    ] {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                report_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                run_id TEXT NOT NULL,
                {key} INTEGER NOT NULL,
                status INTEGER NOT NULL,
                PRIMARY KEY (report_id, seq)
            );"
        ))?;
    }
    Ok(())
}

pub fn export_snapshot(conn: &Connection, run_id: &str, snapshot: &IdentitySnapshot) -> rusqlite::Result<()> {
    create_tables(conn)?;
    conn.execute(
        "INSERT INTO user_collector (run_id, passwd_digest, group_digest) VALUES (?1, ?2, ?3)",
        params![
            run_id,
            snapshot.passwd_digest.as_bytes().as_slice(),
            snapshot.group_digest.as_bytes().as_slice()
        ],
    )?;

    let mut user_stmt = conn.prepare("INSERT OR IGNORE INTO users (run_id, uid, name) VALUES (?1, ?2, ?3)")?;
    let mut member_stmt =
        conn.prepare("INSERT OR IGNORE INTO groups_list (run_id, uid, gid) VALUES (?1, ?2, ?3)")?;
    for user in &snapshot.users {
        if user_stmt.execute(params![run_id, user.uid, user.name])? == 0 {
            continue;
        }
        for gid in &user.groups {
            member_stmt.execute(params![run_id, user.uid, gid])?;
        }
    }

    let mut group_stmt =
        conn.prepare("INSERT OR IGNORE INTO \"groups\" (run_id, gid, name) VALUES (?1, ?2, ?3)")?;
    for group in &snapshot.groups {
        group_stmt.execute(params![run_id, group.gid, group.name])?;
    }

    let mut sudoer_stmt = conn.prepare("INSERT OR IGNORE INTO sudoers (run_id, uid) VALUES (?1, ?2)")?;
    for sudoer in &snapshot.sudoers {
        sudoer_stmt.execute(params![run_id, sudoer.uid])?;
    }

    debug!(
        run_id,
        users = snapshot.users.len(),
        groups = snapshot.groups.len(),
        sudoers = snapshot.sudoers.len(),
        "identity snapshot stored"
    );
    Ok(())
}

fn user_groups(conn: &Connection, run_id: &str, uid: u32) -> rusqlite::Result<BTreeSet<u32>> {
    let mut stmt = conn.prepare_cached("SELECT gid FROM groups_list WHERE run_id = ?1 AND uid = ?2")?;
    let groups = stmt
        .query_map(params![run_id, uid], |row| u32_from_sql(0, row.get(0)?))?
        .collect::<rusqlite::Result<BTreeSet<_>>>()?;
    Ok(groups)
}

pub fn import_snapshot(conn: &Connection, run_id: &str) -> rusqlite::Result<IdentitySnapshot> {
    create_tables(conn)?;
    let (passwd_digest, group_digest) = conn.query_row(
        "SELECT passwd_digest, group_digest FROM user_collector WHERE run_id = ?1",
        [run_id],
        |row| Ok((digest_from_sql(0, row.get(0)?)?, digest_from_sql(1, row.get(1)?)?)),
    )?;

    let mut stmt = conn.prepare("SELECT uid, name FROM users WHERE run_id = ?1 ORDER BY rowid")?;
    let users = stmt
        .query_map([run_id], |row| Ok((u32_from_sql(0, row.get(0)?)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?
        .into_iter()
        .map(|(uid, name)| -> rusqlite::Result<User> {
            Ok(User::new(uid, name, user_groups(conn, run_id, uid)?))
        })
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn.prepare("SELECT gid, name FROM \"groups\" WHERE run_id = ?1 ORDER BY rowid")?;
    let groups = stmt
        .query_map([run_id], |row| Ok(Group::new(u32_from_sql(0, row.get(0)?)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn.prepare("SELECT uid FROM sudoers WHERE run_id = ?1 ORDER BY rowid")?;
    let sudoers = stmt
        .query_map([run_id], |row| Ok(Sudoer::new(u32_from_sql(0, row.get(0)?)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(IdentitySnapshot {
        users,
        groups,
        sudoers,
        passwd_digest,
        group_digest,
    })
}

/// Loads one identity section of a report, joining linkage rows to the
/// category tables.
pub fn load_report_section(
    conn: &Connection,
    report_id: &str,
    element_type: ElementType,
) -> rusqlite::Result<Vec<DiffElement>> {
    create_report_tables(conn)?;
    let query = match element_type {
        ElementType::User => {
            "SELECT r.run_id, r.status, r.uid, e.name FROM reports_users r
             LEFT JOIN users e ON e.run_id = r.run_id AND e.uid = r.uid
             WHERE r.report_id = ?1 ORDER BY r.seq"
        }
        ElementType::Group => {
            "SELECT r.run_id, r.status, r.gid, e.name FROM reports_groups r
             LEFT JOIN \"groups\" e ON e.run_id = r.run_id AND e.gid = r.gid
             WHERE r.report_id = ?1 ORDER BY r.seq"
        }
        ElementType::Sudoer => {
            "SELECT r.run_id, r.status, r.uid, e.uid FROM reports_sudoers r
             LEFT JOIN sudoers e ON e.run_id = r.run_id AND e.uid = r.uid
             WHERE r.report_id = ?1 ORDER BY r.seq"
        }
        ElementType::File => {
            return Err(rusqlite::Error::ToSqlConversionFailure(Box::new(CodecError::Invalid(
                "file sections are not identity sections".into(),
            ))));
        }
    };

    let mut stmt = conn.prepare(query)?;
    let rows = stmt
        .query_map([report_id], |row| {
            let run_id: String = row.get(0)?;
            let status: Status = status_from_sql(1, row.get(1)?)?;
            let key = u32_from_sql(2, row.get(2)?)?;
            // NULL when the linked entity was never stored.
            let name = match row.get::<_, Value>(3)? {
                Value::Null => return Err(rusqlite::Error::QueryReturnedNoRows),
                Value::Text(name) => name,
                _ => String::new(),
            };
            Ok((run_id, status, key, name))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(run_id, status, key, name)| -> rusqlite::Result<DiffElement> {
            let element: Element = match element_type {
                ElementType::User => User::new(key, name, user_groups(conn, &run_id, key)?).into(),
                ElementType::Group => Group::new(key, name).into(),
                _ => Sudoer::new(key).into(),
            };
            Ok(DiffElement::new(run_id, element, status))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectible::{Collectible, ReportRow};
    use crate::digest::Digest;

    fn snapshot() -> IdentitySnapshot {
        IdentitySnapshot {
            users: vec![
                User::new(1001, "alice", [1001, 27]),
                User::new(0, "root", [0]),
            ],
            groups: vec![Group::new(27, "sudo"), Group::new(0, "root")],
            sudoers: vec![Sudoer::new(1001), Sudoer::new(0)],
            passwd_digest: Digest::of(b"p"),
            group_digest: Digest::of(b"g"),
        }
    }

    #[test]
    fn test_snapshot_round_trip() {
        let conn = Connection::open_in_memory().unwrap();
        export_snapshot(&conn, "r1", &snapshot()).unwrap();
        export_snapshot(&conn, "r2", &IdentitySnapshot::default()).unwrap();

        assert_eq!(import_snapshot(&conn, "r1").unwrap(), snapshot());
        assert_eq!(import_snapshot(&conn, "r2").unwrap(), IdentitySnapshot::default());
        assert!(matches!(
            import_snapshot(&conn, "missing"),
            Err(rusqlite::Error::QueryReturnedNoRows)
        ));
    }

    #[test]
    fn test_duplicate_run_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        export_snapshot(&conn, "r1", &snapshot()).unwrap();
        assert!(export_snapshot(&conn, "r1", &snapshot()).is_err());
    }

    #[test]
    fn test_report_linkage_per_category() {
        let conn = Connection::open_in_memory().unwrap();
        export_snapshot(&conn, "r1", &snapshot()).unwrap();
        create_report_tables(&conn).unwrap();

        let s = snapshot();
        let row = |seq, status| ReportRow {
            report_id: "rep",
            run_id: "r1",
            seq,
            status,
        };
        s.users[0].export_report_db(&conn, &row(0, Status::Modified)).unwrap();
        s.groups[0].export_report_db(&conn, &row(0, Status::Deleted)).unwrap();
        s.sudoers[1].export_report_db(&conn, &row(0, Status::Created)).unwrap();
        s.sudoers[0].export_report_db(&conn, &row(1, Status::Created)).unwrap();

        assert_eq!(
            load_report_section(&conn, "rep", ElementType::User).unwrap(),
            vec![DiffElement::new("r1", s.users[0].clone(), Status::Modified)]
        );
        assert_eq!(
            load_report_section(&conn, "rep", ElementType::Group).unwrap(),
            vec![DiffElement::new("r1", s.groups[0].clone(), Status::Deleted)]
        );
        assert_eq!(
            load_report_section(&conn, "rep", ElementType::Sudoer).unwrap(),
            vec![
                DiffElement::new("r1", Sudoer::new(0), Status::Created),
                DiffElement::new("r1", Sudoer::new(1001), Status::Created),
            ]
        );
        assert!(load_report_section(&conn, "rep", ElementType::File).is_err());
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
        User::new(5, "ghost", [5]).export_report_db(&conn, &row).unwrap();
        assert!(load_report_section(&conn, "rep", ElementType::User).is_err());
    }
}
