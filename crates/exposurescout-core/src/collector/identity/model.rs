//! User, group and sudoer records.

use std::collections::BTreeSet;

use rusqlite::Connection;
use serde::Serialize;

use crate::codec::{CodecError, Reader, put_str, put_varint};
use crate::collectible::{Collectible, ReportRow};
use crate::digest::Digest;
use crate::report::ElementType;
use crate::storage::db::insert_report_row;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub uid: u32,
    pub name: String,
    /// Primary and supplementary group ids.
    pub groups: BTreeSet<u32>,
}

impl User {
    pub fn new(uid: u32, name: impl Into<String>, groups: impl IntoIterator<Item = u32>) -> Self {
        Self {
            uid,
            name: name.into(),
            groups: groups.into_iter().collect(),
        }
    }
}

impl Collectible for User {
    const ELEMENT_TYPE: ElementType = ElementType::User;

    fn encode(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        put_varint(out, u64::from(self.uid))?;
        put_str(out, &self.name)?;
        put_varint(out, self.groups.len() as u64)?;
        for gid in &self.groups {
            put_varint(out, u64::from(*gid))?;
        }
        Ok(())
    }

    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let uid = reader.varint_u32("uid")?;
        let name = reader.string()?;
        let count = reader.count()?;
        let mut groups = BTreeSet::new();
        for _ in 0..count {
            groups.insert(reader.varint_u32("gid")?);
        }
        Ok(Self { uid, name, groups })
    }

    fn identity_key(&self) -> u64 {
        u64::from(self.uid)
    }

    fn export_report_db(&self, conn: &Connection, row: &ReportRow<'_>) -> rusqlite::Result<()> {
        insert_report_row(conn, "reports_users", "uid", row, self.identity_key() as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Group {
    pub gid: u32,
    pub name: String,
}

impl Group {
    pub fn new(gid: u32, name: impl Into<String>) -> Self {
        Self {
            gid,
            name: name.into(),
        }
    }
}

impl Collectible for Group {
    const ELEMENT_TYPE: ElementType = ElementType::Group;

    fn encode(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        put_varint(out, u64::from(self.gid))?;
        put_str(out, &self.name)
    }

    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            gid: reader.varint_u32("gid")?,
            name: reader.string()?,
        })
    }

    fn identity_key(&self) -> u64 {
        u64::from(self.gid)
    }

    fn export_report_db(&self, conn: &Connection, row: &ReportRow<'_>) -> rusqlite::Result<()> {
        insert_report_row(conn, "reports_groups", "gid", row, self.identity_key() as i64)
    }
}

/// A user allowed to escalate privileges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Sudoer {
    pub uid: u32,
}

impl Sudoer {
    pub fn new(uid: u32) -> Self {
        Self { uid }
    }
}

impl Collectible for Sudoer {
    const ELEMENT_TYPE: ElementType = ElementType::Sudoer;

    fn encode(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        put_varint(out, u64::from(self.uid))
    }

    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            uid: reader.varint_u32("uid")?,
        })
    }

    fn identity_key(&self) -> u64 {
        u64::from(self.uid)
    }

    fn export_report_db(&self, conn: &Connection, row: &ReportRow<'_>) -> rusqlite::Result<()> {
        insert_report_row(conn, "reports_sudoers", "uid", row, self.identity_key() as i64)
    }
}

/// Everything one identity collection gathers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentitySnapshot {
    pub users: Vec<User>,
    pub groups: Vec<Group>,
    pub sudoers: Vec<Sudoer>,
    pub passwd_digest: Digest,
    pub group_digest: Digest,
}

fn encode_list<T: Collectible>(items: &[T], out: &mut Vec<u8>) -> Result<(), CodecError> {
    put_varint(out, items.len() as u64)?;
    for item in items {
        item.encode(out)?;
    }
    Ok(())
}

fn decode_list<T: Collectible>(reader: &mut Reader<'_>) -> Result<Vec<T>, CodecError> {
    let count = reader.count()?;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(T::decode(reader)?);
    }
    Ok(items)
}

impl IdentitySnapshot {
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        encode_list(&self.users, out)?;
        encode_list(&self.groups, out)?;
        encode_list(&self.sudoers, out)?;
        out.extend_from_slice(self.passwd_digest.as_bytes());
        out.extend_from_slice(self.group_digest.as_bytes());
        Ok(())
    }

    pub fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            users: decode_list(reader)?,
            groups: decode_list(reader)?,
            sudoers: decode_list(reader)?,
            passwd_digest: reader.digest()?,
            group_digest: reader.digest()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_layout() {
        let user = User::new(1001, "alice", [1001, 27]);
        let bytes = user.to_bytes().unwrap();
        // uid 1001, "alice", two groups sorted: 27, 1001
        assert_eq!(
            bytes,
            vec![0x23, 0xe9, 0x05, b'a', b'l', b'i', b'c', b'e', 0x02, 0x1b, 0x23, 0xe9]
        );
        let (decoded, rest) = User::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, user);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_group_and_sudoer_with_trailer() {
        let mut bytes = Group::new(27, "sudo").to_bytes().unwrap();
        bytes.extend(Sudoer::new(0).to_bytes().unwrap());

        let (group, rest) = Group::from_bytes(&bytes).unwrap();
        assert_eq!(group, Group::new(27, "sudo"));
        let (sudoer, rest) = Sudoer::from_bytes(rest).unwrap();
        assert_eq!(sudoer.uid, 0);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_truncated_user_fails() {
        let bytes = User::new(5, "svc", [5]).to_bytes().unwrap();
        assert!(User::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        assert!(User::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_snapshot_payload() {
        let snapshot = IdentitySnapshot {
            users: vec![User::new(0, "root", [0])],
            groups: vec![Group::new(0, "root"), Group::new(27, "sudo")],
            sudoers: vec![Sudoer::new(0)],
            passwd_digest: Digest::of(b"passwd"),
            group_digest: Digest::of(b"group"),
        };
        let mut out = Vec::new();
        snapshot.encode(&mut out).unwrap();
        assert_eq!(&out[out.len() - 32..out.len() - 16], Digest::of(b"passwd").as_bytes());

        let mut reader = Reader::new(&out);
        assert_eq!(IdentitySnapshot::decode(&mut reader).unwrap(), snapshot);
        assert!(reader.is_empty());
    }
}
