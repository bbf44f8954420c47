//! Filesystem entry model: the recursive snapshot tree and its flat report
//! projection.

use std::path::Path;

use rusqlite::Connection;
use serde::Serialize;

use crate::codec::{CodecError, Reader, put_str, put_varint};
use crate::collectible::{Collectible, ReportRow};
use crate::collector::traits::{EntryMetadata, EntryType};
use crate::digest::Digest;
use crate::report::ElementType;

/// A file or directory captured by a tree walk.
///
/// Identity across two snapshots is the inode, not the path. Inode reuse
/// after unlink and recreate is not detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEntry {
    pub path: String,
    pub mode: u32,
    pub inode: u64,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub metadata_hash: Digest,
    pub kind: EntryKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// Any non-directory. Symlinks are hashed over their target path.
    File { content_hash: Digest },
    Directory { children: Vec<FsEntry> },
}

impl FsEntry {
    pub fn file(path: impl Into<String>, meta: EntryMetadata, content_hash: Digest) -> Self {
        let path = path.into();
        let metadata_hash =
            Digest::metadata(&path, meta.mode, meta.inode, meta.uid, meta.gid, meta.size);
        Self {
            path,
            mode: meta.mode,
            inode: meta.inode,
            uid: meta.uid,
            gid: meta.gid,
            size: meta.size,
            metadata_hash,
            kind: EntryKind::File { content_hash },
        }
    }

    /// Builds a directory from its complete child list.
    ///
    /// The size is the sum of the children's sizes, and the metadata hash is
    /// computed once from it, so it does not depend on child order.
    pub fn directory(path: impl Into<String>, meta: EntryMetadata, children: Vec<FsEntry>) -> Self {
        let path = path.into();
        let size = children
            .iter()
            .fold(0u64, |acc, child| acc.saturating_add(child.size));
        let metadata_hash = Digest::metadata(&path, meta.mode, meta.inode, meta.uid, meta.gid, size);
        Self {
            path,
            mode: meta.mode,
            inode: meta.inode,
            uid: meta.uid,
            gid: meta.gid,
            size,
            metadata_hash,
            kind: EntryKind::Directory { children },
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Directory { .. })
    }

    pub fn children(&self) -> &[FsEntry] {
        match &self.kind {
            EntryKind::Directory { children } => children,
            EntryKind::File { .. } => &[],
        }
    }

    pub fn content_hash(&self) -> Option<Digest> {
        match self.kind {
            EntryKind::File { content_hash } => Some(content_hash),
            EntryKind::Directory { .. } => None,
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        file_name(&self.path)
    }

    /// Mode, inode and owner. Size is left out: it is covered by the content
    /// hash for files and by the child list for directories.
    pub fn metadata_key(&self) -> (u32, u64, u32, u32) {
        (self.mode, self.inode, self.uid, self.gid)
    }

    /// Structural equality used to partition children during a diff.
    ///
    /// Files compare by metadata and content hash. Directories compare by
    /// metadata hash and, recursively, by their children.
    pub fn same_state(&self, other: &FsEntry) -> bool {
        if self.metadata_hash != other.metadata_hash {
            return false;
        }
        match (&self.kind, &other.kind) {
            (EntryKind::File { content_hash: a }, EntryKind::File { content_hash: b }) => a == b,
            (EntryKind::Directory { children: a }, EntryKind::Directory { children: b }) => {
                same_children(a, b)
            }
            _ => false,
        }
    }

    /// True when `path` is this entry's path or lies below it.
    pub fn is_ancestor_of(&self, path: &str) -> bool {
        Path::new(path).starts_with(&self.path)
    }

    /// Number of entries in this subtree, including itself.
    pub fn entry_count(&self) -> usize {
        1 + self.children().iter().map(FsEntry::entry_count).sum::<usize>()
    }

    /// Encodes this entry, storing only the basename when the path is
    /// `parent` joined with it.
    pub fn encode_under(&self, parent: Option<&str>, out: &mut Vec<u8>) -> Result<(), CodecError> {
        let header = Header {
            path: &self.path,
            mode: self.mode,
            inode: self.inode,
            uid: self.uid,
            gid: self.gid,
            size: self.size,
            metadata_hash: self.metadata_hash,
        };
        header.encode(stored_path(&self.path, parent), out)?;
        match &self.kind {
            EntryKind::File { content_hash } => out.extend_from_slice(content_hash.as_bytes()),
            EntryKind::Directory { children } => {
                put_varint(out, children.len() as u64)?;
                for child in children {
                    child.encode_under(Some(&self.path), out)?;
                }
            }
        }
        Ok(())
    }

    pub fn decode_under(reader: &mut Reader<'_>, parent: Option<&str>) -> Result<Self, CodecError> {
        let header = OwnedHeader::decode(reader, parent)?;
        let kind = if EntryType::from_mode(header.mode) == EntryType::Directory {
            let count = reader.count()?;
            let mut children = Vec::with_capacity(count);
            for _ in 0..count {
                children.push(FsEntry::decode_under(reader, Some(&header.path))?);
            }
            EntryKind::Directory { children }
        } else {
            EntryKind::File {
                content_hash: reader.digest()?,
            }
        };
        Ok(Self {
            path: header.path,
            mode: header.mode,
            inode: header.inode,
            uid: header.uid,
            gid: header.gid,
            size: header.size,
            metadata_hash: header.metadata_hash,
            kind,
        })
    }
}

/// Pairwise structural equality of two child lists.
pub fn same_children(a: &[FsEntry], b: &[FsEntry]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_state(y))
}

impl Collectible for FsEntry {
    const ELEMENT_TYPE: ElementType = ElementType::File;

    fn encode(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        self.encode_under(None, out)
    }

    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Self::decode_under(reader, None)
    }

    fn identity_key(&self) -> u64 {
        self.inode
    }

    fn export_report_db(&self, conn: &Connection, row: &ReportRow<'_>) -> rusqlite::Result<()> {
        DiffFile::from(self).export_report_db(conn, row)
    }
}

/// Flat projection of one entry, as carried inside reports.
///
/// Never has children and always stores its absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffFile {
    pub path: String,
    pub mode: u32,
    pub inode: u64,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub metadata_hash: Digest,
    /// `None` for directories.
    pub content_hash: Option<Digest>,
}

impl DiffFile {
    pub fn is_dir(&self) -> bool {
        EntryType::from_mode(self.mode) == EntryType::Directory
    }
}

impl From<&FsEntry> for DiffFile {
    fn from(entry: &FsEntry) -> Self {
        Self {
            path: entry.path.clone(),
            mode: entry.mode,
            inode: entry.inode,
            uid: entry.uid,
            gid: entry.gid,
            size: entry.size,
            metadata_hash: entry.metadata_hash,
            content_hash: entry.content_hash(),
        }
    }
}

impl Collectible for DiffFile {
    const ELEMENT_TYPE: ElementType = ElementType::File;

    fn encode(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        let header = Header {
            path: &self.path,
            mode: self.mode,
            inode: self.inode,
            uid: self.uid,
            gid: self.gid,
            size: self.size,
            metadata_hash: self.metadata_hash,
        };
        header.encode(&self.path, out)?;
        if !self.is_dir() {
            let content_hash = self.content_hash.ok_or_else(|| {
                CodecError::Invalid(format!("{} has no content hash", self.path))
            })?;
            out.extend_from_slice(content_hash.as_bytes());
        }
        Ok(())
    }

    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let header = OwnedHeader::decode(reader, None)?;
        let content_hash = if EntryType::from_mode(header.mode) == EntryType::Directory {
            None
        } else {
            Some(reader.digest()?)
        };
        Ok(Self {
            path: header.path,
            mode: header.mode,
            inode: header.inode,
            uid: header.uid,
            gid: header.gid,
            size: header.size,
            metadata_hash: header.metadata_hash,
            content_hash,
        })
    }

    fn identity_key(&self) -> u64 {
        self.inode
    }

    fn export_report_db(&self, conn: &Connection, row: &ReportRow<'_>) -> rusqlite::Result<()> {
        super::db::insert_report_row(conn, row, &self.path)
    }
}

fn file_name(path: &str) -> Option<&str> {
    Path::new(path).file_name().and_then(|name| name.to_str())
}

fn stored_path<'a>(path: &'a str, parent: Option<&str>) -> &'a str {
    if let Some(parent) = parent
        && let Some(name) = file_name(path)
        && Path::new(parent).join(name).to_str() == Some(path)
    {
        return name;
    }
    path
}

/// Fields shared by the tree and flat layouts.
struct Header<'a> {
    path: &'a str,
    mode: u32,
    inode: u64,
    uid: u32,
    gid: u32,
    size: u64,
    metadata_hash: Digest,
}

impl Header<'_> {
    fn encode(&self, stored_path: &str, out: &mut Vec<u8>) -> Result<(), CodecError> {
        debug_assert!(self.path.ends_with(stored_path));
        put_str(out, stored_path)?;
        put_varint(out, u64::from(self.mode))?;
        put_varint(out, self.inode)?;
        put_varint(out, u64::from(self.uid))?;
        put_varint(out, u64::from(self.gid))?;
        put_varint(out, self.size)?;
        out.extend_from_slice(self.metadata_hash.as_bytes());
        Ok(())
    }
}

struct OwnedHeader {
    path: String,
    mode: u32,
    inode: u64,
    uid: u32,
    gid: u32,
    size: u64,
    metadata_hash: Digest,
}

impl OwnedHeader {
    fn decode(reader: &mut Reader<'_>, parent: Option<&str>) -> Result<Self, CodecError> {
        let stored = reader.string()?;
        let path = match parent {
            Some(parent) => Path::new(parent)
                .join(&stored)
                .to_str()
                .map(str::to_owned)
                .ok_or(CodecError::InvalidUtf8)?,
            None => stored,
        };
        Ok(Self {
            path,
            mode: reader.varint_u32("mode")?,
            inode: reader.varint()?,
            uid: reader.varint_u32("uid")?,
            gid: reader.varint_u32("gid")?,
            size: reader.varint()?,
            metadata_hash: reader.digest()?,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::collector::traits::{S_IFDIR, S_IFREG};

    pub fn meta(mode: u32, inode: u64, size: u64) -> EntryMetadata {
        EntryMetadata {
            mode,
            inode,
            uid: 0,
            gid: 0,
            size,
        }
    }

    pub fn file(path: &str, inode: u64, content: &str) -> FsEntry {
        FsEntry::file(
            path,
            meta(S_IFREG | 0o644, inode, content.len() as u64),
            Digest::of(content.as_bytes()),
        )
    }

    pub fn dir(path: &str, inode: u64, children: Vec<FsEntry>) -> FsEntry {
        FsEntry::directory(path, meta(S_IFDIR | 0o755, inode, 4096), children)
    }

    fn sample_tree() -> FsEntry {
        dir(
            "/srv/app",
            1,
            vec![
                file("/srv/app/a.txt", 100, "alpha"),
                dir("/srv/app/sub", 2, vec![file("/srv/app/sub/b.txt", 200, "bravo!")]),
                // not a direct child path: stored in full
                file("/opt/elsewhere", 300, "x"),
            ],
        )
    }

    #[test]
    fn test_directory_size_and_hash() {
        let tree = sample_tree();
        assert_eq!(tree.size, 5 + 6 + 1);
        assert_eq!(
            tree.metadata_hash,
            Digest::metadata("/srv/app", S_IFDIR | 0o755, 1, 0, 0, 12)
        );
    }

    #[test]
    fn test_directory_hash_independent_of_child_order() {
        let children = vec![
            file("/d/a", 10, "a"),
            file("/d/b", 11, "bb"),
            file("/d/c", 12, "ccc"),
        ];
        let mut reversed = children.clone();
        reversed.reverse();

        let forward = dir("/d", 1, children);
        let backward = dir("/d", 1, reversed);
        assert_eq!(forward.metadata_hash, backward.metadata_hash);
        assert_eq!(forward.size, backward.size);
    }

    #[test]
    fn test_tree_round_trip_with_trailer() {
        let tree = sample_tree();
        let mut bytes = tree.to_bytes().unwrap();
        bytes.extend_from_slice(b"rest");

        let (decoded, rest) = FsEntry::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, tree);
        assert_eq!(rest, b"rest");
    }

    #[test]
    fn test_children_store_basenames() {
        let tree = dir("/srv", 1, vec![file("/srv/hosts", 2, "x")]);
        let bytes = tree.to_bytes().unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("hosts"));
        assert!(!text.contains("/srv/hosts"));
    }

    #[test]
    fn test_root_directory_path_is_kept() {
        let tree = dir("/", 2, vec![dir("/etc", 3, vec![file("/etc/motd", 4, "hi")])]);
        let bytes = tree.to_bytes().unwrap();
        let (decoded, rest) = FsEntry::from_bytes(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded.children()[0].children()[0].path, "/etc/motd");
    }

    #[test]
    fn test_truncated_tree_fails() {
        let bytes = sample_tree().to_bytes().unwrap();
        for cut in [1, 10, bytes.len() / 2, bytes.len() - 1] {
            assert!(FsEntry::from_bytes(&bytes[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn test_diff_file_never_recurses() {
        let tree = sample_tree();
        let flat = DiffFile::from(&tree);
        assert!(flat.is_dir());
        assert_eq!(flat.content_hash, None);

        let bytes = flat.to_bytes().unwrap();
        let (decoded, rest) = DiffFile::from_bytes(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, flat);

        let leaf = DiffFile::from(&tree.children()[0]);
        let (decoded, _) = DiffFile::from_bytes(&leaf.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.path, "/srv/app/a.txt");
        assert_eq!(decoded.content_hash, Some(Digest::of(b"alpha")));
    }

    #[test]
    fn test_same_state_sees_deep_changes() {
        let a = dir("/d", 1, vec![dir("/d/s", 2, vec![file("/d/s/f", 3, "one")])]);
        let b = dir("/d", 1, vec![dir("/d/s", 2, vec![file("/d/s/f", 3, "two")])]);
        // same sizes, so the directory metadata hashes match
        assert_eq!(a.metadata_hash, b.metadata_hash);
        assert!(!a.same_state(&b));
        assert!(a.same_state(&a.clone()));
    }

    #[test]
    fn test_is_ancestor_of() {
        let d = dir("/srv/app", 1, vec![]);
        assert!(d.is_ancestor_of("/srv/app"));
        assert!(d.is_ancestor_of("/srv/app/bin/server"));
        assert!(!d.is_ancestor_of("/srv/application"));
    }
}
