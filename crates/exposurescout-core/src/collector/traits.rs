//! Abstractions for filesystem access to enable testing and mocking.
//!
//! The `FileSystem` trait lets collectors walk the real host or an in-memory
//! [`MockFs`](super::MockFs) with the same code.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::digest::Digest;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

/// Type of a directory entry as reported by `lstat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    File,
    Directory,
    Symlink,
    /// Sockets, FIFOs and device nodes.
    Other,
}

impl EntryType {
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFDIR => EntryType::Directory,
            S_IFREG => EntryType::File,
            S_IFLNK => EntryType::Symlink,
            _ => EntryType::Other,
        }
    }
}

/// POSIX metadata of an entry, without following symlinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMetadata {
    pub mode: u32,
    pub inode: u64,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
}

impl EntryMetadata {
    pub fn entry_type(&self) -> EntryType {
        EntryType::from_mode(self.mode)
    }
}

/// Abstraction for filesystem operations.
pub trait FileSystem: Send + Sync {
    /// Reads the entire contents of a file as a string.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Lists entries in a directory.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    /// Metadata of `path` itself; symlinks are not followed.
    fn symlink_metadata(&self, path: &Path) -> io::Result<EntryMetadata>;

    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;

    /// Content digest of a regular file.
    fn hash_file(&self, path: &Path) -> io::Result<Digest>;
}

/// Real filesystem implementation that delegates to `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl RealFs {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let entries = fs::read_dir(path)?;
        let mut paths = Vec::new();
        for entry in entries {
            paths.push(entry?.path());
        }
        Ok(paths)
    }

    #[cfg(unix)]
    fn symlink_metadata(&self, path: &Path) -> io::Result<EntryMetadata> {
        use std::os::unix::fs::MetadataExt;

        let meta = fs::symlink_metadata(path)?;
        Ok(EntryMetadata {
            mode: meta.mode(),
            inode: meta.ino(),
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.size(),
        })
    }

    #[cfg(not(unix))]
    fn symlink_metadata(&self, path: &Path) -> io::Result<EntryMetadata> {
        let meta = fs::symlink_metadata(path)?;
        let file_type = meta.file_type();
        let mode = if file_type.is_dir() {
            S_IFDIR | 0o755
        } else if file_type.is_symlink() {
            S_IFLNK | 0o777
        } else {
            S_IFREG | 0o644
        };
        Ok(EntryMetadata {
            mode,
            inode: 0,
            uid: 0,
            gid: 0,
            size: meta.len(),
        })
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        fs::read_link(path)
    }

    fn hash_file(&self, path: &Path) -> io::Result<Digest> {
        let file = fs::File::open(path)?;
        Digest::of_reader(io::BufReader::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_type_from_mode() {
        assert_eq!(EntryType::from_mode(0o040755), EntryType::Directory);
        assert_eq!(EntryType::from_mode(0o100644), EntryType::File);
        assert_eq!(EntryType::from_mode(0o120777), EntryType::Symlink);
        assert_eq!(EntryType::from_mode(0o010644), EntryType::Other);
    }

    #[test]
    fn test_real_fs_metadata_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("hosts");
        fs::write(&file, b"127.0.0.1 localhost\n").unwrap();

        let fs = RealFs::new();
        let meta = fs.symlink_metadata(&file).unwrap();
        assert_eq!(meta.entry_type(), EntryType::File);
        assert_eq!(meta.size, 20);
        assert_eq!(
            fs.hash_file(&file).unwrap(),
            Digest::of(b"127.0.0.1 localhost\n")
        );

        let dir_meta = fs.symlink_metadata(dir.path()).unwrap();
        assert_eq!(dir_meta.entry_type(), EntryType::Directory);
    }

    #[test]
    fn test_real_fs_read_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), "").unwrap();
        fs::create_dir(dir.path().join("b")).unwrap();

        let fs = RealFs::new();
        let mut entries = fs.read_dir(dir.path()).unwrap();
        entries.sort();
        assert_eq!(entries, vec![dir.path().join("a"), dir.path().join("b")]);
        assert!(fs.symlink_metadata(&dir.path().join("a")).is_ok());
        assert!(fs.symlink_metadata(Path::new("/nonexistent/path/12345")).is_err());
    }
}
