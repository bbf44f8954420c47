//! In-memory mock filesystem with POSIX metadata.
//!
//! Every entry carries an inode, mode and owner so that tree walks and inode
//! correlation can be exercised without a real disk. Paths can be marked as
//! denied to simulate permission failures.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use crate::collector::traits::{EntryMetadata, FileSystem, S_IFDIR, S_IFLNK, S_IFREG};
use crate::digest::Digest;

const FIRST_AUTO_INODE: u64 = 10_000;

#[derive(Debug, Clone)]
enum Node {
    File(Vec<u8>),
    Dir,
    Symlink(PathBuf),
}

#[derive(Debug, Clone)]
struct MockEntry {
    node: Node,
    meta: EntryMetadata,
}

/// In-memory filesystem for testing.
#[derive(Debug, Clone)]
pub struct MockFs {
    entries: BTreeMap<PathBuf, MockEntry>,
    denied: HashSet<PathBuf>,
    next_inode: u64,
}

impl Default for MockFs {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            denied: HashSet::new(),
            next_inode: FIRST_AUTO_INODE,
        }
    }
}

impl MockFs {
    /// Creates a new empty mock filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_inode(&mut self) -> u64 {
        let inode = self.next_inode;
        self.next_inode += 1;
        inode
    }

    fn ensure_parents(&mut self, path: &Path) {
        let mut parents: Vec<PathBuf> = path
            .ancestors()
            .skip(1)
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .collect();
        parents.reverse();
        for parent in parents {
            if !self.entries.contains_key(&parent) {
                let inode = self.alloc_inode();
                self.insert(parent, Node::Dir, S_IFDIR | 0o755, inode);
            }
        }
    }

    fn insert(&mut self, path: PathBuf, node: Node, mode: u32, inode: u64) {
        let size = match &node {
            Node::File(content) => content.len() as u64,
            Node::Dir => 4096,
            Node::Symlink(target) => target.as_os_str().len() as u64,
        };
        let meta = EntryMetadata {
            mode,
            inode,
            uid: 0,
            gid: 0,
            size,
        };
        self.entries.insert(path, MockEntry { node, meta });
    }

    /// Adds a regular file with an automatically assigned inode.
    ///
    /// Parent directories are automatically created.
    pub fn add_file(&mut self, path: impl AsRef<Path>, content: impl AsRef<[u8]>) -> u64 {
        let inode = self.alloc_inode();
        self.add_file_with_inode(path, content, inode);
        inode
    }

    pub fn add_file_with_inode(
        &mut self,
        path: impl AsRef<Path>,
        content: impl AsRef<[u8]>,
        inode: u64,
    ) {
        let path = path.as_ref();
        self.ensure_parents(path);
        self.insert(
            path.to_path_buf(),
            Node::File(content.as_ref().to_vec()),
            S_IFREG | 0o644,
            inode,
        );
    }

    /// Adds an empty directory.
    pub fn add_dir(&mut self, path: impl AsRef<Path>) -> u64 {
        let inode = self.alloc_inode();
        self.add_dir_with_inode(path, inode);
        inode
    }

    pub fn add_dir_with_inode(&mut self, path: impl AsRef<Path>, inode: u64) {
        let path = path.as_ref();
        self.ensure_parents(path);
        self.insert(path.to_path_buf(), Node::Dir, S_IFDIR | 0o755, inode);
    }

    pub fn add_symlink(&mut self, path: impl AsRef<Path>, target: impl AsRef<Path>) -> u64 {
        let path = path.as_ref();
        let inode = self.alloc_inode();
        self.ensure_parents(path);
        self.insert(
            path.to_path_buf(),
            Node::Symlink(target.as_ref().to_path_buf()),
            S_IFLNK | 0o777,
            inode,
        );
        inode
    }

    /// Adds a FIFO, which tree walks are expected to skip.
    pub fn add_fifo(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let inode = self.alloc_inode();
        self.ensure_parents(path);
        self.insert(path.to_path_buf(), Node::File(Vec::new()), 0o010644, inode);
    }

    /// Replaces the content of an existing file, keeping its inode.
    pub fn write(&mut self, path: impl AsRef<Path>, content: impl AsRef<[u8]>) {
        if let Some(entry) = self.entries.get_mut(path.as_ref()) {
            entry.meta.size = content.as_ref().len() as u64;
            entry.node = Node::File(content.as_ref().to_vec());
        }
    }

    pub fn chown(&mut self, path: impl AsRef<Path>, uid: u32, gid: u32) {
        if let Some(entry) = self.entries.get_mut(path.as_ref()) {
            entry.meta.uid = uid;
            entry.meta.gid = gid;
        }
    }

    /// Sets permission bits, keeping the file type bits.
    pub fn chmod(&mut self, path: impl AsRef<Path>, perm: u32) {
        if let Some(entry) = self.entries.get_mut(path.as_ref()) {
            entry.meta.mode = (entry.meta.mode & !0o7777) | (perm & 0o7777);
        }
    }

    /// Makes reads and listings of `path` fail with `PermissionDenied`.
    pub fn deny(&mut self, path: impl AsRef<Path>) {
        self.denied.insert(path.as_ref().to_path_buf());
    }

    /// Removes an entry and everything below it.
    pub fn remove(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        self.entries.retain(|p, _| !p.starts_with(path));
    }

    /// Moves an entry and its subtree, keeping inodes.
    pub fn rename(&mut self, from: impl AsRef<Path>, to: impl AsRef<Path>) {
        let (from, to) = (from.as_ref(), to.as_ref());
        let moved: Vec<(PathBuf, MockEntry)> = self
            .entries
            .iter()
            .filter(|(p, _)| p.starts_with(from))
            .map(|(p, e)| (p.clone(), e.clone()))
            .collect();
        self.remove(from);
        self.ensure_parents(to);
        for (path, entry) in moved {
            let Ok(rest) = path.strip_prefix(from) else {
                continue;
            };
            let target = if rest.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(rest)
            };
            self.entries.insert(target, entry);
        }
    }

    fn check_access(&self, path: &Path) -> io::Result<()> {
        if self.denied.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("permission denied: {:?}", path),
            ));
        }
        Ok(())
    }

    fn lookup(&self, path: &Path) -> io::Result<&MockEntry> {
        self.entries.get(path).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("not found: {:?}", path))
        })
    }

    fn file_content(&self, path: &Path) -> io::Result<&[u8]> {
        self.check_access(path)?;
        match &self.lookup(path)?.node {
            Node::File(content) => Ok(content),
            _ => Err(io::Error::other(format!("not a regular file: {:?}", path))),
        }
    }
}

impl FileSystem for MockFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        let content = self.file_content(path)?;
        String::from_utf8(content.to_vec())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        self.check_access(path)?;
        if !matches!(self.lookup(path)?.node, Node::Dir) {
            return Err(io::Error::other(format!("not a directory: {:?}", path)));
        }
        Ok(self
            .entries
            .keys()
            .filter(|p| p.parent() == Some(path))
            .cloned()
            .collect())
    }

    fn symlink_metadata(&self, path: &Path) -> io::Result<EntryMetadata> {
        Ok(self.lookup(path)?.meta)
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        match &self.lookup(path)?.node {
            Node::Symlink(target) => Ok(target.clone()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a symlink: {:?}", path),
            )),
        }
    }

    fn hash_file(&self, path: &Path) -> io::Result<Digest> {
        Ok(Digest::of(self.file_content(path)?))
    }
}
