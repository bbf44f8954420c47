//! Recursive `lstat` walk building an [`FsEntry`] tree.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::collector::CollectError;
use crate::collector::traits::{EntryType, FileSystem};
use crate::digest::Digest;

use super::entry::FsEntry;

/// Walks one rule path. Owns the errors of its own worker.
pub struct Walker<'a> {
    fs: &'a dyn FileSystem,
    exclusions: &'a [PathBuf],
    errors: Vec<CollectError>,
}

impl<'a> Walker<'a> {
    pub fn new(fs: &'a dyn FileSystem, exclusions: &'a [PathBuf]) -> Self {
        Self {
            fs,
            exclusions,
            errors: Vec::new(),
        }
    }

    pub fn into_errors(self) -> Vec<CollectError> {
        self.errors
    }

    fn record(&mut self, path: &Path, err: std::io::Error) {
        let err = CollectError::from_io(path, err);
        warn!(path = %path.display(), error = %err, "skipping unreadable entry");
        self.errors.push(err);
    }

    /// Builds the tree rooted at `path`.
    ///
    /// Returns `None` when the entry itself cannot be captured. Unreadable
    /// descendants are left out and recorded.
    pub fn walk(&mut self, path: &Path) -> Option<FsEntry> {
        if self.exclusions.iter().any(|ex| path.starts_with(ex)) {
            debug!(path = %path.display(), "excluded");
            return None;
        }
        let Some(path_str) = path.to_str() else {
            warn!(path = %path.display(), "skipping non UTF-8 path");
            return None;
        };
        let meta = match self.fs.symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) => {
                self.record(path, e);
                return None;
            }
        };

        match meta.entry_type() {
            EntryType::Directory => {
                let mut listing = match self.fs.read_dir(path) {
                    Ok(listing) => listing,
                    Err(e) => {
                        self.record(path, e);
                        Vec::new()
                    }
                };
                listing.sort();
                let children = listing
                    .iter()
                    .filter_map(|child| self.walk(child))
                    .collect();
                Some(FsEntry::directory(path_str, meta, children))
            }
            EntryType::File => match self.fs.hash_file(path) {
                Ok(hash) => Some(FsEntry::file(path_str, meta, hash)),
                Err(e) => {
                    self.record(path, e);
                    None
                }
            },
            EntryType::Symlink => match self.fs.read_link(path) {
                Ok(target) => {
                    let hash = Digest::of(target.to_string_lossy().as_bytes());
                    Some(FsEntry::file(path_str, meta, hash))
                }
                Err(e) => {
                    self.record(path, e);
                    None
                }
            },
            EntryType::Other => {
                debug!(path = %path.display(), mode = format_args!("{:o}", meta.mode), "skipping special file");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::MockFs;

    #[test]
    fn test_walk_typical_host() {
        let fs = MockFs::typical_host();
        let mut walker = Walker::new(&fs, &[]);
        let root = walker.walk(Path::new("/srv/app")).unwrap();

        assert!(walker.into_errors().is_empty());
        assert_eq!(root.inode, 500);
        assert_eq!(root.uid, 1001);
        let names: Vec<_> = root.children().iter().map(|c| c.path.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "/srv/app/bin",
                "/srv/app/config.toml",
                "/srv/app/current",
                "/srv/app/logs"
            ]
        );
        let link = &root.children()[2];
        assert_eq!(link.content_hash(), Some(Digest::of(b"bin/server")));
        assert_eq!(root.entry_count(), 6);
    }

    #[test]
    fn test_walk_records_denied_entries() {
        let mut fs = MockFs::new();
        fs.add_file("/srv/open.txt", "ok");
        fs.add_file("/srv/secret/key", "k");
        fs.add_file("/srv/locked.txt", "no");
        fs.deny("/srv/secret");
        fs.deny("/srv/locked.txt");

        let mut walker = Walker::new(&fs, &[]);
        let root = walker.walk(Path::new("/srv")).unwrap();
        let errors = walker.into_errors();

        assert_eq!(errors.len(), 2);
        assert!(
            errors
                .iter()
                .all(|e| matches!(e, CollectError::PermissionDenied { .. }))
        );
        let names: Vec<_> = root.children().iter().map(|c| c.path.as_str()).collect();
        // the unreadable directory is kept without children
        assert_eq!(names, vec!["/srv/open.txt", "/srv/secret"]);
        assert!(root.children()[1].children().is_empty());
    }

    #[test]
    fn test_walk_skips_special_and_excluded() {
        let mut fs = MockFs::new();
        fs.add_file("/var/run/app.pid", "42");
        fs.add_fifo("/var/run/app.fifo");
        fs.add_file("/var/cache/blob", "x");

        let exclusions = vec![PathBuf::from("/var/cache")];
        let mut walker = Walker::new(&fs, &exclusions);
        let root = walker.walk(Path::new("/var")).unwrap();
        assert_eq!(root.children().len(), 1);
        assert_eq!(root.children()[0].children().len(), 1);
        assert_eq!(root.children()[0].children()[0].path, "/var/run/app.pid");
    }

    #[test]
    fn test_walk_missing_root() {
        let fs = MockFs::new();
        let mut walker = Walker::new(&fs, &[]);
        assert!(walker.walk(Path::new("/nope")).is_none());
        assert!(matches!(
            walker.into_errors().as_slice(),
            [CollectError::Io { .. }]
        ));
    }
}
