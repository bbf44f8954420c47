//! Recursive tree diff between two filesystem snapshots.
//!
//! Two partitions are used and kept apart:
//! - structural equality ([`FsEntry::same_state`]) splits a child list into
//!   entries that are unchanged and entries unique to one side;
//! - identity (inode) pairs a unique `a` entry with a unique `b` entry.
//!
//! An `a` entry with no inode partner may still be related to a `b` entry by
//! path: when one is the path ancestor of the other, the ancestor's subtree is
//! searched breadth-first for the missing inode. Nodes visited before the
//! match are reported `Unknown` because their fate cannot be determined.

use std::collections::VecDeque;

use tracing::debug;

use crate::collector::{CollectorKind, DiffError};
use crate::report::{DiffElement, DiffReport, ElementType, Status};

use super::FileSystemCollector;
use super::entry::{DiffFile, FsEntry, same_children};

/// Adds the differences between two filesystem collector results.
pub fn make_diff(
    run_id_a: &str,
    run_id_b: &str,
    a: Option<&FileSystemCollector>,
    b: Option<&FileSystemCollector>,
    report: &mut DiffReport,
) -> Result<(), DiffError> {
    let mut diff = TreeDiff::new(run_id_a, run_id_b, report);
    match (a, b) {
        (Some(a), None) => {
            for root in a.roots() {
                diff.entry(Some(root), None)?;
            }
        }
        (None, Some(b)) => {
            for root in b.roots() {
                diff.entry(None, Some(root))?;
            }
        }
        (Some(a), Some(b)) => {
            if !diff.children(a.roots(), b.roots())?
                && let Err(e) = report.add_no_diff_element(CollectorKind::FileSystem, ElementType::File)
            {
                debug!(error = %e, "no-diff marker already present");
            }
        }
        (None, None) => return Err(DiffError::NothingToCompare),
    }
    Ok(())
}

/// Diff state for one pair of runs.
pub struct TreeDiff<'r> {
    run_id_a: &'r str,
    run_id_b: &'r str,
    report: &'r mut DiffReport,
}

impl<'r> TreeDiff<'r> {
    pub fn new(run_id_a: &'r str, run_id_b: &'r str, report: &'r mut DiffReport) -> Self {
        Self {
            run_id_a,
            run_id_b,
            report,
        }
    }

    fn emit(&mut self, run_id: &str, entry: &FsEntry, status: Status) {
        self.report.add_diff_element(
            DiffElement::new(run_id, DiffFile::from(entry), status),
            CollectorKind::FileSystem,
        );
    }

    fn modified_pair(&mut self, a: &FsEntry, b: &FsEntry) {
        self.emit(self.run_id_a, a, Status::Modified);
        self.emit(self.run_id_b, b, Status::Modified);
    }

    /// Compares two nodes of the same conceptual slot.
    ///
    /// When both are present they must carry the same inode.
    pub fn entry(&mut self, a: Option<&FsEntry>, b: Option<&FsEntry>) -> Result<(), DiffError> {
        match (a, b) {
            (Some(a), None) => {
                self.deleted(a);
                Ok(())
            }
            (None, Some(b)) => {
                self.created(b);
                Ok(())
            }
            (Some(a), Some(b)) => self.both(a, b),
            (None, None) => Err(DiffError::NothingToCompare),
        }
    }

    fn deleted(&mut self, a: &FsEntry) {
        self.emit(self.run_id_a, a, Status::Deleted);
        for child in a.children() {
            self.deleted(child);
        }
    }

    fn created(&mut self, b: &FsEntry) {
        self.emit(self.run_id_b, b, Status::Created);
        for child in b.children() {
            self.created(child);
        }
    }

    fn both(&mut self, a: &FsEntry, b: &FsEntry) -> Result<(), DiffError> {
        if a.inode != b.inode {
            return Err(DiffError::IdentityMismatch {
                a: a.inode,
                b: b.inode,
            });
        }
        match (a.is_dir(), b.is_dir()) {
            (true, true) => {
                self.children(a.children(), b.children())?;
            }
            (true, false) => {
                self.modified_pair(a, b);
                for child in a.children() {
                    self.deleted(child);
                }
            }
            (false, true) => {
                self.modified_pair(a, b);
                for child in b.children() {
                    self.created(child);
                }
            }
            (false, false) => self.modified_pair(a, b),
        }
        Ok(())
    }

    /// Handles a pair that shares an inode but is not structurally equal.
    fn matched(&mut self, a: &FsEntry, b: &FsEntry) -> Result<(), DiffError> {
        if !(a.is_dir() && b.is_dir()) {
            return self.both(a, b);
        }
        if a.metadata_key() == b.metadata_key() && a.file_name() == b.file_name() {
            // the directory record is unchanged, something inside it is not
            self.children(a.children(), b.children())?;
        } else if same_children(a.children(), b.children()) {
            self.modified_pair(a, b);
        } else {
            self.modified_pair(a, b);
            self.children(a.children(), b.children())?;
        }
        Ok(())
    }

    /// Diffs two child lists. Returns `false` when they are structurally equal.
    pub fn children(&mut self, a: &[FsEntry], b: &[FsEntry]) -> Result<bool, DiffError> {
        let unique_a: Vec<&FsEntry> = a
            .iter()
            .filter(|x| !b.iter().any(|y| x.same_state(y)))
            .collect();
        let mut unique_b: Vec<&FsEntry> = b
            .iter()
            .filter(|y| !a.iter().any(|x| x.same_state(y)))
            .collect();
        let changed = !unique_a.is_empty() || !unique_b.is_empty();

        for a_child in unique_a {
            if let Some(i) = unique_b.iter().position(|c| c.inode == a_child.inode) {
                let b_child = unique_b.remove(i);
                self.matched(a_child, b_child)?;
                continue;
            }

            // a_child is the ancestor of a b candidate
            let hit = unique_b.iter().copied().enumerate().find_map(|(i, candidate)| {
                if !a_child.is_dir() || !a_child.is_ancestor_of(&candidate.path) {
                    return None;
                }
                find_moved(a_child, candidate.inode).map(|found| (i, found))
            });
            if let Some((i, (found, visited))) = hit {
                let b_child = unique_b.remove(i);
                self.unknown(self.run_id_a, &visited);
                self.matched(found, b_child)?;
                continue;
            }

            // a b candidate is the ancestor of a_child
            let hit = unique_b.iter().copied().enumerate().find_map(|(i, candidate)| {
                if !candidate.is_dir() || !candidate.is_ancestor_of(&a_child.path) {
                    return None;
                }
                find_moved(candidate, a_child.inode).map(|found| (i, found))
            });
            if let Some((i, (found, visited))) = hit {
                unique_b.remove(i);
                self.unknown(self.run_id_b, &visited);
                self.matched(a_child, found)?;
                continue;
            }

            self.deleted(a_child);
        }

        for b_child in unique_b {
            self.created(b_child);
        }
        Ok(changed)
    }

    fn unknown(&mut self, run_id: &str, visited: &[&FsEntry]) {
        for entry in visited {
            self.emit(run_id, entry, Status::Unknown);
        }
    }
}

/// Breadth-first search of `ancestor`'s subtree for `inode`.
///
/// Returns the matching node and every node dequeued before it, the ancestor
/// included.
fn find_moved(ancestor: &FsEntry, inode: u64) -> Option<(&FsEntry, Vec<&FsEntry>)> {
    let mut visited = Vec::new();
    let mut queue = VecDeque::from([ancestor]);
    while let Some(node) = queue.pop_front() {
        if node.inode == inode {
            return Some((node, visited));
        }
        visited.push(node);
        queue.extend(node.children());
    }
    None
}
