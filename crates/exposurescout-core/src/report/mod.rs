//! Diff report data model.
//!
//! A [`DiffReport`] compares two snapshot runs. For every collector and
//! element type it holds either an ordered sequence of [`DiffElement`]s or the
//! explicit [`Section::NoDiff`] sentinel. A missing section means the pair was
//! never processed, which is distinct from "processed, nothing changed".

pub(crate) mod codec;
mod filter;

pub use codec::{decode_report, encode_report};
pub use filter::{Filter, FilterError, FilterLevel, FilterRule, RuleCommand};

use std::collections::BTreeMap;
use std::fmt;

use rusqlite::Connection;
use serde::Serialize;
use thiserror::Error;

use crate::codec::{CodecError, Reader};
use crate::collectible::{Collectible, ReportRow};
use crate::collector::CollectorKind;
use crate::collector::filesystem::DiffFile;
use crate::collector::identity::{Group, Sudoer, User};

/// Change status of a reported element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Status {
    Created,
    Deleted,
    Modified,
    /// Fate cannot be determined: the entry may have moved or been deleted.
    Unknown,
}

impl Status {
    pub fn code(self) -> u8 {
        match self {
            Status::Created => 0,
            Status::Deleted => 1,
            Status::Modified => 2,
            Status::Unknown => 3,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, CodecError> {
        match code {
            0 => Ok(Status::Created),
            1 => Ok(Status::Deleted),
            2 => Ok(Status::Modified),
            3 => Ok(Status::Unknown),
            tag => Err(CodecError::UnknownTag { what: "status", tag }),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Status::Created => "CREATED",
            Status::Deleted => "DELETED",
            Status::Modified => "MODIFIED",
            Status::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of collectible carried by a report section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ElementType {
    File,
    User,
    Group,
    Sudoer,
}

impl ElementType {
    pub const ALL: [ElementType; 4] = [
        ElementType::File,
        ElementType::User,
        ElementType::Group,
        ElementType::Sudoer,
    ];

    pub fn code(self) -> u8 {
        match self {
            ElementType::File => 0,
            ElementType::User => 1,
            ElementType::Group => 2,
            ElementType::Sudoer => 3,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, CodecError> {
        Self::ALL
            .into_iter()
            .find(|t| t.code() == code)
            .ok_or(CodecError::UnknownTag {
                what: "element type",
                tag: code,
            })
    }

    pub fn name(self) -> &'static str {
        match self {
            ElementType::File => "File",
            ElementType::User => "User",
            ElementType::Group => "Group",
            ElementType::Sudoer => "Sudoer",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A collectible as it appears inside a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Element {
    File(DiffFile),
    User(User),
    Group(Group),
    Sudoer(Sudoer),
}

impl Element {
    pub fn element_type(&self) -> ElementType {
        match self {
            Element::File(_) => ElementType::File,
            Element::User(_) => ElementType::User,
            Element::Group(_) => ElementType::Group,
            Element::Sudoer(_) => ElementType::Sudoer,
        }
    }

    pub fn identity_key(&self) -> u64 {
        match self {
            Element::File(e) => e.identity_key(),
            Element::User(e) => e.identity_key(),
            Element::Group(e) => e.identity_key(),
            Element::Sudoer(e) => e.identity_key(),
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        match self {
            Element::File(e) => e.encode(out),
            Element::User(e) => e.encode(out),
            Element::Group(e) => e.encode(out),
            Element::Sudoer(e) => e.encode(out),
        }
    }

    pub fn decode(element_type: ElementType, reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(match element_type {
            ElementType::File => Element::File(DiffFile::decode(reader)?),
            ElementType::User => Element::User(User::decode(reader)?),
            ElementType::Group => Element::Group(Group::decode(reader)?),
            ElementType::Sudoer => Element::Sudoer(Sudoer::decode(reader)?),
        })
    }

    pub fn export_report_db(&self, conn: &Connection, row: &ReportRow<'_>) -> rusqlite::Result<()> {
        match self {
            Element::File(e) => e.export_report_db(conn, row),
            Element::User(e) => e.export_report_db(conn, row),
            Element::Group(e) => e.export_report_db(conn, row),
            Element::Sudoer(e) => e.export_report_db(conn, row),
        }
    }

    /// Text value of a named attribute, used by filter rules.
    pub fn attribute(&self, name: &str) -> Option<String> {
        match (self, name) {
            (Element::File(f), "path") => Some(f.path.clone()),
            (Element::File(f), "inode") => Some(f.inode.to_string()),
            (Element::File(f), "uid") => Some(f.uid.to_string()),
            (Element::File(f), "gid") => Some(f.gid.to_string()),
            (Element::File(f), "mode") => Some(format!("{:o}", f.mode)),
            (Element::User(u), "uid") => Some(u.uid.to_string()),
            (Element::User(u), "name") => Some(u.name.clone()),
            (Element::Group(g), "gid") => Some(g.gid.to_string()),
            (Element::Group(g), "name") => Some(g.name.clone()),
            (Element::Sudoer(s), "uid") => Some(s.uid.to_string()),
            _ => None,
        }
    }
}

impl From<DiffFile> for Element {
    fn from(value: DiffFile) -> Self {
        Element::File(value)
    }
}

impl From<User> for Element {
    fn from(value: User) -> Self {
        Element::User(value)
    }
}

impl From<Group> for Element {
    fn from(value: Group) -> Self {
        Element::Group(value)
    }
}

impl From<Sudoer> for Element {
    fn from(value: Sudoer) -> Self {
        Element::Sudoer(value)
    }
}

/// One collectible tagged with its origin run and change status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffElement {
    pub run_id: String,
    pub element: Element,
    pub status: Status,
}

impl DiffElement {
    pub fn new(run_id: impl Into<String>, element: impl Into<Element>, status: Status) -> Self {
        Self {
            run_id: run_id.into(),
            element: element.into(),
            status,
        }
    }

    pub fn element_type(&self) -> ElementType {
        self.element.element_type()
    }
}

/// Result for one (collector, element type) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Section {
    Elements(Vec<DiffElement>),
    NoDiff,
}

impl Section {
    pub fn elements(&self) -> &[DiffElement] {
        match self {
            Section::Elements(elements) => elements,
            Section::NoDiff => &[],
        }
    }

    pub fn is_no_diff(&self) -> bool {
        matches!(self, Section::NoDiff)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReportError {
    #[error("{collector} already has a {element_type} section")]
    AlreadyExists {
        collector: CollectorKind,
        element_type: ElementType,
    },
}

/// Differences between two snapshot runs, grouped by collector and type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffReport {
    run_id_a: String,
    run_id_b: String,
    collectors: BTreeMap<CollectorKind, BTreeMap<ElementType, Section>>,
}

impl DiffReport {
    pub fn new(run_id_a: impl Into<String>, run_id_b: impl Into<String>) -> Self {
        Self {
            run_id_a: run_id_a.into(),
            run_id_b: run_id_b.into(),
            collectors: BTreeMap::new(),
        }
    }

    pub fn run_id_a(&self) -> &str {
        &self.run_id_a
    }

    pub fn run_id_b(&self) -> &str {
        &self.run_id_b
    }

    /// Ordered run id list used by element selectors.
    pub fn run_ids(&self) -> [&str; 2] {
        [&self.run_id_a, &self.run_id_b]
    }

    /// Appends `element` to its (collector, type) sequence.
    ///
    /// A pair currently marked `NoDiff` is turned into a one-element
    /// sequence, so a sequence and the sentinel never coexist.
    pub fn add_diff_element(&mut self, element: DiffElement, collector: CollectorKind) {
        let section = self
            .collectors
            .entry(collector)
            .or_default()
            .entry(element.element_type())
            .or_insert_with(|| Section::Elements(Vec::new()));
        match section {
            Section::Elements(elements) => elements.push(element),
            Section::NoDiff => *section = Section::Elements(vec![element]),
        }
    }

    /// Marks the pair as processed with no difference.
    pub fn add_no_diff_element(
        &mut self,
        collector: CollectorKind,
        element_type: ElementType,
    ) -> Result<(), ReportError> {
        let sections = self.collectors.entry(collector).or_default();
        if sections.contains_key(&element_type) {
            return Err(ReportError::AlreadyExists {
                collector,
                element_type,
            });
        }
        sections.insert(element_type, Section::NoDiff);
        Ok(())
    }

    pub fn section(&self, collector: CollectorKind, element_type: ElementType) -> Option<&Section> {
        self.collectors.get(&collector)?.get(&element_type)
    }

    /// Elements of a pair; empty for `NoDiff` and for unprocessed pairs.
    pub fn elements(&self, collector: CollectorKind, element_type: ElementType) -> &[DiffElement] {
        self.section(collector, element_type)
            .map(Section::elements)
            .unwrap_or(&[])
    }

    pub fn is_no_diff(&self, collector: CollectorKind, element_type: ElementType) -> bool {
        self.section(collector, element_type)
            .is_some_and(Section::is_no_diff)
    }

    pub fn sections(&self, collector: CollectorKind) -> Option<&BTreeMap<ElementType, Section>> {
        self.collectors.get(&collector)
    }

    pub fn collectors(&self) -> impl Iterator<Item = CollectorKind> + '_ {
        self.collectors.keys().copied()
    }

    /// Total number of elements across all sections.
    pub fn len(&self) -> usize {
        self.collectors
            .values()
            .flat_map(|sections| sections.values())
            .map(|section| section.elements().len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces a whole section. Used by importers and filters.
    pub(crate) fn insert_section(
        &mut self,
        collector: CollectorKind,
        element_type: ElementType,
        section: Section,
    ) {
        self.collectors
            .entry(collector)
            .or_default()
            .insert(element_type, section);
    }

    /// Registers a collector without any section yet.
    pub(crate) fn ensure_collector(&mut self, collector: CollectorKind) {
        self.collectors.entry(collector).or_default();
    }

    #[cfg(feature = "json")]
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sudoer(uid: u32) -> Sudoer {
        Sudoer { uid }
    }

    #[test]
    fn test_add_diff_element_creates_section() {
        let mut report = DiffReport::new("a", "b");
        report.add_diff_element(
            DiffElement::new("a", sudoer(0), Status::Deleted),
            CollectorKind::Users,
        );
        report.add_diff_element(
            DiffElement::new("b", sudoer(1000), Status::Created),
            CollectorKind::Users,
        );

        let elements = report.elements(CollectorKind::Users, ElementType::Sudoer);
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0].status, Status::Deleted);
        assert_eq!(elements[1].run_id, "b");
        assert!(report.section(CollectorKind::Users, ElementType::User).is_none());
        assert_eq!(report.len(), 2);
    }

    #[test]
    fn test_second_no_diff_is_rejected() {
        let mut report = DiffReport::new("a", "b");
        report
            .add_no_diff_element(CollectorKind::Users, ElementType::Group)
            .unwrap();
        let err = report
            .add_no_diff_element(CollectorKind::Users, ElementType::Group)
            .unwrap_err();
        assert_eq!(
            err,
            ReportError::AlreadyExists {
                collector: CollectorKind::Users,
                element_type: ElementType::Group,
            }
        );
        assert!(report.is_no_diff(CollectorKind::Users, ElementType::Group));
    }

    #[test]
    fn test_no_diff_rejected_over_elements() {
        let mut report = DiffReport::new("a", "b");
        report.add_diff_element(
            DiffElement::new("a", sudoer(0), Status::Deleted),
            CollectorKind::Users,
        );
        assert!(
            report
                .add_no_diff_element(CollectorKind::Users, ElementType::Sudoer)
                .is_err()
        );
        assert_eq!(
            report.elements(CollectorKind::Users, ElementType::Sudoer).len(),
            1
        );
    }

    #[test]
    fn test_element_replaces_no_diff() {
        let mut report = DiffReport::new("a", "b");
        report
            .add_no_diff_element(CollectorKind::Users, ElementType::Sudoer)
            .unwrap();
        report.add_diff_element(
            DiffElement::new("b", sudoer(7), Status::Created),
            CollectorKind::Users,
        );
        assert!(!report.is_no_diff(CollectorKind::Users, ElementType::Sudoer));
        assert_eq!(
            report.elements(CollectorKind::Users, ElementType::Sudoer).len(),
            1
        );
    }

    #[test]
    fn test_status_codes() {
        for status in [
            Status::Created,
            Status::Deleted,
            Status::Modified,
            Status::Unknown,
        ] {
            assert_eq!(Status::from_code(status.code()).unwrap(), status);
        }
        assert_eq!(Status::Modified.code(), 2);
        assert!(Status::from_code(4).is_err());
    }

    #[test]
    fn test_element_attributes() {
        let user = Element::User(User::new(1001, "alice", [1001, 27]));
        assert_eq!(user.attribute("name").as_deref(), Some("alice"));
        assert_eq!(user.attribute("uid").as_deref(), Some("1001"));
        assert_eq!(user.attribute("path"), None);
    }
}
