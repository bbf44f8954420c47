//! Flat diff of identity categories keyed by uid or gid.

use tracing::debug;

use crate::collectible::Collectible;
use crate::collector::{CollectorKind, DiffError};
use crate::report::{DiffElement, DiffReport, Element, ElementType, Status};

use super::IdentityCollector;
use super::model::IdentitySnapshot;

/// Adds the differences between two identity collector results.
pub fn make_diff(
    run_id_a: &str,
    run_id_b: &str,
    a: Option<&IdentityCollector>,
    b: Option<&IdentityCollector>,
    report: &mut DiffReport,
) -> Result<(), DiffError> {
    match (a, b) {
        (Some(a), None) => one_side(run_id_a, a.snapshot(), Status::Deleted, report),
        (None, Some(b)) => one_side(run_id_b, b.snapshot(), Status::Created, report),
        (Some(a), Some(b)) => {
            let (a, b) = (a.snapshot(), b.snapshot());
            category(run_id_a, run_id_b, &a.users, &b.users, report);
            category(run_id_a, run_id_b, &a.groups, &b.groups, report);
            category(run_id_a, run_id_b, &a.sudoers, &b.sudoers, report);
        }
        (None, None) => return Err(DiffError::NothingToCompare),
    }
    Ok(())
}

fn no_diff(report: &mut DiffReport, element_type: ElementType) {
    if let Err(e) = report.add_no_diff_element(CollectorKind::Users, element_type) {
        debug!(error = %e, "no-diff marker already present");
    }
}

fn emit<T>(report: &mut DiffReport, run_id: &str, item: &T, status: Status)
where
    T: Clone + Into<Element>,
{
    report.add_diff_element(
        DiffElement::new(run_id, item.clone(), status),
        CollectorKind::Users,
    );
}

fn one_side(run_id: &str, snapshot: &IdentitySnapshot, status: Status, report: &mut DiffReport) {
    side_category(run_id, &snapshot.users, status, report);
    side_category(run_id, &snapshot.groups, status, report);
    side_category(run_id, &snapshot.sudoers, status, report);
}

fn side_category<T>(run_id: &str, items: &[T], status: Status, report: &mut DiffReport)
where
    T: Collectible + Clone + Into<Element>,
{
    if items.is_empty() {
        no_diff(report, T::ELEMENT_TYPE);
    }
    for item in items {
        emit(report, run_id, item, status);
    }
}

/// Diffs one category.
///
/// Items present on both sides are ignored. A remaining `a` item pairs with
/// the first remaining `b` item of the same key (both MODIFIED); unpaired
/// `a` items are DELETED and unpaired `b` items CREATED.
fn category<T>(run_id_a: &str, run_id_b: &str, a: &[T], b: &[T], report: &mut DiffReport)
where
    T: Collectible + Clone + PartialEq + Into<Element>,
{
    let unique_a: Vec<&T> = a.iter().filter(|x| !b.contains(x)).collect();
    let mut unique_b: Vec<&T> = b.iter().filter(|x| !a.contains(x)).collect();

    if unique_a.is_empty() && unique_b.is_empty() {
        no_diff(report, T::ELEMENT_TYPE);
        return;
    }

    for item_a in unique_a {
        let key = item_a.identity_key();
        match unique_b.iter().position(|item_b| item_b.identity_key() == key) {
            Some(i) => {
                let item_b = unique_b.remove(i);
                emit(report, run_id_a, item_a, Status::Modified);
                emit(report, run_id_b, item_b, Status::Modified);
            }
            None => emit(report, run_id_a, item_a, Status::Deleted),
        }
    }
    for item_b in unique_b {
        emit(report, run_id_b, item_b, Status::Created);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::identity::{Group, Sudoer, User};
    use crate::digest::Digest;

    fn snapshot(users: Vec<User>, groups: Vec<Group>, sudoers: Vec<Sudoer>) -> IdentityCollector {
        IdentityCollector::from_snapshot(IdentitySnapshot {
            users,
            groups,
            sudoers,
            passwd_digest: Digest::of(b"passwd"),
            group_digest: Digest::of(b"group"),
        })
        .unwrap()
    }

    fn base() -> IdentityCollector {
        snapshot(
            vec![User::new(0, "root", [0]), User::new(1001, "alice", [1001])],
            vec![Group::new(0, "root"), Group::new(1001, "alice")],
            vec![Sudoer::new(0)],
        )
    }

    fn statuses(report: &DiffReport, ty: ElementType) -> Vec<(String, Status)> {
        report
            .elements(CollectorKind::Users, ty)
            .iter()
            .map(|e| (e.run_id.clone(), e.status))
            .collect()
    }

    #[test]
    fn test_unchanged_reports_no_diff_everywhere() {
        let mut report = DiffReport::new("a", "b");
        make_diff("a", "b", Some(&base()), Some(&base()), &mut report).unwrap();
        for ty in CollectorKind::Users.element_types() {
            assert!(report.is_no_diff(CollectorKind::Users, *ty));
        }
        assert_eq!(report.len(), 0);
    }

    #[test]
    fn test_renamed_user() {
        let b = snapshot(
            vec![User::new(0, "root", [0]), User::new(1001, "alicia", [1001])],
            vec![Group::new(0, "root"), Group::new(1001, "alice")],
            vec![Sudoer::new(0)],
        );
        let mut report = DiffReport::new("a", "b");
        make_diff("a", "b", Some(&base()), Some(&b), &mut report).unwrap();

        let users = report.elements(CollectorKind::Users, ElementType::User);
        assert_eq!(
            statuses(&report, ElementType::User),
            vec![("a".into(), Status::Modified), ("b".into(), Status::Modified)]
        );
        assert_eq!(users[0].element, Element::User(User::new(1001, "alice", [1001])));
        assert_eq!(users[1].element, Element::User(User::new(1001, "alicia", [1001])));
        assert!(report.is_no_diff(CollectorKind::Users, ElementType::Group));
        assert!(report.is_no_diff(CollectorKind::Users, ElementType::Sudoer));
    }

    #[test]
    fn test_created_and_deleted() {
        let b = snapshot(
            vec![User::new(0, "root", [0]), User::new(1002, "bob", [1002])],
            vec![Group::new(0, "root"), Group::new(1001, "alice")],
            vec![Sudoer::new(0), Sudoer::new(1002)],
        );
        let mut report = DiffReport::new("a", "b");
        make_diff("a", "b", Some(&base()), Some(&b), &mut report).unwrap();

        assert_eq!(
            statuses(&report, ElementType::User),
            vec![("a".into(), Status::Deleted), ("b".into(), Status::Created)]
        );
        assert_eq!(
            statuses(&report, ElementType::Sudoer),
            vec![("b".into(), Status::Created)]
        );
        assert!(report.is_no_diff(CollectorKind::Users, ElementType::Group));
    }

    #[test]
    fn test_group_membership_change_is_modified() {
        let b = snapshot(
            vec![User::new(0, "root", [0]), User::new(1001, "alice", [1001, 27])],
            vec![Group::new(0, "root"), Group::new(1001, "alice")],
            vec![Sudoer::new(0)],
        );
        let mut report = DiffReport::new("a", "b");
        make_diff("a", "b", Some(&base()), Some(&b), &mut report).unwrap();
        assert_eq!(report.elements(CollectorKind::Users, ElementType::User).len(), 2);
    }

    #[test]
    fn test_one_side_only() {
        let only_users = snapshot(vec![User::new(0, "root", [0])], vec![], vec![]);

        let mut report = DiffReport::new("a", "b");
        make_diff("a", "b", Some(&only_users), None, &mut report).unwrap();
        assert_eq!(
            statuses(&report, ElementType::User),
            vec![("a".into(), Status::Deleted)]
        );
        assert!(report.is_no_diff(CollectorKind::Users, ElementType::Group));

        let mut report = DiffReport::new("a", "b");
        make_diff("a", "b", None, Some(&only_users), &mut report).unwrap();
        assert_eq!(
            statuses(&report, ElementType::User),
            vec![("b".into(), Status::Created)]
        );

        let mut report = DiffReport::new("a", "b");
        assert_eq!(
            make_diff("a", "b", None, None, &mut report),
            Err(DiffError::NothingToCompare)
        );
    }

    #[test]
    fn test_diff_leaves_sources_untouched() {
        let a = base();
        let b = snapshot(vec![], vec![], vec![]);
        let before = a.snapshot().clone();
        let mut first = DiffReport::new("a", "b");
        let mut second = DiffReport::new("a", "b");
        make_diff("a", "b", Some(&a), Some(&b), &mut first).unwrap();
        make_diff("a", "b", Some(&a), Some(&b), &mut second).unwrap();
        assert_eq!(first, second);
        assert_eq!(a.snapshot(), &before);
    }
}
