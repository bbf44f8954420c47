//! Rule-based narrowing of a diff report.
//!
//! Rules are evaluated in insertion order and the last matching rule
//! decides. When the first applicable rule is an include, items start out
//! rejected; otherwise they start out kept. Collector rules match the
//! collector name; element rules match one named attribute.

use regex::Regex;
use thiserror::Error;

use crate::collector::CollectorKind;

use super::{DiffElement, DiffReport, ElementType, Section};

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid rule pattern: {0}")]
    Pattern(#[from] regex::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterLevel {
    Collector,
    Element,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleCommand {
    Include,
    Exclude,
}

#[derive(Debug, Clone)]
pub struct FilterRule {
    command: RuleCommand,
    level: FilterLevel,
    collector: Option<CollectorKind>,
    element_type: Option<ElementType>,
    target: String,
    pattern: Regex,
}

impl FilterRule {
    /// `pattern` is anchored at the start of the value.
    pub fn new(
        command: RuleCommand,
        level: FilterLevel,
        target: impl Into<String>,
        pattern: &str,
    ) -> Result<Self, FilterError> {
        Ok(Self {
            command,
            level,
            collector: None,
            element_type: None,
            target: target.into(),
            pattern: Regex::new(&format!("^(?:{pattern})"))?,
        })
    }

    /// Collector rule matched against collector names.
    pub fn collector(command: RuleCommand, pattern: &str) -> Result<Self, FilterError> {
        Self::new(command, FilterLevel::Collector, "name", pattern)
    }

    /// Element rule matched against attribute `target`.
    pub fn element(command: RuleCommand, target: impl Into<String>, pattern: &str) -> Result<Self, FilterError> {
        Self::new(command, FilterLevel::Element, target, pattern)
    }

    /// Restricts an element rule to one collector.
    pub fn in_collector(mut self, collector: CollectorKind) -> Self {
        self.collector = Some(collector);
        self
    }

    /// Restricts an element rule to one element type.
    pub fn on_type(mut self, element_type: ElementType) -> Self {
        self.element_type = Some(element_type);
        self
    }

    pub fn command(&self) -> RuleCommand {
        self.command
    }

    pub fn level(&self) -> FilterLevel {
        self.level
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.pattern.is_match(value)
    }

    /// Whether the rule matches `element`; `None` when the rule does not
    /// apply to it.
    pub fn run(&self, collector: CollectorKind, element: &DiffElement) -> Option<bool> {
        if self.level != FilterLevel::Element
            || self.collector.is_some_and(|c| c != collector)
            || self.element_type.is_some_and(|t| t != element.element_type())
        {
            return None;
        }
        let value = match self.target.as_str() {
            "run_id" => element.run_id.clone(),
            "status" => element.status.name().to_string(),
            other => element.element.attribute(other)?,
        };
        Some(self.is_match(&value))
    }
}

impl PartialEq for FilterRule {
    fn eq(&self, other: &Self) -> bool {
        self.command == other.command
            && self.level == other.level
            && self.collector == other.collector
            && self.element_type == other.element_type
            && self.target == other.target
            && self.pattern.as_str() == other.pattern.as_str()
    }
}

/// Last-match-wins evaluation over already resolved rule outcomes.
fn decide(outcomes: impl Iterator<Item = (RuleCommand, bool)>) -> bool {
    let mut keep = None;
    for (command, matched) in outcomes {
        let slot = keep.get_or_insert(command != RuleCommand::Include);
        if matched {
            *slot = command == RuleCommand::Include;
        }
    }
    keep.unwrap_or(true)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    rules: Vec<FilterRule>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a rule; earlier rules are overridden by later matches.
    pub fn add_rule(&mut self, rule: FilterRule) -> &mut Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    pub fn reset(&mut self) {
        self.rules.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn keeps_collector(&self, collector: CollectorKind) -> bool {
        decide(
            self.rules
                .iter()
                .filter(|r| r.level == FilterLevel::Collector)
                .map(|r| (r.command, r.is_match(collector.name()))),
        )
    }

    pub fn keeps_element(&self, collector: CollectorKind, element: &DiffElement) -> bool {
        decide(
            self.rules
                .iter()
                .filter_map(|r| r.run(collector, element).map(|m| (r.command, m))),
        )
    }

    /// Builds a filtered copy of `report`.
    ///
    /// No-diff markers survive whenever their collector does. Sections left
    /// without elements are dropped, then collectors left without sections.
    pub fn apply(&self, report: &DiffReport) -> DiffReport {
        let mut filtered = DiffReport::new(report.run_id_a(), report.run_id_b());
        for collector in report.collectors().filter(|c| self.keeps_collector(*c)) {
            let Some(sections) = report.sections(collector) else {
                continue;
            };
            for (element_type, section) in sections {
                let section = match section {
                    Section::NoDiff => Section::NoDiff,
                    Section::Elements(elements) => {
                        let kept: Vec<DiffElement> = elements
                            .iter()
                            .filter(|e| self.keeps_element(collector, e))
                            .cloned()
                            .collect();
                        if kept.is_empty() {
                            continue;
                        }
                        Section::Elements(kept)
                    }
                };
                filtered.insert_section(collector, *element_type, section);
            }
        }
        filtered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::identity::{Sudoer, User};
    use crate::report::Status;

    fn report() -> DiffReport {
        let mut report = DiffReport::new("a", "b");
        for (run, user, status) in [
            ("a", User::new(42, "liveis42", [42]), Status::Deleted),
            ("b", User::new(1001, "test", [1001]), Status::Created),
            ("b", User::new(1002, "svc7", [1002]), Status::Created),
        ] {
            report.add_diff_element(DiffElement::new(run, user, status), CollectorKind::Users);
        }
        report.add_diff_element(
            DiffElement::new("b", Sudoer::new(1001), Status::Created),
            CollectorKind::Users,
        );
        report.add_no_diff_element(CollectorKind::Users, ElementType::Group).unwrap();
        report.add_no_diff_element(CollectorKind::FileSystem, ElementType::File).unwrap();
        report
    }

    fn names(report: &DiffReport) -> Vec<String> {
        report
            .elements(CollectorKind::Users, ElementType::User)
            .iter()
            .filter_map(|e| e.element.attribute("name"))
            .collect()
    }

    #[test]
    fn test_rule_anchors_at_start() {
        let rule = FilterRule::element(RuleCommand::Include, "name", "[a-zA-Z]*[0-9]+[a-zA-Z]*").unwrap();
        assert!(rule.is_match("liveis42"));
        assert!(!rule.is_match("test"));

        let rule = FilterRule::collector(RuleCommand::Include, "File").unwrap();
        assert!(rule.is_match("File System Collector"));
        assert!(!rule.is_match("Users Collector, File"));
    }

    #[test]
    fn test_rule_equality() {
        let a = FilterRule::element(RuleCommand::Include, "name", "x").unwrap();
        let b = FilterRule::element(RuleCommand::Include, "name", "x").unwrap();
        let c = FilterRule::element(RuleCommand::Exclude, "name", "x").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_missing_target_does_not_apply() {
        let rule = FilterRule::element(RuleCommand::Include, "gid", ".*").unwrap();
        let sudoer = DiffElement::new("a", Sudoer::new(42), Status::Created);
        assert_eq!(rule.run(CollectorKind::Users, &sudoer), None);
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(matches!(
            FilterRule::element(RuleCommand::Include, "name", "(unclosed"),
            Err(FilterError::Pattern(_))
        ));
    }

    #[test]
    fn test_empty_filter_keeps_everything() {
        let report = report();
        assert_eq!(Filter::new().apply(&report), report);
    }

    #[test]
    fn test_collector_include() {
        let mut filter = Filter::new();
        filter.add_rule(FilterRule::collector(RuleCommand::Include, "Users").unwrap());
        let filtered = filter.apply(&report());
        assert_eq!(filtered.collectors().collect::<Vec<_>>(), vec![CollectorKind::Users]);
        assert_eq!(filtered.len(), 4);
    }

    #[test]
    fn test_collector_exclude() {
        let mut filter = Filter::new();
        filter.add_rule(FilterRule::collector(RuleCommand::Exclude, "Users").unwrap());
        let filtered = filter.apply(&report());
        assert_eq!(filtered.collectors().collect::<Vec<_>>(), vec![CollectorKind::FileSystem]);
    }

    #[test]
    fn test_element_include_scoped_to_type() {
        let mut filter = Filter::new();
        filter.add_rule(
            FilterRule::element(RuleCommand::Include, "name", "[a-zA-Z]*[0-9]+")
                .unwrap()
                .on_type(ElementType::User),
        );
        let filtered = filter.apply(&report());
        assert_eq!(names(&filtered), vec!["liveis42", "svc7"]);
        // sudoers are outside the rule's scope
        assert_eq!(filtered.elements(CollectorKind::Users, ElementType::Sudoer).len(), 1);
        assert!(filtered.is_no_diff(CollectorKind::Users, ElementType::Group));
    }

    #[test]
    fn test_last_match_wins() {
        let mut filter = Filter::new();
        filter
            .add_rule(FilterRule::element(RuleCommand::Exclude, "run_id", "b").unwrap())
            .add_rule(FilterRule::element(RuleCommand::Include, "name", "svc").unwrap());
        let filtered = filter.apply(&report());
        assert_eq!(names(&filtered), vec!["liveis42", "svc7"]);
        assert!(filtered.section(CollectorKind::Users, ElementType::Sudoer).is_none());
    }

    #[test]
    fn test_emptied_collector_is_dropped() {
        let mut report = DiffReport::new("a", "b");
        report.add_diff_element(
            DiffElement::new("a", Sudoer::new(0), Status::Deleted),
            CollectorKind::Users,
        );
        let mut filter = Filter::new();
        filter.add_rule(FilterRule::element(RuleCommand::Exclude, "status", "DELETED").unwrap());
        let filtered = filter.apply(&report);
        assert!(filtered.collectors().next().is_none());
    }
}
