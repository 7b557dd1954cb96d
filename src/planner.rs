//! Planner & `FallbackAnalyzer` (§4.7).
//!
//! The primary planner is LLM-driven and out of scope (§1). What's here is
//! the regex-based degradation path: split a plan document into numbered
//! sections, pull an optional `Depends-on:` line out of each, and turn the
//! result into [`WorkItem`]s. Reachable only through the [`Planner`] trait
//! so it can be exercised independently of any LLM.

use std::collections::BTreeSet;
use std::fmt;

use regex::Regex;

use crate::ids::ItemId;
use crate::model::item::WorkItem;

/// Converts a plan document (or, in tracker mode, a serialized issue set)
/// into work items.
pub trait Planner {
    /// # Errors
    /// Returns [`PlannerError`] if the input cannot be decomposed into at
    /// least one well-formed work item.
    fn parse(&self, text: &str) -> Result<Vec<WorkItem>, PlannerError>;
}

/// The input plan document could not be parsed into work items.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannerError(pub String);

impl fmt::Display for PlannerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "planner error: {}", self.0)
    }
}

impl std::error::Error for PlannerError {}

struct RawSection {
    id: u32,
    title: String,
    body: String,
}

/// A pragmatic regex-based planner: sections are lines matching
/// `## N. Title` or `N. Title`; each section's body may contain a
/// `Depends-on: #a, #b` line naming the ids it waits on.
pub struct FallbackAnalyzer {
    header: Regex,
    depends: Regex,
    dep_token: Regex,
}

impl Default for FallbackAnalyzer {
    fn default() -> Self {
        Self {
            header: Regex::new(r"(?m)^(?:#{1,6}\s*)?(\d+)\.\s+(.+?)\s*$")
                .expect("static header pattern is valid"),
            depends: Regex::new(r"(?mi)^Depends-on:\s*(.*)$")
                .expect("static depends-on pattern is valid"),
            dep_token: Regex::new(r"#(\d+)").expect("static dependency-token pattern is valid"),
        }
    }
}

impl FallbackAnalyzer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sections(&self, text: &str) -> Vec<RawSection> {
        let headers: Vec<(usize, usize, u32, String)> = self
            .header
            .captures_iter(text)
            .filter_map(|c| {
                let whole = c.get(0)?;
                let id: u32 = c[1].parse().ok()?;
                Some((whole.start(), whole.end(), id, c[2].trim().to_owned()))
            })
            .collect();

        headers
            .iter()
            .enumerate()
            .map(|(i, &(_, end, id, ref title))| {
                let body_end = headers.get(i + 1).map_or(text.len(), |next| next.0);
                let body = text[end..body_end].trim().to_owned();
                RawSection { id, title: title.clone(), body }
            })
            .collect()
    }

    fn dependencies_of(&self, body: &str) -> Vec<u32> {
        self.depends
            .captures(body)
            .map(|c| self.dep_token.captures_iter(&c[1]).filter_map(|m| m[1].parse().ok()).collect())
            .unwrap_or_default()
    }
}

impl Planner for FallbackAnalyzer {
    fn parse(&self, text: &str) -> Result<Vec<WorkItem>, PlannerError> {
        let raw = self.sections(text);
        if raw.is_empty() {
            return Err(PlannerError(
                "no numbered sections found (expected lines like `## 1. Title`)".to_owned(),
            ));
        }

        let mut seen_ids: BTreeSet<u32> = BTreeSet::new();
        let mut known_ids: BTreeSet<ItemId> = BTreeSet::new();
        for section in &raw {
            if !seen_ids.insert(section.id) {
                return Err(PlannerError(format!("duplicate section id {}", section.id)));
            }
            let id = ItemId::new(section.id).map_err(|e| PlannerError(e.to_string()))?;
            known_ids.insert(id);
        }

        raw.into_iter()
            .map(|section| {
                let id = ItemId::new(section.id).map_err(|e| PlannerError(e.to_string()))?;
                let deps: Vec<ItemId> =
                    self.dependencies_of(&section.body).into_iter().filter_map(|d| ItemId::new(d).ok()).collect();
                Ok(WorkItem::new(id, section.title, section.body, deps, [], false, None, &known_ids))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iid(v: u32) -> ItemId {
        ItemId::new(v).unwrap()
    }

    #[test]
    fn parses_markdown_headers_with_dependencies() {
        let text = "\
## 1. Set up schema

Create the base tables.

## 2. Write migration

Depends-on: #1

Adds a migration using the new schema.
";
        let items = FallbackAnalyzer::new().parse(text).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, iid(1));
        assert_eq!(items[0].title, "Set up schema");
        assert!(items[0].dependencies.is_empty());
        assert_eq!(items[1].dependencies, BTreeSet::from([iid(1)]));
    }

    #[test]
    fn parses_plain_numbered_list_without_markdown_headers() {
        let text = "1. First step\nDo the first thing.\n\n2. Second step\nDepends-on: #1\nDo the second.\n";
        let items = FallbackAnalyzer::new().parse(text).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].dependencies, BTreeSet::from([iid(1)]));
    }

    #[test]
    fn drops_self_and_unknown_dependency_references() {
        let text = "\
## 1. Alone

Depends-on: #1, #99

No real dependencies survive.
";
        let items = FallbackAnalyzer::new().parse(text).unwrap();
        assert!(items[0].dependencies.is_empty());
    }

    #[test]
    fn multiple_comma_separated_dependencies() {
        let text = "\
## 1. First

## 2. Second

## 3. Third

Depends-on: #1, #2
";
        let items = FallbackAnalyzer::new().parse(text).unwrap();
        assert_eq!(items[2].dependencies, BTreeSet::from([iid(1), iid(2)]));
    }

    #[test]
    fn empty_document_is_rejected() {
        let err = FallbackAnalyzer::new().parse("just some prose, no sections").unwrap_err();
        assert!(err.0.contains("no numbered sections"));
    }

    #[test]
    fn duplicate_section_id_is_rejected() {
        let text = "## 1. First\n\n## 1. Also first\n";
        let err = FallbackAnalyzer::new().parse(text).unwrap_err();
        assert!(err.0.contains("duplicate"));
    }
}
