//! `WorkItem` — a unit of decomposed change with a dependency list.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ids::ItemId;

/// A single unit of work produced by the planner or tracker.
///
/// Dependencies are normalized at construction time: self-edges are
/// rejected and references to ids outside `known_ids` are silently dropped,
/// matching the source's "dependencies reference other item ids only" rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: ItemId,
    pub title: String,
    pub body: String,
    pub dependencies: BTreeSet<ItemId>,
    pub affected_paths: BTreeSet<String>,
    pub no_work_needed: bool,
    pub external_ref: Option<u64>,
}

impl WorkItem {
    /// Construct a `WorkItem`, dropping self-edges and unknown dependency
    /// ids. `known_ids` should contain every id in the batch being built,
    /// including this item's own id.
    #[must_use]
    pub fn new(
        id: ItemId,
        title: impl Into<String>,
        body: impl Into<String>,
        dependencies: impl IntoIterator<Item = ItemId>,
        affected_paths: impl IntoIterator<Item = String>,
        no_work_needed: bool,
        external_ref: Option<u64>,
        known_ids: &BTreeSet<ItemId>,
    ) -> Self {
        let dependencies = dependencies
            .into_iter()
            .filter(|dep| *dep != id && known_ids.contains(dep))
            .collect();

        Self {
            id,
            title: title.into(),
            body: body.into(),
            dependencies,
            affected_paths: affected_paths.into_iter().collect(),
            no_work_needed,
            external_ref,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(vals: &[u32]) -> BTreeSet<ItemId> {
        vals.iter().map(|v| ItemId::new(*v).unwrap()).collect()
    }

    #[test]
    fn self_edge_is_dropped() {
        let known = ids(&[1, 2]);
        let item = WorkItem::new(
            ItemId::new(1).unwrap(),
            "t",
            "b",
            [ItemId::new(1).unwrap(), ItemId::new(2).unwrap()],
            [],
            false,
            None,
            &known,
        );
        assert_eq!(item.dependencies, ids(&[2]));
    }

    #[test]
    fn unknown_dependency_is_dropped() {
        let known = ids(&[1, 2]);
        let item = WorkItem::new(
            ItemId::new(1).unwrap(),
            "t",
            "b",
            [ItemId::new(2).unwrap(), ItemId::new(99).unwrap()],
            [],
            false,
            None,
            &known,
        );
        assert_eq!(item.dependencies, ids(&[2]));
    }
}
