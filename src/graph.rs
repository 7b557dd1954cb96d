//! Dependency graph over work items (§4.1).
//!
//! Every scheduling decision is a pure function of `(graph, completed,
//! failed)`, which is what makes the scheduler testable without touching
//! the filesystem or a VCS at all.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::ids::ItemId;
use crate::model::item::WorkItem;

/// An immutable directed acyclic graph of work items.
#[derive(Clone, Debug)]
pub struct Graph {
    ids: Vec<ItemId>,
    dependencies: BTreeMap<ItemId, BTreeSet<ItemId>>,
    dependents: BTreeMap<ItemId, BTreeSet<ItemId>>,
    topo_order: Vec<ItemId>,
}

impl Graph {
    /// Build a graph from a set of work items, rejecting anything that
    /// isn't a DAG.
    ///
    /// # Errors
    /// Returns [`CycleError`] listing each strongly-connected component of
    /// size greater than one.
    pub fn build(items: &[WorkItem]) -> Result<Self, CycleError> {
        let mut dependencies: BTreeMap<ItemId, BTreeSet<ItemId>> = BTreeMap::new();
        let mut dependents: BTreeMap<ItemId, BTreeSet<ItemId>> = BTreeMap::new();
        let mut ids: Vec<ItemId> = Vec::with_capacity(items.len());

        for item in items {
            ids.push(item.id);
            dependencies.entry(item.id).or_default();
            dependents.entry(item.id).or_default();
        }
        ids.sort_unstable();

        for item in items {
            for dep in &item.dependencies {
                dependencies.entry(item.id).or_default().insert(*dep);
                dependents.entry(*dep).or_default().insert(item.id);
            }
        }

        let cycles = find_cycles(&ids, &dependencies);
        if !cycles.is_empty() {
            return Err(CycleError { cycles });
        }

        let topo_order = topological_order(&ids, &dependencies);

        Ok(Self {
            ids,
            dependencies,
            dependents,
            topo_order,
        })
    }

    /// All item ids known to this graph, ascending.
    #[must_use]
    pub fn item_ids(&self) -> &[ItemId] {
        &self.ids
    }

    /// Direct dependencies of `id` (empty set if `id` is unknown).
    #[must_use]
    pub fn dependencies(&self, id: ItemId) -> BTreeSet<ItemId> {
        self.dependencies.get(&id).cloned().unwrap_or_default()
    }

    /// Direct dependents of `id` (empty set if `id` is unknown).
    #[must_use]
    pub fn dependents(&self, id: ItemId) -> BTreeSet<ItemId> {
        self.dependents.get(&id).cloned().unwrap_or_default()
    }

    /// Items not in `completed` whose dependencies are all in `completed`.
    #[must_use]
    pub fn ready(&self, completed: &BTreeSet<ItemId>) -> BTreeSet<ItemId> {
        self.ids
            .iter()
            .copied()
            .filter(|id| !completed.contains(id))
            .filter(|id| self.dependencies(*id).is_subset(completed))
            .collect()
    }

    /// True if any transitive dependency of `id` is in `failed`.
    #[must_use]
    pub fn is_blocked_by_failure(&self, id: ItemId, failed: &BTreeSet<ItemId>) -> bool {
        let mut stack: Vec<ItemId> = self.dependencies(id).into_iter().collect();
        let mut seen: BTreeSet<ItemId> = BTreeSet::new();
        while let Some(dep) = stack.pop() {
            if !seen.insert(dep) {
                continue;
            }
            if failed.contains(&dep) {
                return true;
            }
            stack.extend(self.dependencies(dep));
        }
        false
    }

    /// A stable topological order, ascending-id tie-break, for display and
    /// issue-creation order.
    #[must_use]
    pub fn topological_order(&self) -> &[ItemId] {
        &self.topo_order
    }
}

/// The graph was not acyclic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CycleError {
    /// Each entry is one strongly-connected component of size > 1, i.e. one
    /// cycle (or set of mutually-reachable cycles).
    pub cycles: Vec<Vec<ItemId>>,
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dependency graph has cycles: ")?;
        for (i, cycle) in self.cycles.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            let rendered: Vec<String> = cycle.iter().map(ToString::to_string).collect();
            write!(f, "[{}]", rendered.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for CycleError {}

/// Tarjan's strongly-connected-components algorithm, iterative to avoid
/// stack overflows on pathological inputs. Returns every SCC with more than
/// one member, each sorted ascending for deterministic error messages.
fn find_cycles(
    ids: &[ItemId],
    dependencies: &BTreeMap<ItemId, BTreeSet<ItemId>>,
) -> Vec<Vec<ItemId>> {
    struct State {
        index: BTreeMap<ItemId, u32>,
        low_link: BTreeMap<ItemId, u32>,
        on_stack: BTreeSet<ItemId>,
        stack: Vec<ItemId>,
        next_index: u32,
        sccs: Vec<Vec<ItemId>>,
    }

    enum Frame {
        Enter(ItemId),
        Finish(ItemId),
    }

    let mut state = State {
        index: BTreeMap::new(),
        low_link: BTreeMap::new(),
        on_stack: BTreeSet::new(),
        stack: Vec::new(),
        next_index: 0,
        sccs: Vec::new(),
    };

    for &start in ids {
        if state.index.contains_key(&start) {
            continue;
        }
        let mut work: Vec<Frame> = vec![Frame::Enter(start)];
        while let Some(frame) = work.pop() {
            match frame {
                Frame::Enter(v) => {
                    if state.index.contains_key(&v) {
                        continue;
                    }
                    state.index.insert(v, state.next_index);
                    state.low_link.insert(v, state.next_index);
                    state.next_index += 1;
                    state.stack.push(v);
                    state.on_stack.insert(v);

                    work.push(Frame::Finish(v));
                    for w in dependencies.get(&v).into_iter().flatten().copied() {
                        if !state.index.contains_key(&w) {
                            work.push(Frame::Enter(w));
                        } else if state.on_stack.contains(&w) {
                            let v_low = state.low_link[&v];
                            let w_idx = state.index[&w];
                            state.low_link.insert(v, v_low.min(w_idx));
                        }
                    }
                }
                Frame::Finish(v) => {
                    for w in dependencies.get(&v).into_iter().flatten().copied() {
                        if state.on_stack.contains(&w) {
                            let v_low = state.low_link[&v];
                            let w_low = state.low_link[&w];
                            state.low_link.insert(v, v_low.min(w_low));
                        }
                    }
                    if state.low_link[&v] == state.index[&v] {
                        let mut component = Vec::new();
                        while let Some(w) = state.stack.pop() {
                            state.on_stack.remove(&w);
                            component.push(w);
                            if w == v {
                                break;
                            }
                        }
                        if component.len() > 1 {
                            component.sort_unstable();
                            state.sccs.push(component);
                        }
                    }
                }
            }
        }
    }

    state.sccs.sort();
    state.sccs
}

/// Kahn's algorithm, ascending-id tie-break. Only called after
/// [`find_cycles`] has confirmed acyclicity.
fn topological_order(
    ids: &[ItemId],
    dependencies: &BTreeMap<ItemId, BTreeSet<ItemId>>,
) -> Vec<ItemId> {
    let mut remaining_deps: BTreeMap<ItemId, BTreeSet<ItemId>> = dependencies.clone();
    let mut order = Vec::with_capacity(ids.len());
    let mut frontier: BTreeSet<ItemId> = ids
        .iter()
        .copied()
        .filter(|id| remaining_deps.get(id).is_none_or(BTreeSet::is_empty))
        .collect();

    let mut dependents: BTreeMap<ItemId, BTreeSet<ItemId>> = BTreeMap::new();
    for (&id, deps) in dependencies {
        for &dep in deps {
            dependents.entry(dep).or_default().insert(id);
        }
    }

    while let Some(&next) = frontier.iter().next() {
        frontier.remove(&next);
        order.push(next);
        for dependent in dependents.get(&next).into_iter().flatten().copied() {
            if let Some(deps) = remaining_deps.get_mut(&dependent) {
                deps.remove(&next);
                if deps.is_empty() {
                    frontier.insert(dependent);
                }
            }
        }
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet as Set;

    fn item(id: u32, deps: &[u32]) -> WorkItem {
        let iid = ItemId::new(id).unwrap();
        let known: Set<ItemId> = deps
            .iter()
            .chain(std::iter::once(&id))
            .map(|v| ItemId::new(*v).unwrap())
            .collect();
        WorkItem::new(
            iid,
            "t",
            "b",
            deps.iter().map(|v| ItemId::new(*v).unwrap()),
            [],
            false,
            None,
            &known,
        )
    }

    fn iid(v: u32) -> ItemId {
        ItemId::new(v).unwrap()
    }

    #[test]
    fn linear_chain_ready_and_topo_order() {
        let items = vec![item(1, &[]), item(2, &[1]), item(3, &[2])];
        let graph = Graph::build(&items).unwrap();

        assert_eq!(graph.ready(&Set::new()), Set::from([iid(1)]));
        assert_eq!(graph.topological_order(), &[iid(1), iid(2), iid(3)]);

        let completed = Set::from([iid(1)]);
        assert_eq!(graph.ready(&completed), Set::from([iid(2)]));
    }

    #[test]
    fn diamond_ready_set_is_both_branches_at_once() {
        let items = vec![item(1, &[]), item(2, &[1]), item(3, &[1]), item(4, &[2, 3])];
        let graph = Graph::build(&items).unwrap();

        let completed = Set::from([iid(1)]);
        assert_eq!(graph.ready(&completed), Set::from([iid(2), iid(3)]));

        let completed = Set::from([iid(1), iid(2), iid(3)]);
        assert_eq!(graph.ready(&completed), Set::from([iid(4)]));
    }

    #[test]
    fn cycle_is_rejected_before_any_other_work() {
        // Items 1 and 2 depend on each other; construct dependencies
        // directly since WorkItem::new would normally drop unknown ids but
        // here both ids are known to each other, so the cycle survives.
        let known = Set::from([iid(1), iid(2)]);
        let a = WorkItem::new(iid(1), "a", "", [iid(2)], [], false, None, &known);
        let b = WorkItem::new(iid(2), "b", "", [iid(1)], [], false, None, &known);

        let err = Graph::build(&[a, b]).unwrap_err();
        assert_eq!(err.cycles, vec![vec![iid(1), iid(2)]]);
    }

    #[test]
    fn blocked_by_failure_is_transitive() {
        let items = vec![item(1, &[]), item(2, &[1]), item(3, &[2])];
        let graph = Graph::build(&items).unwrap();

        let failed = Set::from([iid(1)]);
        assert!(graph.is_blocked_by_failure(iid(2), &failed));
        assert!(graph.is_blocked_by_failure(iid(3), &failed));
        assert!(!graph.is_blocked_by_failure(iid(1), &failed));
    }

    #[test]
    fn empty_graph_ready_is_empty() {
        let graph = Graph::build(&[]).unwrap();
        assert!(graph.ready(&Set::new()).is_empty());
        assert!(graph.topological_order().is_empty());
    }

    #[test]
    fn topological_order_is_stable_across_builds() {
        let items = vec![item(3, &[1]), item(1, &[]), item(2, &[1])];
        let a = Graph::build(&items).unwrap().topological_order().to_vec();
        let b = Graph::build(&items).unwrap().topological_order().to_vec();
        assert_eq!(a, b);
        assert_eq!(a[0], iid(1));
    }
}
