// src/dag/graph.rs

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::dag::Registry;
use crate::types::{Guid, ResourceAction};

/// Resource dependency graph derived from registered conditions.
///
/// Edge direction: guard -> target. For a condition "start B once A is
/// STARTED" we add edge A -> B.
#[derive(Debug, Clone, Default)]
pub struct ConditionGraph {
    graph: DiGraphMap<Guid, ()>,
}

/// Every gated action.
pub const ALL_ACTIONS: &[ResourceAction] = &[
    ResourceAction::Deploy,
    ResourceAction::Start,
    ResourceAction::Stop,
];

/// Actions whose conditions must not form a cycle: a START/STOP cycle can
/// never be satisfied.
pub const ORDERED_ACTIONS: &[ResourceAction] = &[ResourceAction::Start, ResourceAction::Stop];

impl ConditionGraph {
    /// Snapshot the `actions` conditions of every registered resource.
    pub fn from_registry(registry: &Registry, actions: &[ResourceAction]) -> Self {
        let mut graph = Self::default();
        for rm in registry.all() {
            let target = rm.guid();
            graph.add_node(target);
            for &action in actions {
                for cond in rm.core().conditions(action) {
                    for guard in cond.guards {
                        graph.add_edge(guard, target);
                    }
                }
            }
        }
        graph
    }

    pub fn add_node(&mut self, guid: Guid) {
        self.graph.add_node(guid);
    }

    pub fn add_edge(&mut self, guard: Guid, target: Guid) {
        self.graph.add_edge(guard, target, ());
    }

    /// Resources `guid` waits on.
    pub fn dependencies_of(&self, guid: Guid) -> Vec<Guid> {
        self.graph
            .neighbors_directed(guid, Direction::Incoming)
            .collect()
    }

    /// Resources waiting on `guid`.
    pub fn dependents_of(&self, guid: Guid) -> Vec<Guid> {
        self.graph
            .neighbors_directed(guid, Direction::Outgoing)
            .collect()
    }

    /// A resource involved in a cycle, if there is one.
    pub fn find_cycle(&self) -> Option<Guid> {
        if let Some((a, _, _)) = self.graph.all_edges().find(|(a, b, _)| a == b) {
            return Some(a);
        }
        toposort(&self.graph, None).err().map(|cycle| cycle.node_id())
    }

    /// Group `guids` into release waves: every resource is released in an
    /// earlier wave than the resources it waits on.
    ///
    /// With a cyclic graph there is no such order and everything ends up in
    /// a single wave.
    pub fn release_waves(&self, guids: &[Guid]) -> Vec<Vec<Guid>> {
        let order = match toposort(&self.graph, None) {
            Ok(order) => order,
            Err(_) => return vec![guids.to_vec()],
        };

        // height = 0 for resources nobody waits on, otherwise one more than
        // the highest dependent.
        let mut height: HashMap<Guid, usize> = HashMap::new();
        for guid in order.into_iter().rev() {
            let h = self
                .graph
                .neighbors_directed(guid, Direction::Outgoing)
                .filter_map(|dep| height.get(&dep))
                .map(|h| h + 1)
                .max()
                .unwrap_or(0);
            height.insert(guid, h);
        }

        let mut waves: Vec<Vec<Guid>> = Vec::new();
        for guid in guids {
            let h = height.get(guid).copied().unwrap_or(0);
            if waves.len() <= h {
                waves.resize_with(h + 1, Vec::new);
            }
            waves[h].push(*guid);
        }
        waves.retain(|w| !w.is_empty());
        waves
    }
}
