//! Per-cycle view of unit states and the aggregation rules built on it.

use crate::graph::{Fork, Graph, NodeId, NodeKind};
use pipestance_store::{MetadataFile, UnitRef, UnitState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitSnapshot {
    pub state: UnitState,
    pub markers: BTreeSet<MetadataFile>,
}

/// Unit states read in one refresh. Never carried across cycles.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    units: HashMap<String, UnitSnapshot>,
}

impl Snapshot {
    pub fn insert(&mut self, fqname: String, unit: UnitSnapshot) {
        self.units.insert(fqname, unit);
    }

    pub fn get(&self, unit: &UnitRef) -> Option<&UnitSnapshot> {
        self.units.get(&unit.fqname)
    }

    /// `None` when the unit could not be read this cycle.
    pub fn state(&self, unit: &UnitRef) -> Option<UnitState> {
        self.get(unit).map(|snapshot| snapshot.state)
    }

    pub fn has(&self, unit: &UnitRef, file: MetadataFile) -> bool {
        self.get(unit)
            .is_some_and(|snapshot| snapshot.markers.contains(&file))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipestanceState {
    Running,
    Complete,
    Failed,
}

impl PipestanceState {
    pub fn as_str(self) -> &'static str {
        match self {
            PipestanceState::Running => "running",
            PipestanceState::Complete => "complete",
            PipestanceState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PipestanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn combine(states: impl IntoIterator<Item = UnitState>) -> UnitState {
    let mut any = false;
    let mut all_complete = true;
    let mut all_waiting = true;
    for state in states {
        any = true;
        match state {
            UnitState::Failed => return UnitState::Failed,
            UnitState::Complete => all_waiting = false,
            UnitState::Waiting => all_complete = false,
            UnitState::Queued | UnitState::Running => {
                all_complete = false;
                all_waiting = false;
            }
        }
    }
    if !any || all_waiting {
        UnitState::Waiting
    } else if all_complete {
        UnitState::Complete
    } else {
        UnitState::Running
    }
}

/// Aggregate state of one fork. The fork's own `_complete` is written only
/// after its outputs are verified, so a fork whose units are all complete is
/// still running until then.
pub fn fork_state(graph: &Graph, snapshot: &Snapshot, node: NodeId, fork: &Fork) -> UnitState {
    match snapshot.state(&fork.unit) {
        Some(UnitState::Complete) => return UnitState::Complete,
        Some(UnitState::Failed) => return UnitState::Failed,
        _ => {}
    }
    let aggregate = match (&graph.node(node).kind, &fork.stage) {
        (NodeKind::Stage(_), Some(units)) => {
            let mut states = vec![unit_state(snapshot, &units.split)];
            states.extend(
                units
                    .chunks
                    .iter()
                    .flatten()
                    .map(|chunk| unit_state(snapshot, &chunk.unit)),
            );
            states.push(unit_state(snapshot, &units.join));
            combine(states)
        }
        _ => combine(graph.node(node).children.iter().map(|&child| {
            graph
                .matching_fork(child, &fork.permutation)
                .map(|child_fork| fork_state(graph, snapshot, child, child_fork))
                .unwrap_or(UnitState::Waiting)
        })),
    };
    match aggregate {
        UnitState::Complete => UnitState::Running,
        other => other,
    }
}

pub fn node_state(graph: &Graph, snapshot: &Snapshot, node: NodeId) -> UnitState {
    combine(
        graph
            .node(node)
            .forks
            .iter()
            .map(|fork| fork_state(graph, snapshot, node, fork)),
    )
}

pub fn pipestance_state(graph: &Graph, snapshot: &Snapshot) -> PipestanceState {
    let any_failed = graph
        .nodes()
        .any(|node| node_state(graph, snapshot, node.id) == UnitState::Failed);
    if any_failed {
        return PipestanceState::Failed;
    }
    match node_state(graph, snapshot, graph.root()) {
        UnitState::Complete => PipestanceState::Complete,
        _ => PipestanceState::Running,
    }
}

fn unit_state(snapshot: &Snapshot, unit: &UnitRef) -> UnitState {
    snapshot.state(unit).unwrap_or(UnitState::Waiting)
}
