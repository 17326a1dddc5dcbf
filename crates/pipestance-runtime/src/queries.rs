//! Read-only views for dashboards and operators.

use crate::graph::{Graph, NodeId, UnitRole};
use crate::state::{Snapshot, fork_state, node_state};
use pipestance_store::{
    FailureKind, MetadataFile, MetadataStore, MetadataStoreResult, UnitState, read_failure,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Lines of `_stderr` handed to the failure classifier.
const STDERR_TAIL_LINES: usize = 40;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnitInfo {
    pub fqname: String,
    pub role: String,
    pub state: UnitState,
    pub path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForkInfo {
    pub index: usize,
    pub state: UnitState,
    /// Sweep id to the index of the swept value.
    pub permutation: BTreeMap<String, usize>,
    pub units: Vec<UnitInfo>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub fqname: String,
    pub name: String,
    pub kind: String,
    pub state: UnitState,
    pub path: PathBuf,
    pub volatile: bool,
    pub forks: Vec<ForkInfo>,
    pub children: Vec<NodeInfo>,
}

/// The first failing unit of a failed pipestance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FatalError {
    pub fqname: String,
    pub kind: FailureKind,
    pub summary: String,
    /// `None` for asserts, which are reported without a log pointer.
    pub log_path: Option<PathBuf>,
    /// Tail of the job's stderr, when it left one.
    pub stderr_tail: Option<String>,
}

impl FatalError {
    pub fn is_assert(&self) -> bool {
        self.kind == FailureKind::Assert
    }
}

pub fn node_info(graph: &Graph, snapshot: &Snapshot, id: NodeId) -> NodeInfo {
    let node = graph.node(id);
    let entries = graph.unit_entries();
    let forks = node
        .forks
        .iter()
        .map(|fork| ForkInfo {
            index: fork.index,
            state: fork_state(graph, snapshot, id, fork),
            permutation: fork.permutation.clone(),
            units: entries
                .iter()
                .filter(|entry| entry.node == id && entry.fork == fork.index)
                .filter(|entry| entry.role != UnitRole::Fork)
                .map(|entry| UnitInfo {
                    fqname: entry.unit.fqname.clone(),
                    role: entry.role.label().to_string(),
                    state: snapshot.state(&entry.unit).unwrap_or(UnitState::Waiting),
                    path: entry.unit.path.clone(),
                })
                .collect(),
        })
        .collect();
    NodeInfo {
        fqname: node.fqname.clone(),
        name: node.name.clone(),
        kind: node.kind_label().to_string(),
        state: node_state(graph, snapshot, id),
        path: node.path.clone(),
        volatile: node.modifiers.volatile,
        forks,
        children: node
            .children
            .iter()
            .map(|&child| node_info(graph, snapshot, child))
            .collect(),
    }
}

/// Finds the first failed unit in graph order and reads its failure.
pub async fn fatal_error(
    store: &dyn MetadataStore,
    graph: &Graph,
    snapshot: &Snapshot,
) -> MetadataStoreResult<Option<FatalError>> {
    let failed = graph
        .unit_entries()
        .into_iter()
        .filter(|entry| entry.role != UnitRole::Fork)
        .chain(
            graph
                .unit_entries()
                .into_iter()
                .filter(|entry| entry.role == UnitRole::Fork),
        )
        .find(|entry| snapshot.state(&entry.unit) == Some(UnitState::Failed));
    let Some(entry) = failed else {
        return Ok(None);
    };
    let unit = entry.unit;
    let failure = read_failure(store, &unit).await?;
    let (kind, summary) = match failure {
        Some(failure) => (failure.kind, failure.message),
        None => (FailureKind::Execution, "unit failed without a message".to_string()),
    };
    let log_path = match kind {
        FailureKind::Assert => None,
        _ => Some(unit.file_path(MetadataFile::Errors)),
    };
    let stderr_tail = store
        .read_raw(&unit, MetadataFile::StdErr)
        .await
        .ok()
        .flatten()
        .map(|stderr| tail_lines(&stderr, STDERR_TAIL_LINES))
        .filter(|tail| !tail.is_empty());
    Ok(Some(FatalError {
        fqname: unit.fqname,
        kind,
        summary: summary.trim().to_string(),
        log_path,
        stderr_tail,
    }))
}

fn tail_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}
