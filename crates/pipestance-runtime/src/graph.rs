//! In-memory node graph materialized from a [`CallGraph`].
//!
//! Nodes live in an arena indexed by [`NodeId`]. Nodes are created producers
//! first, so iterating the arena in order visits every producer before its
//! consumers. Pipeline outputs and `self` references are substituted at build
//! time: a resolved binding only ever points at a stage node.

use crate::callgraph::{BindingExpr, CallDef, CallGraph, CallModifiers, Callable, PipelineDef, StageDef};
use crate::errors::PipestanceError;
use crate::value::{ArgValue, ArgumentMap};
use pipestance_store::UnitRef;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Clone, Debug)]
pub enum NodeKind {
    Stage(Arc<StageDef>),
    Pipeline(Arc<PipelineDef>),
}

/// A binding after `self` and pipeline-output substitution.
#[derive(Clone, Debug, PartialEq)]
pub enum Resolved {
    Value(ArgValue),
    Sweep { id: String, values: Vec<ArgValue> },
    Output { node: NodeId, output: Option<String> },
    Array(Vec<Resolved>),
    Map(BTreeMap<String, Resolved>),
}

impl Resolved {
    fn collect(&self, nodes: &mut BTreeSet<NodeId>, sweeps: &mut BTreeSet<String>) {
        match self {
            Resolved::Value(_) => {}
            Resolved::Sweep { id, .. } => {
                sweeps.insert(id.clone());
            }
            Resolved::Output { node, .. } => {
                nodes.insert(*node);
            }
            Resolved::Array(items) => items.iter().for_each(|item| item.collect(nodes, sweeps)),
            Resolved::Map(map) => map.values().for_each(|item| item.collect(nodes, sweeps)),
        }
    }
}

/// Sweep id to the index of the value this fork takes.
pub type Permutation = BTreeMap<String, usize>;

#[derive(Clone, Debug, PartialEq)]
pub struct ChunkUnit {
    pub unit: UnitRef,
    pub def: ArgumentMap,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StageUnits {
    pub split: UnitRef,
    pub join: UnitRef,
    /// `None` until the split's chunk definitions have been read. Once set
    /// the chunk count never changes until the fork is reset.
    pub chunks: Option<Vec<ChunkUnit>>,
    pub join_def: ArgumentMap,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Fork {
    pub index: usize,
    pub permutation: Permutation,
    pub unit: UnitRef,
    pub stage: Option<StageUnits>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum UnitRole {
    Fork,
    Split,
    Chunk(usize),
    Join,
}

impl UnitRole {
    pub fn label(self) -> &'static str {
        match self {
            UnitRole::Fork => "fork",
            UnitRole::Split => "split",
            UnitRole::Chunk(_) => "chunk",
            UnitRole::Join => "join",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct UnitEntry {
    pub node: NodeId,
    pub fork: usize,
    pub role: UnitRole,
    pub unit: UnitRef,
}

#[derive(Clone, Debug)]
pub struct Node {
    pub id: NodeId,
    pub fqname: String,
    pub name: String,
    pub path: PathBuf,
    pub kind: NodeKind,
    pub modifiers: CallModifiers,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub bindings: BTreeMap<String, Resolved>,
    /// Pipeline return bindings; empty for stages.
    pub returns: BTreeMap<String, Resolved>,
    /// Stage nodes whose outputs this node reads.
    pub prenodes: BTreeSet<NodeId>,
    /// Nodes that read this node's outputs.
    pub postnodes: BTreeSet<NodeId>,
    /// Preflight siblings that must complete first.
    pub preflights: BTreeSet<NodeId>,
    pub sweep_dims: Vec<String>,
    pub forks: Vec<Fork>,
    /// Outputs reachable from the top-level return bindings.
    pub retained: bool,
}

impl Node {
    pub fn stage(&self) -> Option<&Arc<StageDef>> {
        match &self.kind {
            NodeKind::Stage(stage) => Some(stage),
            NodeKind::Pipeline(_) => None,
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match self.kind {
            NodeKind::Stage(_) => "stage",
            NodeKind::Pipeline(_) => "pipeline",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Graph {
    psid: String,
    root_path: PathBuf,
    nodes: Vec<Node>,
    root: NodeId,
    sweep_sizes: BTreeMap<String, usize>,
}

impl Graph {
    /// Materializes nodes and forks. `root_path` is the pipestance directory;
    /// the top-level call lives in `<root_path>/<call id>`.
    pub fn build(
        call_graph: &CallGraph,
        psid: &str,
        root_path: &Path,
    ) -> Result<Self, PipestanceError> {
        let call = &call_graph.call;
        let fqname = format!("ID.{psid}.{}", call.id);
        let mut builder = Builder {
            call_graph,
            nodes: Vec::new(),
            sweep_sizes: BTreeMap::new(),
        };
        let mut bindings = BTreeMap::new();
        for (name, expr) in &call.bindings {
            let resolved = builder.resolve(
                expr,
                &format!("{fqname}.{name}"),
                &BTreeMap::new(),
                &BTreeMap::new(),
            )?;
            bindings.insert(name.clone(), resolved);
        }
        let root = builder.add_call(call, fqname, root_path.join(&call.id), None, bindings)?;
        let mut graph = Graph {
            psid: psid.to_string(),
            root_path: root_path.to_path_buf(),
            nodes: builder.nodes,
            root,
            sweep_sizes: builder.sweep_sizes,
        };
        graph.link_edges();
        graph.mark_retained();
        graph.build_forks();
        Ok(graph)
    }

    pub fn psid(&self) -> &str {
        &self.psid
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn find(&self, fqname: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|node| node.fqname == fqname)
            .map(|node| node.id)
    }

    /// Preflight gates of the node and of every enclosing pipeline.
    pub fn gates(&self, id: NodeId) -> BTreeSet<NodeId> {
        let mut gates = BTreeSet::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = self.node(node_id);
            gates.extend(node.preflights.iter().copied());
            current = node.parent;
        }
        gates
    }

    /// The fork of `node` whose sweep indices agree with `permutation`.
    pub fn matching_fork(&self, node: NodeId, permutation: &Permutation) -> Option<&Fork> {
        self.node(node).forks.iter().find(|fork| {
            fork.permutation
                .iter()
                .all(|(dim, index)| permutation.get(dim) == Some(index))
        })
    }

    /// Every unit of every fork, in node order.
    pub fn unit_entries(&self) -> Vec<UnitEntry> {
        let mut entries = Vec::new();
        for node in &self.nodes {
            for fork in &node.forks {
                let entry = |role: UnitRole, unit: &UnitRef| UnitEntry {
                    node: node.id,
                    fork: fork.index,
                    role,
                    unit: unit.clone(),
                };
                entries.push(entry(UnitRole::Fork, &fork.unit));
                let Some(units) = &fork.stage else {
                    continue;
                };
                entries.push(entry(UnitRole::Split, &units.split));
                for (index, chunk) in units.chunks.iter().flatten().enumerate() {
                    entries.push(entry(UnitRole::Chunk(index), &chunk.unit));
                }
                entries.push(entry(UnitRole::Join, &units.join));
            }
        }
        entries
    }

    /// Producer forks whose outputs are needed to evaluate `bindings` for the
    /// fork at `permutation`.
    pub fn required_forks<'a>(
        &self,
        bindings: impl IntoIterator<Item = &'a Resolved>,
        permutation: &Permutation,
    ) -> Vec<(NodeId, usize)> {
        let mut nodes = BTreeSet::new();
        let mut sweeps = BTreeSet::new();
        for resolved in bindings {
            resolved.collect(&mut nodes, &mut sweeps);
        }
        nodes
            .into_iter()
            .filter_map(|node| {
                self.matching_fork(node, permutation)
                    .map(|fork| (node, fork.index))
            })
            .collect()
    }

    /// Evaluates a binding for one fork. `outs` holds the `_outs` of every
    /// fork returned by [`Graph::required_forks`].
    pub fn evaluate(
        &self,
        resolved: &Resolved,
        permutation: &Permutation,
        outs: &HashMap<(NodeId, usize), ArgumentMap>,
    ) -> ArgValue {
        match resolved {
            Resolved::Value(value) => value.clone(),
            Resolved::Sweep { id, values } => permutation
                .get(id)
                .and_then(|index| values.get(*index))
                .cloned()
                .unwrap_or(ArgValue::Null),
            Resolved::Output { node, output } => {
                let Some(fork) = self.matching_fork(*node, permutation) else {
                    return ArgValue::Null;
                };
                let Some(map) = outs.get(&(*node, fork.index)) else {
                    return ArgValue::Null;
                };
                match output {
                    Some(name) => map.get(name).cloned().unwrap_or(ArgValue::Null),
                    None => ArgValue::Map(map.0.clone()),
                }
            }
            Resolved::Array(items) => ArgValue::List(
                items
                    .iter()
                    .map(|item| self.evaluate(item, permutation, outs))
                    .collect(),
            ),
            Resolved::Map(map) => ArgValue::Map(
                map.iter()
                    .map(|(key, item)| (key.clone(), self.evaluate(item, permutation, outs)))
                    .collect(),
            ),
        }
    }

    /// Fixes the chunk set of a fork. A fork that already has chunks keeps
    /// them; returns whether the call changed anything.
    pub fn set_chunks(
        &mut self,
        node: NodeId,
        fork: usize,
        defs: Vec<ArgumentMap>,
        join_def: ArgumentMap,
    ) -> bool {
        let split_stage = self.node(node).stage().is_some_and(|stage| stage.split);
        let Some(fork) = self.nodes[node.0].forks.get_mut(fork) else {
            return false;
        };
        let fork_unit = fork.unit.clone();
        let Some(units) = fork.stage.as_mut() else {
            return false;
        };
        if units.chunks.is_some() {
            return false;
        }
        let chunks = defs
            .into_iter()
            .enumerate()
            .map(|(index, def)| {
                let unit = UnitRef::new(
                    format!("{}.chunk{index}", fork_unit.fqname),
                    fork_unit.path.join(format!("chunk{index}")),
                );
                let unit = if split_stage {
                    unit
                } else {
                    unit.with_files_dir(fork_unit.files_dir.clone())
                };
                ChunkUnit { unit, def }
            })
            .collect();
        units.chunks = Some(chunks);
        units.join_def = join_def;
        true
    }

    pub fn clear_chunks(&mut self, node: NodeId, fork: usize) {
        if let Some(units) = self.nodes[node.0]
            .forks
            .get_mut(fork)
            .and_then(|fork| fork.stage.as_mut())
        {
            units.chunks = None;
            units.join_def = ArgumentMap::new();
        }
    }

    fn link_edges(&mut self) {
        let mut edges = Vec::new();
        for node in &self.nodes {
            let mut refs = BTreeSet::new();
            let mut sweeps = BTreeSet::new();
            for resolved in node.bindings.values().chain(node.returns.values()) {
                resolved.collect(&mut refs, &mut sweeps);
            }
            for producer in refs {
                edges.push((producer, node.id));
            }
        }
        for (producer, consumer) in edges {
            self.nodes[consumer.0].prenodes.insert(producer);
            self.nodes[producer.0].postnodes.insert(consumer);
        }
    }

    fn mark_retained(&mut self) {
        let root = self.root;
        if matches!(self.node(root).kind, NodeKind::Stage(_)) {
            self.nodes[root.0].retained = true;
            return;
        }
        let mut refs = BTreeSet::new();
        let mut sweeps = BTreeSet::new();
        for resolved in self.node(root).returns.values() {
            resolved.collect(&mut refs, &mut sweeps);
        }
        for id in refs {
            self.nodes[id.0].retained = true;
        }
    }

    fn build_forks(&mut self) {
        for node in &mut self.nodes {
            let permutations = permutations(&node.sweep_dims, &self.sweep_sizes);
            node.forks = permutations
                .into_iter()
                .enumerate()
                .map(|(index, permutation)| {
                    let unit = UnitRef::new(
                        format!("{}.fork{index}", node.fqname),
                        node.path.join(format!("fork{index}")),
                    );
                    let stage = match &node.kind {
                        NodeKind::Stage(_) => Some(StageUnits {
                            split: UnitRef::new(
                                format!("{}.split", unit.fqname),
                                unit.path.join("split"),
                            ),
                            join: UnitRef::new(
                                format!("{}.join", unit.fqname),
                                unit.path.join("join"),
                            )
                            .with_files_dir(unit.files_dir.clone()),
                            chunks: None,
                            join_def: ArgumentMap::new(),
                        }),
                        NodeKind::Pipeline(_) => None,
                    };
                    Fork {
                        index,
                        permutation,
                        unit,
                        stage,
                    }
                })
                .collect();
        }
    }
}

/// Cartesian product of the sweep dimensions, first dimension slowest.
fn permutations(dims: &[String], sizes: &BTreeMap<String, usize>) -> Vec<Permutation> {
    let mut out = vec![Permutation::new()];
    for dim in dims {
        let size = sizes.get(dim).copied().unwrap_or(1);
        out = out
            .into_iter()
            .flat_map(|base| {
                (0..size).map(move |index| {
                    let mut next = base.clone();
                    next.insert(dim.clone(), index);
                    next
                })
            })
            .collect();
    }
    out
}

struct Builder<'a> {
    call_graph: &'a CallGraph,
    nodes: Vec<Node>,
    sweep_sizes: BTreeMap<String, usize>,
}

impl Builder<'_> {
    fn add_call(
        &mut self,
        call: &CallDef,
        fqname: String,
        path: PathBuf,
        parent: Option<NodeId>,
        bindings: BTreeMap<String, Resolved>,
    ) -> Result<NodeId, PipestanceError> {
        let callable = self.call_graph.callable(&call.callable).ok_or_else(|| {
            PipestanceError::InvalidGraph(format!("unknown callable '{}'", call.callable))
        })?;
        let id = NodeId(self.nodes.len());
        // volatile and local apply to everything under a pipeline call
        let mut modifiers = call.modifiers;
        if let Some(parent) = parent {
            modifiers.volatile |= self.nodes[parent.0].modifiers.volatile;
            modifiers.local |= self.nodes[parent.0].modifiers.local;
        }
        let kind = match &callable {
            Callable::Stage(stage) => NodeKind::Stage(Arc::new(stage.clone())),
            Callable::Pipeline(pipeline) => NodeKind::Pipeline(Arc::new(pipeline.clone())),
        };
        self.nodes.push(Node {
            id,
            fqname: fqname.clone(),
            name: call.id.clone(),
            path: path.clone(),
            kind,
            modifiers,
            parent,
            children: Vec::new(),
            bindings,
            returns: BTreeMap::new(),
            prenodes: BTreeSet::new(),
            postnodes: BTreeSet::new(),
            preflights: BTreeSet::new(),
            sweep_dims: Vec::new(),
            forks: Vec::new(),
            retained: false,
        });

        let mut dims = BTreeSet::new();
        if let Callable::Pipeline(pipeline) = &callable {
            let env = self.nodes[id.0].bindings.clone();
            let mut siblings: BTreeMap<String, NodeId> = BTreeMap::new();
            for child in topo_order(pipeline)? {
                let child_fqname = format!("{fqname}.{}", child.id);
                let mut child_bindings = BTreeMap::new();
                for (name, expr) in &child.bindings {
                    let resolved =
                        self.resolve(expr, &format!("{child_fqname}.{name}"), &env, &siblings)?;
                    child_bindings.insert(name.clone(), resolved);
                }
                let child_id = self.add_call(
                    child,
                    child_fqname,
                    path.join(&child.id),
                    Some(id),
                    child_bindings,
                )?;
                siblings.insert(child.id.clone(), child_id);
                self.nodes[id.0].children.push(child_id);
                dims.extend(self.nodes[child_id.0].sweep_dims.iter().cloned());
            }

            let preflights: Vec<NodeId> = pipeline
                .calls
                .iter()
                .filter(|child| child.modifiers.preflight)
                .filter_map(|child| siblings.get(&child.id).copied())
                .collect();
            for &sibling in siblings.values() {
                if self.nodes[sibling.0].modifiers.preflight {
                    continue;
                }
                self.nodes[sibling.0]
                    .preflights
                    .extend(preflights.iter().copied());
            }

            let mut returns = BTreeMap::new();
            for (name, expr) in &pipeline.returns {
                let resolved =
                    self.resolve(expr, &format!("{fqname}.return.{name}"), &env, &siblings)?;
                returns.insert(name.clone(), resolved);
            }
            self.nodes[id.0].returns = returns;
        }

        let mut refs = BTreeSet::new();
        let mut sweeps = BTreeSet::new();
        let node = &self.nodes[id.0];
        for resolved in node.bindings.values().chain(node.returns.values()) {
            resolved.collect(&mut refs, &mut sweeps);
        }
        dims.extend(sweeps);
        for producer in refs {
            dims.extend(self.nodes[producer.0].sweep_dims.iter().cloned());
        }
        self.nodes[id.0].sweep_dims = dims.into_iter().collect();
        Ok(id)
    }

    fn resolve(
        &mut self,
        expr: &BindingExpr,
        sweep_id: &str,
        env: &BTreeMap<String, Resolved>,
        siblings: &BTreeMap<String, NodeId>,
    ) -> Result<Resolved, PipestanceError> {
        Ok(match expr {
            BindingExpr::Value(value) => Resolved::Value(ArgValue::from_json(value.clone())),
            BindingExpr::Sweep(values) => {
                if values.is_empty() {
                    return Err(PipestanceError::InvalidGraph(format!(
                        "sweep {sweep_id} has no values"
                    )));
                }
                self.sweep_sizes.insert(sweep_id.to_string(), values.len());
                Resolved::Sweep {
                    id: sweep_id.to_string(),
                    values: values.iter().cloned().map(ArgValue::from_json).collect(),
                }
            }
            BindingExpr::SelfRef(name) => env.get(name).cloned().ok_or_else(|| {
                PipestanceError::InvalidGraph(format!("unbound pipeline input '{name}'"))
            })?,
            BindingExpr::Output { call, output } => {
                let node = *siblings.get(call).ok_or_else(|| {
                    PipestanceError::InvalidGraph(format!("reference to unknown call '{call}'"))
                })?;
                match &self.nodes[node.0].kind {
                    NodeKind::Stage(_) => Resolved::Output {
                        node,
                        output: output.clone(),
                    },
                    NodeKind::Pipeline(_) => {
                        let returns = &self.nodes[node.0].returns;
                        match output {
                            Some(name) => returns.get(name).cloned().ok_or_else(|| {
                                PipestanceError::InvalidGraph(format!(
                                    "pipeline call '{call}' has no output '{name}'"
                                ))
                            })?,
                            None => Resolved::Map(returns.clone()),
                        }
                    }
                }
            }
            BindingExpr::Array(items) => Resolved::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(index, item)| {
                        self.resolve(item, &format!("{sweep_id}.{index}"), env, siblings)
                    })
                    .collect::<Result<_, _>>()?,
            ),
        })
    }
}

/// Orders sibling calls so producers precede consumers, keeping declaration
/// order among independent calls.
fn topo_order(pipeline: &PipelineDef) -> Result<Vec<&CallDef>, PipestanceError> {
    let deps: Vec<BTreeSet<&str>> = pipeline
        .calls
        .iter()
        .map(|call| {
            call.bindings
                .values()
                .flat_map(|expr| expr.leaves())
                .filter_map(|leaf| match leaf {
                    BindingExpr::Output { call, .. } => Some(call.as_str()),
                    _ => None,
                })
                .collect()
        })
        .collect();
    let mut placed: BTreeSet<&str> = BTreeSet::new();
    let mut order = Vec::with_capacity(pipeline.calls.len());
    while order.len() < pipeline.calls.len() {
        let next = pipeline.calls.iter().enumerate().find(|(index, call)| {
            !placed.contains(call.id.as_str())
                && deps[*index].iter().all(|dep| placed.contains(dep))
        });
        let Some((_, call)) = next else {
            return Err(PipestanceError::InvalidGraph(format!(
                "pipeline {} has a dependency cycle",
                pipeline.id
            )));
        };
        placed.insert(call.id.as_str());
        order.push(call);
    }
    Ok(order)
}
