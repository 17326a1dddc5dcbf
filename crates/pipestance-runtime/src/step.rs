//! Refresh and step passes over the unit graph.
//!
//! A refresh reads every unit's markers into a fresh [`Snapshot`]. A step
//! then advances units strictly from that snapshot: a consumer is launched
//! only when its producers were complete in the same refresh.

use crate::callgraph::StageDef;
use crate::errors::PipestanceError;
use crate::events::UnitEvent;
use crate::graph::{ChunkUnit, Fork, NodeId, NodeKind, StageUnits};
use crate::pipestance::{EngineState, Pipestance};
use crate::state::{Snapshot, UnitSnapshot, node_state};
use crate::value::{ArgValue, ArgumentMap};
use futures::StreamExt;
use futures::stream;
use pipestance_sched::{JobRequest, SchedulerError};
use pipestance_store::{
    FailureKind, MetadataFile, UnitFailure, UnitRef, UnitState, derive_state, read_json,
    write_failure, write_json,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Optional richer split output: per-chunk definitions plus join overrides.
#[derive(Debug, Default, Deserialize)]
struct StageDefs {
    #[serde(default)]
    chunks: Vec<Value>,
    #[serde(default)]
    join: Option<Value>,
}

/// Producer outputs needed by one fork.
enum Inputs {
    Pending,
    Ready(HashMap<(NodeId, usize), ArgumentMap>),
    Unreadable(String),
}

const CHUNK_THREADS_KEY: &str = "__threads";
const CHUNK_MEM_GB_KEY: &str = "__mem_gb";

fn resource_hint(def: &ArgumentMap, key: &str) -> Option<u32> {
    match def.get(key)? {
        ArgValue::Int(value) => u32::try_from(*value).ok().filter(|value| *value > 0),
        ArgValue::Float(value) if *value > 0.0 => Some(value.ceil() as u32),
        _ => None,
    }
}

impl Pipestance {
    pub(crate) async fn refresh_locked(&self, state: &mut EngineState) {
        let store = self.store.as_ref();
        let listed: Vec<_> = stream::iter(state.graph.unit_entries())
            .map(|entry| async move {
                let markers = store.list(&entry.unit).await;
                (entry.unit, markers)
            })
            .buffer_unordered(self.config.resolved_refresh_parallelism())
            .collect()
            .await;

        let mut snapshot = Snapshot::default();
        for (unit, markers) in listed {
            let markers = match markers {
                Ok(markers) => markers,
                Err(err) => {
                    warn!(fqname = %unit.fqname, error = %err, "could not read unit metadata");
                    continue;
                }
            };
            let unit_state = derive_state(|file| markers.contains(&file));
            let previous = state.last_states.insert(unit.fqname.clone(), unit_state);
            if previous != Some(unit_state) {
                debug!(
                    fqname = %unit.fqname,
                    from = ?previous,
                    to = %unit_state,
                    "unit state changed"
                );
                self.events.unit(UnitEvent::StateChanged {
                    fqname: unit.fqname.clone(),
                    from: previous.map(|state| state.as_str().to_string()),
                    to: unit_state.as_str().to_string(),
                });
            }
            if unit_state != UnitState::Queued {
                state.submitted.remove(&unit.fqname);
            }
            snapshot.insert(
                unit.fqname,
                UnitSnapshot {
                    state: unit_state,
                    markers,
                },
            );
        }
        state.snapshot = snapshot;
    }

    /// Fails running units whose heartbeat went stale.
    pub(crate) async fn check_heartbeats(&self, state: &EngineState) {
        let timeout = self.config.heartbeat_timeout();
        let store = self.store.as_ref();
        let running: Vec<UnitRef> = state
            .graph
            .unit_entries()
            .into_iter()
            .filter(|entry| state.snapshot.state(&entry.unit) == Some(UnitState::Running))
            .map(|entry| entry.unit)
            .collect();
        let idle: Vec<(UnitRef, Option<Duration>)> = stream::iter(running)
            .map(|unit| async move {
                let mut last = None;
                for file in [MetadataFile::Heartbeat, MetadataFile::JobInfo, MetadataFile::Log] {
                    match store.modified_at(&unit, file).await {
                        Ok(Some(modified)) => {
                            last = Some(modified);
                            break;
                        }
                        Ok(None) => {}
                        Err(err) => {
                            debug!(fqname = %unit.fqname, error = %err, "heartbeat read failed");
                        }
                    }
                }
                let idle = last.and_then(|modified| SystemTime::now().duration_since(modified).ok());
                (unit, idle)
            })
            .buffer_unordered(self.config.resolved_refresh_parallelism())
            .collect()
            .await;

        for (unit, idle) in idle {
            let Some(idle) = idle.filter(|idle| *idle > timeout) else {
                continue;
            };
            warn!(
                fqname = %unit.fqname,
                idle_secs = idle.as_secs(),
                "heartbeat expired; failing unit"
            );
            let failure = UnitFailure::new(
                FailureKind::Timeout,
                format!(
                    "no heartbeat for {}s (timeout {}s); job presumed dead",
                    idle.as_secs(),
                    timeout.as_secs()
                ),
            );
            if let Err(err) = write_failure(store, &unit, &failure).await {
                warn!(fqname = %unit.fqname, error = %err, "could not record timeout");
                continue;
            }
            self.events.unit(UnitEvent::TimedOut {
                fqname: unit.fqname.clone(),
                idle_secs: idle.as_secs(),
            });
        }
    }

    /// Advances every fork whose dependencies were complete in the current
    /// snapshot. Metadata errors are logged and retried next cycle.
    pub(crate) async fn step_locked(&self, state: &mut EngineState) {
        let ids: Vec<NodeId> = state.graph.nodes().map(|node| node.id).collect();
        for id in ids {
            let forks = state.graph.node(id).forks.len();
            for fork in 0..forks {
                if self.shutdown.is_shutting_down() {
                    return;
                }
                let result = match state.graph.node(id).kind {
                    NodeKind::Stage(_) => self.step_stage_fork(state, id, fork).await,
                    NodeKind::Pipeline(_) => self.step_pipeline_fork(state, id, fork).await,
                };
                if let Err(err) = result {
                    warn!(
                        fqname = %state.graph.node(id).fqname,
                        fork,
                        error = %err,
                        "step failed; retrying next cycle"
                    );
                }
            }
        }
    }

    fn steppable(&self, state: &EngineState, unit: &UnitRef) -> bool {
        match state.snapshot.get(unit) {
            Some(UnitSnapshot {
                state: UnitState::Waiting,
                ..
            }) => true,
            Some(UnitSnapshot {
                state: UnitState::Queued,
                markers,
            }) => !markers.contains(&MetadataFile::JobId) && !state.submitted.contains(&unit.fqname),
            _ => false,
        }
    }

    fn gates_open(&self, state: &EngineState, id: NodeId) -> bool {
        state
            .graph
            .gates(id)
            .into_iter()
            .filter(|gate| *gate != id)
            .all(|gate| node_state(&state.graph, &state.snapshot, gate) == UnitState::Complete)
    }

    async fn step_stage_fork(
        &self,
        state: &mut EngineState,
        id: NodeId,
        fork_index: usize,
    ) -> Result<(), PipestanceError> {
        let node = state.graph.node(id);
        let Some(stage) = node.stage().cloned() else {
            return Ok(());
        };
        let fork = node.forks[fork_index].clone();
        let Some(units) = fork.stage.clone() else {
            return Ok(());
        };
        match state.snapshot.state(&fork.unit) {
            Some(fork_state) if !fork_state.is_terminal() => {}
            _ => return Ok(()),
        }
        if !self.gates_open(state, id) {
            return Ok(());
        }

        match state.snapshot.state(&units.split) {
            Some(UnitState::Complete) => {}
            Some(UnitState::Waiting | UnitState::Queued) => {
                if self.steppable(state, &units.split) {
                    self.start_split(state, id, &fork, &stage, &units).await?;
                }
                return Ok(());
            }
            _ => return Ok(()),
        }

        let Some(chunks) = units.chunks.clone() else {
            self.materialize_chunks(state, id, &fork, &units).await?;
            return Ok(());
        };
        let mut chunks_complete = true;
        for chunk in &chunks {
            match state.snapshot.state(&chunk.unit) {
                Some(UnitState::Complete) => {}
                Some(UnitState::Waiting | UnitState::Queued) => {
                    chunks_complete = false;
                    if self.steppable(state, &chunk.unit) {
                        self.start_chunk(state, id, &fork, &stage, chunk).await?;
                    }
                }
                _ => chunks_complete = false,
            }
        }
        if !chunks_complete {
            return Ok(());
        }

        match state.snapshot.state(&units.join) {
            Some(UnitState::Complete) => self.finalize_stage_fork(&fork, &stage, &units).await,
            Some(UnitState::Waiting | UnitState::Queued) if self.steppable(state, &units.join) => {
                self.start_join(state, id, &fork, &stage, &units, &chunks).await
            }
            _ => Ok(()),
        }
    }

    /// Reads the `_outs` of every producer fork the bindings reference.
    async fn gather_inputs(
        &self,
        state: &EngineState,
        required: Vec<(NodeId, usize)>,
    ) -> Result<Inputs, PipestanceError> {
        let mut outs = HashMap::new();
        for (producer, index) in required {
            let producer_fork = &state.graph.node(producer).forks[index];
            if state.snapshot.state(&producer_fork.unit) != Some(UnitState::Complete) {
                return Ok(Inputs::Pending);
            }
            let value = match self
                .store
                .read_value(&producer_fork.unit, MetadataFile::Outs)
                .await
            {
                Ok(value) => value,
                Err(err) if err.is_malformed() => return Ok(Inputs::Unreadable(err.to_string())),
                Err(err) => return Err(err.into()),
            };
            let map = match value.map(ArgumentMap::from_json).transpose() {
                Ok(map) => map.unwrap_or_default(),
                Err(err) => {
                    return Ok(Inputs::Unreadable(format!(
                        "outputs of {}: {err}",
                        producer_fork.unit.fqname
                    )));
                }
            };
            outs.insert((producer, index), map);
        }
        Ok(Inputs::Ready(outs))
    }

    async fn start_split(
        &self,
        state: &mut EngineState,
        id: NodeId,
        fork: &Fork,
        stage: &Arc<StageDef>,
        units: &StageUnits,
    ) -> Result<(), PipestanceError> {
        let node = state.graph.node(id);
        let required = state
            .graph
            .required_forks(node.bindings.values(), &fork.permutation);
        let outs = match self.gather_inputs(state, required).await? {
            Inputs::Pending => return Ok(()),
            Inputs::Unreadable(reason) => {
                return self
                    .fail_unit(&units.split, FailureKind::Execution, reason)
                    .await;
            }
            Inputs::Ready(outs) => outs,
        };
        let args = ArgumentMap(
            node.bindings
                .iter()
                .map(|(name, resolved)| {
                    (
                        name.clone(),
                        state.graph.evaluate(resolved, &fork.permutation, &outs),
                    )
                })
                .collect(),
        );

        let Some(_section) = self.shutdown.enter() else {
            return Ok(());
        };
        if let Err(err) = args.validate(&stage.inputs, false) {
            return self
                .fail_unit(&units.split, FailureKind::Argument, err.to_string())
                .await;
        }
        self.store.ensure_unit(&fork.unit).await?;
        self.store.ensure_unit(&units.split).await?;
        write_json(self.store.as_ref(), &fork.unit, MetadataFile::Args, &args).await?;
        write_json(self.store.as_ref(), &units.split, MetadataFile::Args, &args).await?;
        if stage.split {
            return self
                .launch(state, id, stage, &units.split, "split", 1, None)
                .await;
        }
        write_json(
            self.store.as_ref(),
            &units.split,
            MetadataFile::ChunkDefs,
            &vec![ArgumentMap::new()],
        )
        .await?;
        self.store
            .touch(&units.split, MetadataFile::Complete)
            .await?;
        debug!(fqname = %units.split.fqname, "completed implicit split");
        Ok(())
    }

    /// Chunk definitions and join overrides written by a completed split.
    async fn read_chunk_defs(
        &self,
        split: &UnitRef,
    ) -> Result<(Vec<ArgumentMap>, ArgumentMap), String> {
        let stage_defs: Option<StageDefs> =
            read_json(self.store.as_ref(), split, MetadataFile::StageDefs)
                .await
                .map_err(|err| err.to_string())?;
        let (raw_chunks, raw_join) = match stage_defs {
            Some(defs) => (defs.chunks, defs.join),
            None => {
                let value = self
                    .store
                    .read_value(split, MetadataFile::ChunkDefs)
                    .await
                    .map_err(|err| err.to_string())?;
                match value {
                    Some(Value::Array(items)) => (items, None),
                    Some(_) => return Err("_chunk_defs is not an array".to_string()),
                    None => return Err("split completed without chunk definitions".to_string()),
                }
            }
        };
        let chunks = raw_chunks
            .into_iter()
            .map(ArgumentMap::from_json)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| format!("invalid chunk definition: {err}"))?;
        let join = match raw_join {
            Some(value) => ArgumentMap::from_json(value)
                .map_err(|err| format!("invalid join definition: {err}"))?,
            None => ArgumentMap::new(),
        };
        Ok((chunks, join))
    }

    /// Fixes the chunk set of a fork from its split's output. Chunks become
    /// visible to stepping on the next refresh.
    async fn materialize_chunks(
        &self,
        state: &mut EngineState,
        id: NodeId,
        fork: &Fork,
        units: &StageUnits,
    ) -> Result<(), PipestanceError> {
        match self.read_chunk_defs(&units.split).await {
            Ok((chunks, join)) => {
                let count = chunks.len();
                if state.graph.set_chunks(id, fork.index, chunks, join) {
                    info!(fqname = %fork.unit.fqname, chunks = count, "materialized chunks");
                }
                Ok(())
            }
            Err(reason) => {
                self.fail_unit(&units.split, FailureKind::Execution, reason)
                    .await
            }
        }
    }

    /// Restores chunk sets for every fork whose split already completed.
    pub(crate) async fn restore_chunks(&self, state: &mut EngineState) {
        let mut restored = Vec::new();
        for node in state.graph.nodes() {
            for fork in &node.forks {
                let Some(units) = fork.stage.as_ref() else {
                    continue;
                };
                match self.store.exists(&units.split, MetadataFile::Complete).await {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(err) => {
                        warn!(fqname = %units.split.fqname, error = %err, "could not read split");
                        continue;
                    }
                }
                match self.read_chunk_defs(&units.split).await {
                    Ok((chunks, join)) => restored.push((node.id, fork.index, chunks, join)),
                    Err(reason) => {
                        warn!(fqname = %units.split.fqname, %reason, "could not restore chunks");
                    }
                }
            }
        }
        for (id, fork, chunks, join) in restored {
            state.graph.set_chunks(id, fork, chunks, join);
        }
    }

    /// Arguments recorded on the fork when its split started. An unreadable
    /// record is returned as the inner error so the caller can fail the unit
    /// instead of retrying it every cycle.
    async fn read_fork_args(
        &self,
        fork: &Fork,
    ) -> Result<Result<ArgumentMap, String>, PipestanceError> {
        match read_json::<ArgumentMap>(self.store.as_ref(), &fork.unit, MetadataFile::Args).await {
            Ok(args) => Ok(Ok(args.unwrap_or_default())),
            Err(err) if err.is_malformed() => Ok(Err(format!("fork arguments unreadable: {err}"))),
            Err(err) => Err(err.into()),
        }
    }

    fn chunk_resources(
        &self,
        state: &EngineState,
        id: NodeId,
        stage: &StageDef,
        def: &ArgumentMap,
    ) -> (u32, Option<u32>) {
        let scheduler = self
            .schedulers
            .for_call(state.graph.node(id).modifiers.local);
        let mut threads = resource_hint(def, CHUNK_THREADS_KEY)
            .or(stage.resources.threads)
            .unwrap_or(1)
            .max(1);
        let mut mem_gb = resource_hint(def, CHUNK_MEM_GB_KEY).or(stage.resources.mem_gb);
        if let Some(max) = scheduler.max_cores().filter(|max| threads > *max) {
            debug!(requested = threads, max, "capping chunk threads");
            threads = max;
        }
        if let (Some(max), Some(requested)) = (scheduler.max_mem_gb(), mem_gb) {
            if requested > max {
                debug!(requested, max, "capping chunk memory");
                mem_gb = Some(max);
            }
        }
        (threads, mem_gb)
    }

    async fn start_chunk(
        &self,
        state: &mut EngineState,
        id: NodeId,
        fork: &Fork,
        stage: &Arc<StageDef>,
        chunk: &ChunkUnit,
    ) -> Result<(), PipestanceError> {
        let mut args = match self.read_fork_args(fork).await? {
            Ok(args) => args,
            Err(reason) => {
                return self
                    .fail_unit(&chunk.unit, FailureKind::Argument, reason)
                    .await;
            }
        };
        args.merge(&chunk.def);
        let (threads, mem_gb) = self.chunk_resources(state, id, stage, &chunk.def);
        args.insert(CHUNK_THREADS_KEY, ArgValue::Int(i64::from(threads)));
        if let Some(mem_gb) = mem_gb {
            args.insert(CHUNK_MEM_GB_KEY, ArgValue::Int(i64::from(mem_gb)));
        }
        self.store.ensure_unit(&chunk.unit).await?;
        write_json(self.store.as_ref(), &chunk.unit, MetadataFile::Args, &args).await?;
        self.launch(state, id, stage, &chunk.unit, "main", threads, mem_gb)
            .await
    }

    async fn start_join(
        &self,
        state: &mut EngineState,
        id: NodeId,
        fork: &Fork,
        stage: &Arc<StageDef>,
        units: &StageUnits,
        chunks: &[ChunkUnit],
    ) -> Result<(), PipestanceError> {
        let store = self.store.as_ref();
        self.store.ensure_unit(&units.join).await?;
        if !stage.split {
            let outs = match chunks.first() {
                Some(chunk) => store.read_value(&chunk.unit, MetadataFile::Outs).await,
                None => Ok(None),
            };
            let outs = match outs {
                Ok(outs) => outs.unwrap_or_else(|| Value::Object(Default::default())),
                Err(err) if err.is_malformed() => {
                    return self
                        .fail_unit(&units.join, FailureKind::Execution, err.to_string())
                        .await;
                }
                Err(err) => return Err(err.into()),
            };
            store.write_value(&units.join, MetadataFile::Outs, &outs).await?;
            store.touch(&units.join, MetadataFile::Complete).await?;
            debug!(fqname = %units.join.fqname, "completed implicit join");
            return Ok(());
        }

        let mut chunk_outs = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            match store.read_value(&chunk.unit, MetadataFile::Outs).await {
                Ok(outs) => chunk_outs.push(outs.unwrap_or(Value::Null)),
                Err(err) if err.is_malformed() => {
                    return self
                        .fail_unit(&units.join, FailureKind::Execution, err.to_string())
                        .await;
                }
                Err(err) => return Err(err.into()),
            }
        }
        let mut args = match self.read_fork_args(fork).await? {
            Ok(args) => args,
            Err(reason) => {
                return self
                    .fail_unit(&units.join, FailureKind::Argument, reason)
                    .await;
            }
        };
        args.merge(&units.join_def);
        let defs: Vec<&ArgumentMap> = chunks.iter().map(|chunk| &chunk.def).collect();
        write_json(store, &units.join, MetadataFile::Args, &args).await?;
        write_json(store, &units.join, MetadataFile::ChunkDefs, &defs).await?;
        store
            .write_value(&units.join, MetadataFile::ChunkOuts, &Value::Array(chunk_outs))
            .await?;
        let (threads, mem_gb) = self.chunk_resources(state, id, stage, &units.join_def);
        self.launch(state, id, stage, &units.join, "join", threads, mem_gb)
            .await
    }

    /// Verifies the join's outputs and promotes them to the fork.
    async fn finalize_stage_fork(
        &self,
        fork: &Fork,
        stage: &StageDef,
        units: &StageUnits,
    ) -> Result<(), PipestanceError> {
        let value = match self.store.read_value(&units.join, MetadataFile::Outs).await {
            Ok(value) => value,
            Err(err) if err.is_malformed() => {
                return self
                    .fail_unit(&fork.unit, FailureKind::Execution, err.to_string())
                    .await;
            }
            Err(err) => return Err(err.into()),
        };
        let outs = match value.map(ArgumentMap::from_json).transpose() {
            Ok(outs) => outs.unwrap_or_default(),
            Err(err) => {
                return self
                    .fail_unit(&fork.unit, FailureKind::Argument, err.to_string())
                    .await;
            }
        };
        self.complete_fork(fork, None, outs, &stage.outputs).await
    }

    async fn step_pipeline_fork(
        &self,
        state: &mut EngineState,
        id: NodeId,
        fork_index: usize,
    ) -> Result<(), PipestanceError> {
        let node = state.graph.node(id);
        let fork = node.forks[fork_index].clone();
        match state.snapshot.state(&fork.unit) {
            Some(fork_state) if !fork_state.is_terminal() => {}
            _ => return Ok(()),
        }
        let children_complete = node.children.iter().all(|&child| {
            state
                .graph
                .matching_fork(child, &fork.permutation)
                .is_some_and(|child_fork| {
                    state.snapshot.state(&child_fork.unit) == Some(UnitState::Complete)
                })
        });
        if !children_complete {
            return Ok(());
        }
        let required = state.graph.required_forks(
            node.bindings.values().chain(node.returns.values()),
            &fork.permutation,
        );
        let outs = match self.gather_inputs(state, required).await? {
            Inputs::Pending => return Ok(()),
            Inputs::Unreadable(reason) => {
                return self
                    .fail_unit(&fork.unit, FailureKind::Execution, reason)
                    .await;
            }
            Inputs::Ready(outs) => outs,
        };
        let evaluate = |entries: &std::collections::BTreeMap<String, crate::graph::Resolved>| {
            ArgumentMap(
                entries
                    .iter()
                    .map(|(name, resolved)| {
                        (
                            name.clone(),
                            state.graph.evaluate(resolved, &fork.permutation, &outs),
                        )
                    })
                    .collect(),
            )
        };
        let args = evaluate(&node.bindings);
        let returns = evaluate(&node.returns);
        let outputs = match &node.kind {
            NodeKind::Pipeline(pipeline) => pipeline.outputs.clone(),
            NodeKind::Stage(stage) => stage.outputs.clone(),
        };
        self.complete_fork(&fork, Some(args), returns, &outputs)
            .await
    }

    /// Writes a fork's verified outputs and its completion marker.
    async fn complete_fork(
        &self,
        fork: &Fork,
        args: Option<ArgumentMap>,
        mut outs: ArgumentMap,
        outputs: &[crate::callgraph::Param],
    ) -> Result<(), PipestanceError> {
        let Some(_section) = self.shutdown.enter() else {
            return Ok(());
        };
        for param in outputs {
            if outs.get(&param.name).is_none() {
                outs.insert(param.name.clone(), ArgValue::Null);
            }
        }
        if let Err(err) = outs.validate(outputs, true) {
            return self
                .fail_unit(&fork.unit, FailureKind::Argument, format!("invalid outputs: {err}"))
                .await;
        }
        self.store.ensure_unit(&fork.unit).await?;
        if let Some(args) = &args {
            write_json(self.store.as_ref(), &fork.unit, MetadataFile::Args, args).await?;
        }
        write_json(self.store.as_ref(), &fork.unit, MetadataFile::Outs, &outs).await?;
        self.store.touch(&fork.unit, MetadataFile::Complete).await?;
        info!(fqname = %fork.unit.fqname, "fork complete");
        Ok(())
    }

    /// Hands one split, chunk, or join to its scheduler.
    #[allow(clippy::too_many_arguments)]
    async fn launch(
        &self,
        state: &mut EngineState,
        id: NodeId,
        stage: &StageDef,
        unit: &UnitRef,
        phase: &str,
        threads: u32,
        mem_gb: Option<u32>,
    ) -> Result<(), PipestanceError> {
        let Some(_section) = self.shutdown.enter() else {
            return Ok(());
        };
        let scheduler = self
            .schedulers
            .for_call(state.graph.node(id).modifiers.local);
        self.store.ensure_unit(unit).await?;
        self.store.touch(unit, MetadataFile::QueuedLocally).await?;
        let argv = stage.src.command(phase, &unit.path, &unit.files_dir);
        let request = JobRequest::new(unit.clone(), argv).with_resources(threads, mem_gb);
        match scheduler.enqueue(request).await {
            Ok(()) => {
                state.submitted.insert(unit.fqname.clone());
                info!(fqname = %unit.fqname, phase, threads, mem_gb = ?mem_gb, "submitted job");
                self.events.unit(UnitEvent::Submitted {
                    fqname: unit.fqname.clone(),
                    phase: phase.to_string(),
                    threads,
                    mem_gb,
                });
            }
            Err(SchedulerError::Capacity(reason)) => {
                debug!(fqname = %unit.fqname, %reason, "scheduler at capacity; unit stays queued");
            }
            Err(SchedulerError::Shutdown) => {
                debug!(fqname = %unit.fqname, "scheduler shut down; not submitting");
            }
            Err(err) => {
                return self
                    .fail_unit(
                        unit,
                        FailureKind::Execution,
                        format!("could not submit job: {err}"),
                    )
                    .await;
            }
        }
        Ok(())
    }

    /// Records a failure the engine detected before or instead of a job.
    pub(crate) async fn fail_unit(
        &self,
        unit: &UnitRef,
        kind: FailureKind,
        message: String,
    ) -> Result<(), PipestanceError> {
        warn!(fqname = %unit.fqname, kind = kind.as_str(), %message, "unit failed");
        self.store.ensure_unit(unit).await?;
        write_failure(self.store.as_ref(), unit, &UnitFailure::new(kind, message)).await?;
        Ok(())
    }
}
