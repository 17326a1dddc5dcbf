use crate::callgraph::{CallGraphCompiler, JsonCallGraphCompiler};
use crate::config::{EngineConfig, VdrMode};
use crate::errors::PipestanceError;
use crate::events::{PipestanceEvent, RuntimeEventSink, UnitEvent};
use crate::graph::{Graph, NodeId, UnitEntry, UnitRole};
use crate::invocation::{
    InvocationRecord, read_invocation, read_job_mode, validate_psid, write_invocation,
};
use crate::lock::{acquire_lock, release_lock};
use crate::queries::{self, FatalError, NodeInfo};
use crate::retry::{FailureClassifier, RegexFailureClassifier};
use crate::shutdown::ShutdownContext;
use crate::state::{PipestanceState, Snapshot, pipestance_state};
use pipestance_sched::{
    HostLoadSource, LocalScheduler, RemoteScheduler, ResourcePool, SharedScheduler, host,
};
use pipestance_store::{
    FsMetadataStore, JobInfo, MetadataFile, MetadataStoreError, ReclaimedFiles,
    SharedMetadataStore, UnitRef, UnitState, read_json, write_json,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

/// Mutable engine state, guarded by one lock so a refresh and the step that
/// acts on it never interleave with another cycle.
pub(crate) struct EngineState {
    pub(crate) graph: Graph,
    pub(crate) snapshot: Snapshot,
    pub(crate) last_states: HashMap<String, UnitState>,
    /// Units handed to a scheduler by this engine and not yet observed past
    /// `queued`.
    pub(crate) submitted: HashSet<String>,
}

#[derive(Clone)]
pub(crate) struct Schedulers {
    pub(crate) default: SharedScheduler,
    pub(crate) local: SharedScheduler,
}

impl Schedulers {
    pub(crate) fn for_call(&self, local: bool) -> &SharedScheduler {
        if local { &self.local } else { &self.default }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CycleOutcome {
    Running,
    Complete,
    Failed(FatalError),
}

#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    Complete,
    Failed(FatalError),
    Killed,
}

/// Builds pipestances that share one store, compiler and event sink.
pub struct PipestanceFactory {
    config: EngineConfig,
    store: SharedMetadataStore,
    compiler: Arc<dyn CallGraphCompiler>,
    events: RuntimeEventSink,
    classifier: Option<Arc<dyn FailureClassifier>>,
    scheduler: Option<SharedScheduler>,
    local_scheduler: Option<SharedScheduler>,
    /// Host capacity shared by the local schedulers of every pipestance this
    /// factory builds.
    local_pool: OnceCell<ResourcePool>,
}

impl PipestanceFactory {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: Arc::new(FsMetadataStore::new()),
            compiler: Arc::new(JsonCallGraphCompiler),
            events: RuntimeEventSink::default(),
            classifier: None,
            scheduler: None,
            local_scheduler: None,
            local_pool: OnceCell::new(),
        }
    }

    pub fn with_store(mut self, store: SharedMetadataStore) -> Self {
        self.store = store;
        self
    }

    pub fn with_compiler(mut self, compiler: Arc<dyn CallGraphCompiler>) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn with_events(mut self, events: RuntimeEventSink) -> Self {
        self.events = events;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Replaces the scheduler the job mode would select.
    pub fn with_scheduler(mut self, scheduler: SharedScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Scheduler for calls marked `local`.
    pub fn with_local_scheduler(mut self, scheduler: SharedScheduler) -> Self {
        self.local_scheduler = Some(scheduler);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedMetadataStore {
        &self.store
    }

    /// Local core/memory pool, once a pipestance has needed it.
    pub fn local_pool(&self) -> Option<&ResourcePool> {
        self.local_pool.get()
    }

    /// Creates a new pipestance at `path`. Invoking again with the identical
    /// source reattaches; any other source is an invocation mismatch and the
    /// existing pipestance is left untouched.
    pub async fn invoke(
        &self,
        source: &str,
        psid: &str,
        path: &Path,
    ) -> Result<Pipestance, PipestanceError> {
        validate_psid(psid)?;
        let call_graph = self.compiler.compile(source)?;
        let root = root_unit(psid, path);
        if let Some(record) = read_invocation(self.store.as_ref(), &root).await? {
            if !record.matches(psid, source) {
                return Err(PipestanceError::InvocationMismatch {
                    path: path.to_path_buf(),
                });
            }
            info!(psid, path = %path.display(), "invocation matches existing pipestance");
            return self.reattach(psid, path).await;
        }
        if dir_has_entries(path).await? {
            return Err(PipestanceError::AlreadyExists {
                path: path.to_path_buf(),
            });
        }

        let graph = Graph::build(&call_graph, psid, path)?;
        let schedulers = self.schedulers().await?;
        let classifier = self.classifier()?;
        self.store.ensure_unit(&root).await?;
        acquire_lock(self.store.as_ref(), &root).await?;
        let record = InvocationRecord::new(
            psid,
            source,
            serde_json::to_value(&call_graph.call.bindings).unwrap_or_default(),
            self.config.versions.clone(),
            schedulers.default.mode().label(),
        );
        if let Err(err) = write_invocation(self.store.as_ref(), &root, &record).await {
            let _ = release_lock(self.store.as_ref(), &root).await;
            return Err(err.into());
        }
        info!(psid, path = %path.display(), nodes = graph.nodes().count(), "invoked pipestance");
        let pipestance = self.assemble(psid, path, root, graph, schedulers, classifier);
        self.events.pipestance(PipestanceEvent::Started {
            psid: psid.to_string(),
            path: path.display().to_string(),
        });
        {
            let mut state = pipestance.state.lock().await;
            pipestance.refresh_locked(&mut state).await;
        }
        Ok(pipestance)
    }

    /// Rebuilds the graph of an existing pipestance from its invocation
    /// record and reconstructs state from metadata alone.
    pub async fn reattach(&self, psid: &str, path: &Path) -> Result<Pipestance, PipestanceError> {
        validate_psid(psid)?;
        let root = root_unit(psid, path);
        let Some(record) = read_invocation(self.store.as_ref(), &root).await? else {
            return Err(PipestanceError::NotPipestance {
                path: path.to_path_buf(),
            });
        };
        if record.psid != psid {
            return Err(PipestanceError::InvocationMismatch {
                path: path.to_path_buf(),
            });
        }
        let schedulers = self.schedulers().await?;
        let requested = schedulers.default.mode().label();
        let recorded = read_job_mode(self.store.as_ref(), &root, &record).await?;
        if recorded != requested {
            return Err(PipestanceError::JobModeMismatch {
                recorded,
                requested,
            });
        }
        let call_graph = self.compiler.compile(&record.source)?;
        let graph = Graph::build(&call_graph, psid, path)?;
        let classifier = self.classifier()?;
        acquire_lock(self.store.as_ref(), &root).await?;

        let pipestance = self.assemble(psid, path, root, graph, schedulers, classifier);
        pipestance.recover().await;
        info!(psid, path = %path.display(), "reattached pipestance");
        self.events.pipestance(PipestanceEvent::Reattached {
            psid: psid.to_string(),
            path: path.display().to_string(),
        });
        Ok(pipestance)
    }

    async fn schedulers(&self) -> Result<Schedulers, PipestanceError> {
        let local: SharedScheduler = match &self.local_scheduler {
            Some(local) => Arc::clone(local),
            None => {
                let pool = self
                    .local_pool
                    .get_or_try_init(|| async { LocalScheduler::pool_for(&self.config.local) })
                    .await?
                    .clone();
                Arc::new(LocalScheduler::with_parts(
                    Arc::clone(&self.store),
                    self.config.local.clone(),
                    pool,
                    Arc::new(HostLoadSource),
                ))
            }
        };
        let default: SharedScheduler = match (&self.scheduler, self.config.remote_scheduler_config())
        {
            (Some(scheduler), _) => Arc::clone(scheduler),
            (None, None) => Arc::clone(&local),
            (None, Some(remote)) => {
                Arc::new(RemoteScheduler::new(Arc::clone(&self.store), remote).await?)
            }
        };
        Ok(Schedulers { default, local })
    }

    fn classifier(&self) -> Result<Arc<dyn FailureClassifier>, PipestanceError> {
        match &self.classifier {
            Some(classifier) => Ok(Arc::clone(classifier)),
            None => Ok(Arc::new(RegexFailureClassifier::new(
                &self.config.retry.transient_patterns,
            )?)),
        }
    }

    fn assemble(
        &self,
        psid: &str,
        path: &Path,
        root: UnitRef,
        graph: Graph,
        schedulers: Schedulers,
        classifier: Arc<dyn FailureClassifier>,
    ) -> Pipestance {
        Pipestance {
            psid: psid.to_string(),
            path: path.to_path_buf(),
            root,
            config: self.config.clone(),
            store: Arc::clone(&self.store),
            schedulers,
            events: self.events.clone(),
            classifier,
            shutdown: ShutdownContext::new(),
            locked: AtomicBool::new(true),
            state: Mutex::new(EngineState {
                graph,
                snapshot: Snapshot::default(),
                last_states: HashMap::new(),
                submitted: HashSet::new(),
            }),
        }
    }
}

fn root_unit(psid: &str, path: &Path) -> UnitRef {
    UnitRef::new(format!("ID.{psid}"), path).with_files_dir(path)
}

async fn dir_has_entries(path: &Path) -> Result<bool, PipestanceError> {
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(MetadataStoreError::io(path, err).into()),
    };
    entries
        .next_entry()
        .await
        .map(|entry| entry.is_some())
        .map_err(|err| MetadataStoreError::io(path, err).into())
}

/// One pipestance owned by this engine.
pub struct Pipestance {
    pub(crate) psid: String,
    pub(crate) path: PathBuf,
    pub(crate) root: UnitRef,
    pub(crate) config: EngineConfig,
    pub(crate) store: SharedMetadataStore,
    pub(crate) schedulers: Schedulers,
    pub(crate) events: RuntimeEventSink,
    pub(crate) classifier: Arc<dyn FailureClassifier>,
    pub(crate) shutdown: ShutdownContext,
    /// Whether this instance holds `_lock`. Stepping and resets take it back
    /// after a failed run or an explicit unlock released it.
    pub(crate) locked: AtomicBool,
    pub(crate) state: Mutex<EngineState>,
}

impl Pipestance {
    pub fn psid(&self) -> &str {
        &self.psid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Cancel this context to stop [`Pipestance::run`] between cycles.
    pub fn shutdown_context(&self) -> &ShutdownContext {
        &self.shutdown
    }

    /// Re-reads every unit's metadata.
    pub async fn refresh(&self) {
        let mut state = self.state.lock().await;
        self.refresh_locked(&mut state).await;
    }

    /// Aggregate state as of the last refresh.
    pub async fn state(&self) -> PipestanceState {
        let state = self.state.lock().await;
        pipestance_state(&state.graph, &state.snapshot)
    }

    /// State of one unit or fork as of the last refresh.
    pub async fn unit_state(&self, fqname: &str) -> Option<UnitState> {
        let state = self.state.lock().await;
        state
            .graph
            .unit_entries()
            .into_iter()
            .find(|entry| entry.unit.fqname == fqname)
            .and_then(|entry| state.snapshot.state(&entry.unit))
    }

    /// Node tree with per-fork and per-unit states, for dashboards.
    pub async fn serialize_state(&self) -> NodeInfo {
        let state = self.state.lock().await;
        queries::node_info(&state.graph, &state.snapshot, state.graph.root())
    }

    pub async fn fatal_error(&self) -> Result<Option<FatalError>, PipestanceError> {
        let state = self.state.lock().await;
        Ok(queries::fatal_error(self.store.as_ref(), &state.graph, &state.snapshot).await?)
    }

    /// One refresh and, unless the pipestance is terminal, one step.
    pub async fn cycle(&self) -> Result<CycleOutcome, PipestanceError> {
        let mut state = self.state.lock().await;
        self.refresh_locked(&mut state).await;
        match pipestance_state(&state.graph, &state.snapshot) {
            PipestanceState::Complete => {
                if self.config.vdr_mode != VdrMode::Disable {
                    self.vdr_locked(&state).await;
                }
                self.archive_locked(&state).await?;
                self.release().await?;
                info!(psid = %self.psid, "pipestance complete");
                self.events.pipestance(PipestanceEvent::Completed {
                    psid: self.psid.clone(),
                });
                Ok(CycleOutcome::Complete)
            }
            PipestanceState::Failed => {
                let fatal = queries::fatal_error(self.store.as_ref(), &state.graph, &state.snapshot)
                    .await?
                    .unwrap_or_else(|| FatalError {
                        fqname: state.graph.node(state.graph.root()).fqname.clone(),
                        kind: pipestance_store::FailureKind::Execution,
                        summary: "pipestance failed".to_string(),
                        log_path: None,
                        stderr_tail: None,
                    });
                Ok(CycleOutcome::Failed(fatal))
            }
            PipestanceState::Running => {
                if self.shutdown.is_shutting_down() {
                    return Ok(CycleOutcome::Running);
                }
                self.ensure_locked().await?;
                self.check_heartbeats(&state).await;
                self.step_locked(&mut state).await;
                if self.config.vdr_mode == VdrMode::Rolling {
                    self.vdr_locked(&state).await;
                }
                Ok(CycleOutcome::Running)
            }
        }
    }

    /// Cycles until the pipestance completes, fails past its retry budget, or
    /// is shut down.
    pub async fn run(&self) -> Result<RunOutcome, PipestanceError> {
        let retry = &self.config.retry;
        let mut attempt = 0u32;
        loop {
            if self.shutdown.is_shutting_down() {
                return Ok(RunOutcome::Killed);
            }
            match self.cycle().await? {
                CycleOutcome::Complete => return Ok(RunOutcome::Complete),
                CycleOutcome::Failed(fatal) => {
                    let transient = self.classifier.is_transient(
                        fatal.kind,
                        &fatal.summary,
                        fatal.stderr_tail.as_deref().unwrap_or_default(),
                    );
                    let will_retry = transient && retry.has_budget(attempt);
                    warn!(
                        psid = %self.psid,
                        fqname = %fatal.fqname,
                        kind = fatal.kind.as_str(),
                        will_retry,
                        "pipestance failed"
                    );
                    self.events.pipestance(PipestanceEvent::Failed {
                        psid: self.psid.clone(),
                        fqname: fatal.fqname.clone(),
                        classification: fatal.kind.as_str().to_string(),
                        will_retry,
                    });
                    if !will_retry {
                        self.release().await?;
                        return Ok(RunOutcome::Failed(fatal));
                    }
                    attempt += 1;
                    let delay = retry.backoff.delay(attempt, u64::from(host::current_pid()));
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    self.events.pipestance(PipestanceEvent::Retrying {
                        psid: self.psid.clone(),
                        attempt,
                        delay_ms,
                    });
                    info!(psid = %self.psid, attempt, delay_ms, "retrying transient failure");
                    if !self.pause(delay).await {
                        return Ok(RunOutcome::Killed);
                    }
                    self.reset().await?;
                }
                CycleOutcome::Running => {
                    if !self.pause(self.config.step_interval()).await {
                        return Ok(RunOutcome::Killed);
                    }
                }
            }
        }
    }

    /// Sleeps unless shutdown starts first. Returns false on shutdown.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.token().cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Moves every failed unit back to waiting. Returns the number of units
    /// reset.
    pub async fn reset(&self) -> Result<usize, PipestanceError> {
        let mut state = self.state.lock().await;
        self.ensure_locked().await?;
        self.refresh_locked(&mut state).await;
        let count = self.reset_failed(&mut state, |_| true).await?;
        self.refresh_locked(&mut state).await;
        Ok(count)
    }

    /// Resets the failed units at or below `fqname`, which may name a node,
    /// a fork, or a single unit.
    pub async fn restart_from_failed(&self, fqname: &str) -> Result<usize, PipestanceError> {
        let mut state = self.state.lock().await;
        let prefix = format!("{fqname}.");
        let matches =
            |entry: &UnitEntry| entry.unit.fqname == fqname || entry.unit.fqname.starts_with(&prefix);
        let known = state.graph.find(fqname).is_some()
            || state.graph.unit_entries().iter().any(|entry| matches(entry));
        if !known {
            return Err(PipestanceError::UnknownUnit(fqname.to_string()));
        }
        self.ensure_locked().await?;
        self.refresh_locked(&mut state).await;
        let count = self.reset_failed(&mut state, matches).await?;
        self.refresh_locked(&mut state).await;
        Ok(count)
    }

    pub(crate) async fn reset_failed(
        &self,
        state: &mut EngineState,
        filter: impl Fn(&UnitEntry) -> bool,
    ) -> Result<usize, PipestanceError> {
        let failed: Vec<UnitEntry> = state
            .graph
            .unit_entries()
            .into_iter()
            .filter(|entry| filter(entry))
            .filter(|entry| state.snapshot.state(&entry.unit) == Some(UnitState::Failed))
            .collect();
        let mut whole_forks: BTreeSet<(NodeId, usize)> = BTreeSet::new();
        let mut singles = Vec::new();
        for entry in failed {
            match entry.role {
                UnitRole::Fork | UnitRole::Split => {
                    whole_forks.insert((entry.node, entry.fork));
                }
                UnitRole::Chunk(_) | UnitRole::Join if self.config.full_stage_reset => {
                    whole_forks.insert((entry.node, entry.fork));
                }
                UnitRole::Chunk(_) | UnitRole::Join => singles.push(entry),
            }
        }

        let mut count = 0;
        for &(node, fork) in &whole_forks {
            count += self.reset_fork(state, node, fork).await?;
        }
        for entry in singles {
            if whole_forks.contains(&(entry.node, entry.fork)) {
                continue;
            }
            let Some(_section) = self.shutdown.enter() else {
                break;
            };
            self.store.reset_unit(&entry.unit).await?;
            state.submitted.remove(&entry.unit.fqname);
            info!(fqname = %entry.unit.fqname, "reset failed unit");
            self.events.unit(UnitEvent::Reset {
                fqname: entry.unit.fqname.clone(),
            });
            count += 1;
        }
        Ok(count)
    }

    /// Drops a fork back to its initial state, discarding its chunks.
    async fn reset_fork(
        &self,
        state: &mut EngineState,
        node: NodeId,
        fork_index: usize,
    ) -> Result<usize, PipestanceError> {
        let Some(_section) = self.shutdown.enter() else {
            return Ok(0);
        };
        let Some(fork) = state.graph.node(node).forks.get(fork_index).cloned() else {
            return Ok(0);
        };
        if let Some(units) = &fork.stage {
            for chunk in units.chunks.iter().flatten() {
                self.store.remove_tree(&chunk.unit.path).await?;
                state.submitted.remove(&chunk.unit.fqname);
            }
            for unit in [&units.split, &units.join] {
                self.store.reset_unit(unit).await?;
                state.submitted.remove(&unit.fqname);
            }
            state.graph.clear_chunks(node, fork_index);
        }
        self.store.reset_unit(&fork.unit).await?;
        info!(fqname = %fork.unit.fqname, "reset fork");
        self.events.unit(UnitEvent::Reset {
            fqname: fork.unit.fqname.clone(),
        });
        Ok(1)
    }

    pub async fn unlock(&self) -> Result<(), PipestanceError> {
        self.release().await
    }

    /// Whether this instance currently holds the pipestance lock.
    pub fn holds_lock(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Re-takes `_lock` if this instance gave it up. Fails with
    /// [`PipestanceError::Locked`] when another engine took it meanwhile.
    async fn ensure_locked(&self) -> Result<(), PipestanceError> {
        if self.locked.load(Ordering::SeqCst) {
            return Ok(());
        }
        acquire_lock(self.store.as_ref(), &self.root).await?;
        self.locked.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn release(&self) -> Result<(), PipestanceError> {
        if self.locked.swap(false, Ordering::SeqCst) {
            release_lock(self.store.as_ref(), &self.root).await?;
        }
        Ok(())
    }

    /// Records the serialized state tree as `_finalstate`.
    pub async fn archive_head(&self) -> Result<(), PipestanceError> {
        let state = self.state.lock().await;
        self.archive_locked(&state).await
    }

    pub async fn unarchive(&self) -> Result<(), PipestanceError> {
        self.store
            .remove(&self.root, MetadataFile::FinalState)
            .await?;
        Ok(())
    }

    async fn archive_locked(&self, state: &EngineState) -> Result<(), PipestanceError> {
        let info = queries::node_info(&state.graph, &state.snapshot, state.graph.root());
        write_json(self.store.as_ref(), &self.root, MetadataFile::FinalState, &info).await?;
        debug!(psid = %self.psid, "archived final state");
        Ok(())
    }

    /// Stops stepping, cancels every job and releases the lock.
    pub async fn kill(&self, reason: &str) -> Result<(), PipestanceError> {
        warn!(psid = %self.psid, reason, "killing pipestance");
        self.shutdown.shutdown().await;
        self.schedulers.default.kill(reason).await;
        if !Arc::ptr_eq(&self.schedulers.default, &self.schedulers.local) {
            self.schedulers.local.kill(reason).await;
        }
        self.events.pipestance(PipestanceEvent::Killed {
            psid: self.psid.clone(),
            reason: reason.to_string(),
        });
        self.release().await
    }

    /// Reattach-time recovery: restore chunk sets from split metadata and,
    /// in local mode, reset units whose jobs died with the previous engine.
    async fn recover(&self) {
        let mut state = self.state.lock().await;
        self.restore_chunks(&mut state).await;
        self.refresh_locked(&mut state).await;
        if self.schedulers.default.mode().is_local() {
            self.recover_orphans(&mut state).await;
            self.refresh_locked(&mut state).await;
        }
    }

    async fn recover_orphans(&self, state: &mut EngineState) {
        let hostname = host::hostname();
        for entry in state.graph.unit_entries() {
            let Some(snapshot) = state.snapshot.get(&entry.unit) else {
                continue;
            };
            let orphaned = match snapshot.state {
                UnitState::Queued => !snapshot.markers.contains(&MetadataFile::JobId),
                UnitState::Running => {
                    match read_json::<JobInfo>(self.store.as_ref(), &entry.unit, MetadataFile::JobInfo)
                        .await
                    {
                        Ok(Some(info)) => {
                            info.host.as_deref() == Some(hostname.as_str())
                                && info.pid.is_some_and(|pid| !host::pid_alive(pid))
                        }
                        _ => false,
                    }
                }
                _ => false,
            };
            if !orphaned {
                continue;
            }
            warn!(fqname = %entry.unit.fqname, state = %snapshot.state, "resetting orphaned unit");
            if let Err(err) = self.store.reset_unit(&entry.unit).await {
                warn!(fqname = %entry.unit.fqname, error = %err, "orphan reset failed");
                continue;
            }
            self.events.unit(UnitEvent::Reset {
                fqname: entry.unit.fqname.clone(),
            });
        }
    }

    pub async fn vdr_report(&self) -> Result<ReclaimedFiles, PipestanceError> {
        let state = self.state.lock().await;
        let mut report = ReclaimedFiles::default();
        for node in state.graph.nodes() {
            for fork in &node.forks {
                let recorded: Option<ReclaimedFiles> =
                    read_json(self.store.as_ref(), &fork.unit, MetadataFile::VdrKill).await?;
                if let Some(recorded) = recorded {
                    report.merge(recorded);
                }
            }
        }
        Ok(report)
    }
}
