#![allow(dead_code)]

use async_trait::async_trait;
use pipestance_runtime::{EngineConfig, Pipestance, PipestanceFactory, VdrMode};
use pipestance_sched::{JobMode, JobRequest, Scheduler, SchedulerResult, SharedScheduler};
use pipestance_store::{
    FailureKind, FsMetadataStore, MetadataFile, MetadataStore, SharedMetadataStore, UnitFailure,
    write_failure,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub type OutsFn = Arc<dyn Fn(&JobRequest, &Value) -> Value + Send + Sync>;

/// Scheduler double that plays the stage side of the exec contract inline.
///
/// Jobs whose fqname contains a held pattern are only recorded. Every other
/// job writes its outputs and `_complete` before `enqueue` returns, so the
/// next refresh observes it finished.
pub struct FakeScheduler {
    store: SharedMetadataStore,
    requests: Mutex<Vec<JobRequest>>,
    held: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, (FailureKind, usize)>>,
    chunk_defs: Mutex<Value>,
    outs: OutsFn,
    killed: Mutex<Option<String>>,
}

impl FakeScheduler {
    pub fn new(store: SharedMetadataStore) -> Self {
        Self {
            store,
            requests: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            chunk_defs: Mutex::new(json!([{}, {}])),
            outs: Arc::new(|_, _| json!({})),
            killed: Mutex::new(None),
        }
    }

    pub fn with_outs(
        mut self,
        outs: impl Fn(&JobRequest, &Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.outs = Arc::new(outs);
        self
    }

    pub fn with_chunk_defs(self, defs: Value) -> Self {
        *self.chunk_defs.lock().expect("chunk defs mutex should lock") = defs;
        self
    }

    pub fn hold(&self, pattern: &str) {
        self.held
            .lock()
            .expect("held mutex should lock")
            .push(pattern.to_string());
    }

    pub fn release_all(&self) {
        self.held.lock().expect("held mutex should lock").clear();
    }

    /// The next `times` jobs matching `pattern` fail with `kind`.
    pub fn fail(&self, pattern: &str, kind: FailureKind, times: usize) {
        self.failures
            .lock()
            .expect("failures mutex should lock")
            .insert(pattern.to_string(), (kind, times));
    }

    pub fn requests(&self) -> Vec<JobRequest> {
        self.requests
            .lock()
            .expect("requests mutex should lock")
            .clone()
    }

    pub fn submitted(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|request| request.unit.fqname)
            .collect()
    }

    pub fn killed(&self) -> Option<String> {
        self.killed.lock().expect("killed mutex should lock").clone()
    }

    fn take_failure(&self, fqname: &str) -> Option<FailureKind> {
        let mut failures = self.failures.lock().expect("failures mutex should lock");
        let (kind, remaining) = failures
            .iter_mut()
            .find(|(pattern, (_, remaining))| fqname.contains(pattern.as_str()) && *remaining > 0)
            .map(|(_, entry)| entry)?;
        *remaining -= 1;
        Some(*kind)
    }

    async fn play(&self, request: &JobRequest) -> SchedulerResult<()> {
        let unit = &request.unit;
        let store = self.store.as_ref();
        let phase = request.argv[request.argv.len() - 3].clone();
        store
            .write_raw(unit, MetadataFile::JobInfo, "{}")
            .await?;
        if let Some(kind) = self.take_failure(&unit.fqname) {
            store
                .write_raw(unit, MetadataFile::StdErr, "stage blew up\nnode preempted\n")
                .await?;
            write_failure(store, unit, &UnitFailure::new(kind, "fake job failed")).await?;
            return Ok(());
        }
        let args = store
            .read_value(unit, MetadataFile::Args)
            .await?
            .unwrap_or(Value::Null);
        if phase == "split" {
            let defs = self
                .chunk_defs
                .lock()
                .expect("chunk defs mutex should lock")
                .clone();
            store
                .write_value(unit, MetadataFile::ChunkDefs, &defs)
                .await?;
        } else {
            tokio::fs::write(unit.files_dir.join(format!("{phase}.dat")), vec![7u8; 64])
                .await
                .map_err(|err| pipestance_store::MetadataStoreError::io(&unit.files_dir, err))?;
            store
                .write_value(unit, MetadataFile::Outs, &(self.outs)(request, &args))
                .await?;
        }
        store.touch(unit, MetadataFile::Complete).await?;
        Ok(())
    }
}

#[async_trait]
impl Scheduler for FakeScheduler {
    fn mode(&self) -> JobMode {
        JobMode::Local
    }

    async fn enqueue(&self, request: JobRequest) -> SchedulerResult<()> {
        self.requests
            .lock()
            .expect("requests mutex should lock")
            .push(request.clone());
        let held = self
            .held
            .lock()
            .expect("held mutex should lock")
            .iter()
            .any(|pattern| request.unit.fqname.contains(pattern.as_str()));
        if held {
            return Ok(());
        }
        self.play(&request).await
    }

    fn max_cores(&self) -> Option<u32> {
        Some(4)
    }

    fn max_mem_gb(&self) -> Option<u32> {
        Some(8)
    }

    async fn kill(&self, reason: &str) {
        *self.killed.lock().expect("killed mutex should lock") = Some(reason.to_string());
    }
}

pub fn store() -> SharedMetadataStore {
    Arc::new(FsMetadataStore::new())
}

pub fn config() -> EngineConfig {
    EngineConfig {
        step_interval_ms: 5,
        refresh_parallelism: Some(4),
        vdr_mode: VdrMode::Rolling,
        ..EngineConfig::default()
    }
}

pub fn factory(store: &SharedMetadataStore, scheduler: &Arc<FakeScheduler>) -> PipestanceFactory {
    factory_with(config(), store, scheduler)
}

pub fn factory_with(
    config: EngineConfig,
    store: &SharedMetadataStore,
    scheduler: &Arc<FakeScheduler>,
) -> PipestanceFactory {
    let shared: SharedScheduler = scheduler.clone();
    PipestanceFactory::new(config)
        .with_store(Arc::clone(store))
        .with_scheduler(Arc::clone(&shared))
        .with_local_scheduler(shared)
}

/// Two stages in a pipeline: MAKE produces `out`, USE consumes it. The
/// pipeline returns USE's result.
pub fn two_stage_source(make_volatile: bool, make_split: bool) -> String {
    json!({
        "stages": [
            {
                "id": "MAKE",
                "inputs": [{"name": "n", "type": "int"}],
                "outputs": [{"name": "out", "type": "string"}],
                "src": {"path": "/opt/stages/make"},
                "split": make_split
            },
            {
                "id": "USE",
                "inputs": [{"name": "x", "type": "string"}],
                "outputs": [{"name": "result", "type": "string"}],
                "src": {"path": "/opt/stages/use"}
            }
        ],
        "pipelines": [{
            "id": "PIPE",
            "inputs": [{"name": "n", "type": "int"}],
            "outputs": [{"name": "result", "type": "string"}],
            "calls": [
                {"id": "MAKE", "callable": "MAKE",
                 "bindings": {"n": {"self": "n"}},
                 "modifiers": {"volatile": make_volatile}},
                {"id": "USE", "callable": "USE",
                 "bindings": {"x": {"output": {"call": "MAKE", "output": "out"}}}}
            ],
            "returns": {"result": {"output": {"call": "USE", "output": "result"}}}
        }],
        "call": {"id": "PIPE", "callable": "PIPE", "bindings": {"n": {"value": 3}}}
    })
    .to_string()
}

/// Outputs that satisfy both stages of [`two_stage_source`].
pub fn two_stage_outs(request: &JobRequest, _args: &Value) -> Value {
    json!({
        "out": request.unit.files_dir.join("main.dat").display().to_string(),
        "result": "done",
    })
}

/// Cycles until the pipestance leaves the running state or `max` cycles pass.
pub async fn drive(pipestance: &Pipestance, max: usize) -> pipestance_runtime::CycleOutcome {
    let mut outcome = pipestance_runtime::CycleOutcome::Running;
    for _ in 0..max {
        outcome = pipestance
            .cycle()
            .await
            .expect("cycle should not error");
        if outcome != pipestance_runtime::CycleOutcome::Running {
            break;
        }
    }
    outcome
}

pub fn count_entries(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| entries.count())
        .unwrap_or(0)
}
