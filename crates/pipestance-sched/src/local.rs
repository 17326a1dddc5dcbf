use crate::errors::{SchedulerError, SchedulerResult};
use crate::host;
use crate::job::{JobMode, JobRequest, Scheduler};
use crate::pool::{ResourceLease, ResourcePool};
use pipestance_store::{
    FailureKind, JobInfo, MetadataFile, SharedMetadataStore, UnitFailure, UnitRef, UnitState,
    write_failure, write_json,
};
use serde::{Deserialize, Serialize};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Fraction of physical memory offered to jobs when no limit is configured.
const AUTODETECT_MEM_FRACTION: f64 = 0.75;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSchedulerConfig {
    /// `None` autodetects from the CPU count.
    pub max_cores: Option<u32>,
    /// `None` autodetects from physical memory.
    pub max_mem_gb: Option<u32>,
    /// Jobs wait to be admitted while the one-minute load average is above
    /// this value.
    pub max_load_average: Option<f64>,
    pub load_poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for LocalSchedulerConfig {
    fn default() -> Self {
        Self {
            max_cores: None,
            max_mem_gb: None,
            max_load_average: None,
            load_poll_interval_ms: 5_000,
            heartbeat_interval_ms: 120_000,
        }
    }
}

impl LocalSchedulerConfig {
    pub fn resolved_max_cores(&self) -> u32 {
        self.max_cores.unwrap_or_else(host::cpu_count)
    }

    pub fn resolved_max_mem_gb(&self) -> Option<u32> {
        self.max_mem_gb.or_else(|| {
            host::total_mem_gb().map(|total| ((total as f64 * AUTODETECT_MEM_FRACTION) as u32).max(1))
        })
    }
}

/// Source of the one-minute load average consulted before admission.
#[async_trait::async_trait]
pub trait LoadSource: Send + Sync {
    async fn load_average(&self) -> Option<f64>;
}

/// Reads the load average of this host.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostLoadSource;

#[async_trait::async_trait]
impl LoadSource for HostLoadSource {
    async fn load_average(&self) -> Option<f64> {
        host::load_average().await
    }
}

/// Runs jobs as child processes of the engine, admitted against a
/// core/memory pool that may be shared with other local schedulers.
#[derive(Clone)]
pub struct LocalScheduler {
    inner: Arc<LocalInner>,
}

struct LocalInner {
    store: SharedMetadataStore,
    pool: ResourcePool,
    config: LocalSchedulerConfig,
    load: Arc<dyn LoadSource>,
    cancel: CancellationToken,
    kill_reason: Mutex<Option<String>>,
}

enum JobOutcome {
    Exited(ExitStatus),
    Killed,
}

impl LocalScheduler {
    pub fn new(store: SharedMetadataStore, config: LocalSchedulerConfig) -> SchedulerResult<Self> {
        let pool = Self::pool_for(&config)?;
        Ok(Self::with_parts(store, config, pool, Arc::new(HostLoadSource)))
    }

    /// Pool sized from `config`, for sharing between schedulers on one host.
    pub fn pool_for(config: &LocalSchedulerConfig) -> SchedulerResult<ResourcePool> {
        ResourcePool::new(Some(config.resolved_max_cores()), config.resolved_max_mem_gb())
    }

    /// Admits against `pool`, whose capacity other schedulers may also draw
    /// on. Killing this scheduler leaves the pool open for them.
    pub fn with_parts(
        store: SharedMetadataStore,
        config: LocalSchedulerConfig,
        pool: ResourcePool,
        load: Arc<dyn LoadSource>,
    ) -> Self {
        info!(
            max_cores = ?pool.max_cores(),
            max_mem_gb = ?pool.max_mem_gb(),
            max_load_average = ?config.max_load_average,
            "local scheduler ready"
        );
        Self {
            inner: Arc::new(LocalInner {
                store,
                pool,
                config,
                load,
                cancel: CancellationToken::new(),
                kill_reason: Mutex::new(None),
            }),
        }
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.inner.pool
    }
}

#[async_trait::async_trait]
impl Scheduler for LocalScheduler {
    fn mode(&self) -> JobMode {
        JobMode::Local
    }

    async fn enqueue(&self, request: JobRequest) -> SchedulerResult<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(SchedulerError::Shutdown);
        }
        if request.argv.is_empty() {
            write_failure(
                self.inner.store.as_ref(),
                &request.unit,
                &UnitFailure::new(FailureKind::Execution, "empty command line"),
            )
            .await?;
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run(request).await });
        Ok(())
    }

    fn max_cores(&self) -> Option<u32> {
        self.inner.pool.max_cores()
    }

    fn max_mem_gb(&self) -> Option<u32> {
        self.inner.pool.max_mem_gb()
    }

    async fn kill(&self, reason: &str) {
        if let Ok(mut slot) = self.inner.kill_reason.lock() {
            slot.get_or_insert_with(|| reason.to_string());
        }
        warn!(reason, "killing local jobs");
        self.inner.cancel.cancel();
    }
}

impl LocalInner {
    async fn run(&self, request: JobRequest) {
        let unit = request.unit.clone();
        let lease = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.record_failure(&unit, self.killed_message()).await;
                return;
            }
            lease = self.admit(&request) => lease,
        };
        let lease = match lease {
            Ok(lease) => lease,
            Err(_) => {
                self.record_failure(&unit, self.killed_message()).await;
                return;
            }
        };
        self.execute(&request, &lease).await;
        debug!(
            fqname = %unit.fqname,
            threads = lease.threads,
            mem_gb = lease.mem_gb,
            "released resources"
        );
    }

    async fn admit(&self, request: &JobRequest) -> SchedulerResult<ResourceLease> {
        if let Some(threshold) = self.config.max_load_average {
            let poll = Duration::from_millis(self.config.load_poll_interval_ms.max(1));
            while let Some(load) = self.load.load_average().await {
                if load <= threshold {
                    break;
                }
                debug!(fqname = %request.unit.fqname, load, threshold, "waiting for load to drop");
                tokio::time::sleep(poll).await;
            }
        }
        self.pool
            .acquire(request.threads, request.mem_gb.unwrap_or(1))
            .await
    }

    async fn execute(&self, request: &JobRequest, lease: &ResourceLease) {
        let unit = &request.unit;
        let (stdout, stderr) = match self.open_sinks(unit).await {
            Ok(sinks) => sinks,
            Err(err) => {
                self.record_failure(unit, format!("failed to open output sinks: {err}"))
                    .await;
                return;
            }
        };

        let mut command = Command::new(&request.argv[0]);
        command
            .args(&request.argv[1..])
            .current_dir(&unit.files_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        #[cfg(unix)]
        command.process_group(0);
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                error!(fqname = %unit.fqname, error = %err, "failed to launch job");
                self.record_failure(unit, format!("failed to launch {}: {err}", request.argv[0]))
                    .await;
                return;
            }
        };
        let pid = child.id();
        info!(
            fqname = %unit.fqname,
            pid = ?pid,
            threads = lease.threads,
            mem_gb = lease.mem_gb,
            "launched local job"
        );
        let info = JobInfo {
            name: unit.fqname.clone(),
            job_mode: JobMode::Local.label(),
            threads: lease.threads,
            mem_gb: lease.mem_gb,
            pid,
            host: Some(host::hostname()),
            cwd: Some(unit.files_dir.display().to_string()),
        };
        if let Err(err) = write_json(self.store.as_ref(), unit, MetadataFile::JobInfo, &info).await
        {
            warn!(fqname = %unit.fqname, error = %err, "failed to record jobinfo");
        }

        let mut heartbeat = interval(Duration::from_millis(
            self.config.heartbeat_interval_ms.max(1),
        ));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let outcome = loop {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => break JobOutcome::Exited(status),
                    Err(err) => {
                        self.record_failure(unit, format!("failed waiting for job: {err}")).await;
                        return;
                    }
                },
                _ = heartbeat.tick() => {
                    if let Err(err) = self.store.touch(unit, MetadataFile::Heartbeat).await {
                        debug!(fqname = %unit.fqname, error = %err, "heartbeat touch failed");
                    }
                }
                _ = self.cancel.cancelled() => {
                    if let Some(pid) = pid {
                        host::terminate_group(pid);
                    }
                    let _ = child.wait().await;
                    break JobOutcome::Killed;
                }
            }
        };

        match outcome {
            JobOutcome::Killed => self.record_failure(unit, self.killed_message()).await,
            JobOutcome::Exited(status) => self.finish(unit, status).await,
        }
    }

    async fn open_sinks(&self, unit: &UnitRef) -> std::io::Result<(Stdio, Stdio)> {
        let stdout = tokio::fs::File::create(unit.file_path(MetadataFile::StdOut))
            .await?
            .into_std()
            .await;
        let stderr = tokio::fs::File::create(unit.file_path(MetadataFile::StdErr))
            .await?
            .into_std()
            .await;
        Ok((Stdio::from(stdout), Stdio::from(stderr)))
    }

    /// A job that exits without leaving a terminal marker behind is failed
    /// here; markers the job wrote itself are never overwritten.
    async fn finish(&self, unit: &UnitRef, status: ExitStatus) {
        let state = match self.store.read_state(unit).await {
            Ok(state) => state,
            Err(err) => {
                warn!(fqname = %unit.fqname, error = %err, "could not read state after exit");
                return;
            }
        };
        if state.is_terminal() {
            debug!(fqname = %unit.fqname, state = %state, %status, "local job finished");
            return;
        }
        let message = if status.success() {
            "job exited without writing a completion marker".to_string()
        } else {
            format!("job exited with {status}")
        };
        warn!(fqname = %unit.fqname, %status, "local job failed");
        self.record_failure(unit, message).await;
    }

    fn killed_message(&self) -> String {
        let reason = self
            .kill_reason
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .unwrap_or_else(|| "scheduler shut down".to_string());
        format!("killed: {reason}")
    }

    async fn record_failure(&self, unit: &UnitRef, message: String) {
        let already_failed = matches!(self.store.read_state(unit).await, Ok(UnitState::Failed));
        if already_failed {
            return;
        }
        let failure = UnitFailure::new(FailureKind::Execution, message);
        if let Err(err) = write_failure(self.store.as_ref(), unit, &failure).await {
            error!(fqname = %unit.fqname, error = %err, "failed to record job failure");
        }
    }
}
