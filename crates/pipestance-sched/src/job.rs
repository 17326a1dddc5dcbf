use crate::errors::SchedulerResult;
use pipestance_store::UnitRef;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Where jobs run. Remote modes are named after their job template.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobMode {
    #[default]
    Local,
    Remote { template: PathBuf },
}

impl JobMode {
    /// Stable label persisted in the pipestance `_jobmode` record.
    pub fn label(&self) -> String {
        match self {
            JobMode::Local => "local".to_string(),
            JobMode::Remote { template } => template
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| template.display().to_string()),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, JobMode::Local)
    }
}

/// One launch of a split, chunk, or join.
///
/// `argv` is the full command line. The job's stdout/stderr land in the
/// unit's `_stdout`/`_stderr` files and launch failures are written back to
/// the unit as failure markers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobRequest {
    pub unit: UnitRef,
    pub argv: Vec<String>,
    pub threads: u32,
    /// `None` when the stage declares no memory cap.
    pub mem_gb: Option<u32>,
}

impl JobRequest {
    pub fn new(unit: UnitRef, argv: Vec<String>) -> Self {
        Self {
            unit,
            argv,
            threads: 1,
            mem_gb: None,
        }
    }

    pub fn with_resources(mut self, threads: u32, mem_gb: Option<u32>) -> Self {
        self.threads = threads;
        self.mem_gb = mem_gb;
        self
    }

    /// Command line as one shell-safe string.
    pub fn command_line(&self) -> String {
        self.argv
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || "-_./=:,@%+".contains(ch));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

#[async_trait::async_trait]
pub trait Scheduler: Send + Sync {
    fn mode(&self) -> JobMode;

    /// Hands a job to the scheduler. Returns once the job is accepted; its
    /// progress is observed later through the unit's metadata.
    async fn enqueue(&self, request: JobRequest) -> SchedulerResult<()>;

    /// `None` means no local limit is enforced.
    fn max_cores(&self) -> Option<u32>;

    fn max_mem_gb(&self) -> Option<u32>;

    /// Cancels every pending and running job.
    async fn kill(&self, reason: &str);
}

pub type SharedScheduler = Arc<dyn Scheduler>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_quotes_only_unsafe_arguments() {
        let request = JobRequest::new(
            UnitRef::new("ID.ps.S.fork0.chunk0", "/tmp/u"),
            vec![
                "/bin/stage".to_string(),
                "main".to_string(),
                "/tmp/my dir".to_string(),
                "it's".to_string(),
            ],
        );
        assert_eq!(
            request.command_line(),
            "/bin/stage main '/tmp/my dir' 'it'\\''s'"
        );
    }

    #[test]
    fn job_mode_label_uses_template_stem() {
        assert_eq!(JobMode::Local.label(), "local");
        assert_eq!(
            JobMode::Remote {
                template: PathBuf::from("/etc/sched/sge.template")
            }
            .label(),
            "sge"
        );
    }
}
