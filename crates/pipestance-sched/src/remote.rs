use crate::errors::{SchedulerError, SchedulerResult};
use crate::job::{JobMode, JobRequest, Scheduler};
use pipestance_store::{
    FailureKind, MetadataFile, SharedMetadataStore, UnitFailure, UnitRef, write_failure,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSchedulerConfig {
    pub template: PathBuf,
    /// Minimum spacing between two submissions.
    pub min_submit_interval_ms: u64,
    /// Cap on jobs submitted but not yet terminal. `None` leaves it to the
    /// cluster queue.
    pub max_outstanding: Option<usize>,
}

impl Default for RemoteSchedulerConfig {
    fn default() -> Self {
        Self {
            template: PathBuf::new(),
            min_submit_interval_ms: 0,
            max_outstanding: None,
        }
    }
}

/// A site job template: directive header lines plus the script body.
///
/// ```text
/// #!/bin/sh
/// # __schedcmd__ = "qsub"
/// # __cancelcmd__ = "qdel"
/// #$ -N <job_name>
/// #$ -pe threads <threads>
/// #$ -l mem_free=<mem_gb>G
/// <cmd>
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobTemplate {
    pub path: PathBuf,
    pub submit_cmd: String,
    pub cancel_cmd: Option<String>,
    pub body: String,
}

fn read_directive(path: &Path, text: &str, name: &str) -> SchedulerResult<Option<String>> {
    let pattern = Regex::new(&format!(r#"(?m)^#[ \t]*{name}[ \t]*=[ \t]*"([^"\n]+)"[ \t]*$"#))
        .map_err(|err| SchedulerError::Template {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
    Ok(pattern
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string()))
}

impl JobTemplate {
    pub fn parse(path: impl Into<PathBuf>, text: &str) -> SchedulerResult<Self> {
        let path = path.into();
        let submit_cmd = read_directive(&path, text, "__schedcmd__")?.ok_or_else(|| {
            SchedulerError::Template {
                path: path.clone(),
                reason: "missing __schedcmd__ directive".to_string(),
            }
        })?;
        let cancel_cmd = read_directive(&path, text, "__cancelcmd__")?;
        Ok(Self {
            path,
            submit_cmd,
            cancel_cmd,
            body: text.to_string(),
        })
    }

    pub async fn load(path: &Path) -> SchedulerResult<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| SchedulerError::Template {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;
        Self::parse(path, &text)
    }
}

/// Substitutes `<key>` placeholders. A line that mentions a placeholder whose
/// value is absent or empty is dropped entirely.
pub fn render_template(template: &str, params: &BTreeMap<&str, Option<String>>) -> String {
    let mut rendered = Vec::new();
    'lines: for line in template.lines() {
        let mut line = line.to_string();
        for (key, value) in params {
            let placeholder = format!("<{key}>");
            if !line.contains(&placeholder) {
                continue;
            }
            match value.as_deref().filter(|value| !value.is_empty()) {
                Some(value) => line = line.replace(&placeholder, value),
                None => continue 'lines,
            }
        }
        rendered.push(line);
    }
    let mut out = rendered.join("\n");
    if template.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// Submits one cluster job per unit through the template's submit command.
///
/// There is no local admission control: the cluster queue owns that. The
/// scheduler only spaces submissions out and caps how many it keeps in flight.
pub struct RemoteScheduler {
    store: SharedMetadataStore,
    template: JobTemplate,
    config: RemoteSchedulerConfig,
    state: Mutex<SubmitState>,
}

#[derive(Default)]
struct SubmitState {
    last_submit: Option<Instant>,
    outstanding: BTreeMap<String, UnitRef>,
}

impl RemoteScheduler {
    pub async fn new(
        store: SharedMetadataStore,
        config: RemoteSchedulerConfig,
    ) -> SchedulerResult<Self> {
        if config.max_outstanding == Some(0) {
            return Err(SchedulerError::InvalidConfig(
                "max_outstanding must be at least 1 when set".to_string(),
            ));
        }
        let template = JobTemplate::load(&config.template).await?;
        Ok(Self::with_template(store, template, config))
    }

    pub fn with_template(
        store: SharedMetadataStore,
        template: JobTemplate,
        config: RemoteSchedulerConfig,
    ) -> Self {
        info!(
            template = %template.path.display(),
            submit_cmd = %template.submit_cmd,
            "remote scheduler ready"
        );
        Self {
            store,
            template,
            config,
            state: Mutex::new(SubmitState::default()),
        }
    }

    pub fn template(&self) -> &JobTemplate {
        &self.template
    }

    pub async fn outstanding(&self) -> usize {
        let mut state = self.state.lock().await;
        self.prune(&mut state).await;
        state.outstanding.len()
    }

    fn params_for(&self, request: &JobRequest) -> BTreeMap<&'static str, Option<String>> {
        let unit = &request.unit;
        BTreeMap::from([
            ("job_name", Some(unit.fqname.clone())),
            ("threads", Some(request.threads.max(1).to_string())),
            ("mem_gb", request.mem_gb.map(|mem| mem.max(1).to_string())),
            (
                "stdout",
                Some(unit.file_path(MetadataFile::StdOut).display().to_string()),
            ),
            (
                "stderr",
                Some(unit.file_path(MetadataFile::StdErr).display().to_string()),
            ),
            ("cmd", Some(request.command_line())),
        ])
    }

    /// Drops units that reached a terminal state or were reset since they
    /// were submitted.
    async fn prune(&self, state: &mut SubmitState) {
        let mut finished = Vec::new();
        for (fqname, unit) in &state.outstanding {
            match self.store.read_state(unit).await {
                Ok(unit_state) if unit_state.is_active() => {}
                Ok(_) => finished.push(fqname.clone()),
                Err(err) => debug!(fqname = %fqname, error = %err, "could not read remote job state"),
            }
        }
        for fqname in finished {
            state.outstanding.remove(&fqname);
        }
    }

    async fn submit(&self, unit: &UnitRef, script_path: &Path) -> Result<String, String> {
        let output = Command::new(&self.template.submit_cmd)
            .arg(script_path)
            .current_dir(&unit.files_dir)
            .output()
            .await
            .map_err(|err| format!("{}: {err}", self.template.submit_cmd))?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if output.status.success() {
            Ok(combined)
        } else {
            Err(format!("{} exited with {}\n{combined}", self.template.submit_cmd, output.status))
        }
    }
}

#[async_trait::async_trait]
impl Scheduler for RemoteScheduler {
    fn mode(&self) -> JobMode {
        JobMode::Remote {
            template: self.template.path.clone(),
        }
    }

    async fn enqueue(&self, request: JobRequest) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        self.prune(&mut state).await;

        if let Some(max) = self.config.max_outstanding {
            if state.outstanding.len() >= max {
                return Err(SchedulerError::Capacity(format!(
                    "{} remote jobs outstanding (max {max})",
                    state.outstanding.len()
                )));
            }
        }
        let min_interval = Duration::from_millis(self.config.min_submit_interval_ms);
        if let Some(last) = state.last_submit {
            let elapsed = last.elapsed();
            if elapsed < min_interval {
                return Err(SchedulerError::Capacity(format!(
                    "next submission allowed in {}ms",
                    (min_interval - elapsed).as_millis()
                )));
            }
        }

        let unit = &request.unit;
        let script = render_template(&self.template.body, &self.params_for(&request));
        self.store
            .write_raw(unit, MetadataFile::JobScript, &script)
            .await?;
        let script_path = unit.file_path(MetadataFile::JobScript);
        state.last_submit = Some(Instant::now());

        match self.submit(unit, &script_path).await {
            Ok(output) => {
                self.store
                    .write_raw(unit, MetadataFile::JobId, output.trim())
                    .await?;
                state.outstanding.insert(unit.fqname.clone(), unit.clone());
                info!(fqname = %unit.fqname, job_id = %output.trim(), "submitted remote job");
            }
            Err(message) => {
                error!(fqname = %unit.fqname, error = %message, "remote submission failed");
                write_failure(
                    self.store.as_ref(),
                    unit,
                    &UnitFailure::new(FailureKind::Execution, format!("schedcmd error:\n{message}")),
                )
                .await?;
            }
        }
        Ok(())
    }

    fn max_cores(&self) -> Option<u32> {
        None
    }

    fn max_mem_gb(&self) -> Option<u32> {
        None
    }

    async fn kill(&self, reason: &str) {
        let mut state = self.state.lock().await;
        self.prune(&mut state).await;
        let Some(cancel_cmd) = self.template.cancel_cmd.clone() else {
            warn!(
                reason,
                outstanding = state.outstanding.len(),
                "no cancel command configured; remote jobs left running"
            );
            return;
        };
        for (fqname, unit) in std::mem::take(&mut state.outstanding) {
            let result = Command::new(&cancel_cmd)
                .arg(&fqname)
                .current_dir(&unit.files_dir)
                .output()
                .await;
            match result {
                Ok(output) if output.status.success() => {
                    info!(fqname = %fqname, reason, "cancelled remote job");
                }
                Ok(output) => warn!(
                    fqname = %fqname,
                    status = %output.status,
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "cancel command failed"
                ),
                Err(err) => warn!(fqname = %fqname, error = %err, "cancel command failed to launch"),
            }
            let failure = UnitFailure::new(FailureKind::Execution, format!("killed: {reason}"));
            if let Err(err) = write_failure(self.store.as_ref(), &unit, &failure).await {
                error!(fqname = %fqname, error = %err, "failed to record kill");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(mem: Option<&str>) -> BTreeMap<&'static str, Option<String>> {
        BTreeMap::from([
            ("job_name", Some("ID.ps.STAGE.fork0.chunk0".to_string())),
            ("threads", Some("4".to_string())),
            ("mem_gb", mem.map(str::to_string)),
            ("stdout", Some("/ps/_stdout".to_string())),
            ("stderr", Some("/ps/_stderr".to_string())),
            ("cmd", Some("/bin/stage main /ps /ps/files".to_string())),
        ])
    }

    const SGE: &str = "#!/bin/sh\n\
# __schedcmd__ = \"qsub\"\n\
# __cancelcmd__ = \"qdel\"\n\
#$ -N <job_name>\n\
#$ -pe threads <threads>\n\
#$ -l mem_free=<mem_gb>G\n\
#$ -o <stdout>\n\
#$ -e <stderr>\n\
<cmd>\n";

    #[test]
    fn render_template_substitutes_every_placeholder() {
        let rendered = render_template(SGE, &params(Some("16")));
        assert!(rendered.contains("#$ -N ID.ps.STAGE.fork0.chunk0\n"));
        assert!(rendered.contains("#$ -pe threads 4\n"));
        assert!(rendered.contains("#$ -l mem_free=16G\n"));
        assert!(rendered.ends_with("/bin/stage main /ps /ps/files\n"));
        assert!(!rendered.contains('<'));
    }

    #[test]
    fn render_template_strips_lines_with_unset_placeholder() {
        let rendered = render_template(SGE, &params(None));
        assert!(!rendered.contains("mem_free"));
        assert!(rendered.contains("#$ -pe threads 4"));

        let empty = render_template(SGE, &params(Some("")));
        assert!(!empty.contains("mem_free"));
    }

    #[test]
    fn parse_reads_submit_and_cancel_directives() {
        let template = JobTemplate::parse("/sched/sge.template", SGE).expect("template should parse");
        assert_eq!(template.submit_cmd, "qsub");
        assert_eq!(template.cancel_cmd.as_deref(), Some("qdel"));
    }

    #[test]
    fn parse_without_schedcmd_is_a_template_error() {
        let err = JobTemplate::parse("/sched/bad", "#!/bin/sh\n<cmd>\n")
            .expect_err("missing schedcmd should fail");
        assert!(matches!(err, SchedulerError::Template { .. }));
    }
}
