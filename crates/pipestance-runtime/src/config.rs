//! Engine settings, loadable from TOML.
//!
//! ```toml
//! step_interval_ms = 3000
//! heartbeat_timeout_secs = 3600
//! vdr_mode = "rolling"
//!
//! [job_mode]
//! kind = "remote"
//! template = "/etc/pipestance/sge.template"
//!
//! [remote]
//! min_submit_interval_ms = 500
//! max_outstanding = 400
//!
//! [retry]
//! max_auto_retries = 2
//! transient_patterns = ["(?i)preempt"]
//! ```

use crate::errors::PipestanceError;
use crate::retry::RetryConfig;
use pipestance_sched::{JobMode, LocalSchedulerConfig, RemoteSchedulerConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VdrMode {
    /// Reclaim as soon as every consumer of a node has completed.
    #[default]
    Rolling,
    /// Reclaim once, after the whole pipestance completes.
    Post,
    Disable,
}

impl VdrMode {
    pub fn as_str(self) -> &'static str {
        match self {
            VdrMode::Rolling => "rolling",
            VdrMode::Post => "post",
            VdrMode::Disable => "disable",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub job_mode: JobMode,
    pub local: LocalSchedulerConfig,
    pub remote: RemoteSchedulerConfig,
    pub step_interval_ms: u64,
    pub heartbeat_timeout_secs: u64,
    /// Concurrent metadata reads during one refresh. `None` uses the CPU
    /// count.
    pub refresh_parallelism: Option<usize>,
    pub vdr_mode: VdrMode,
    pub retry: RetryConfig,
    /// Reset drops the whole fork of a failed chunk instead of only the chunk.
    pub full_stage_reset: bool,
    /// Stamped into `_versions` at invoke.
    pub versions: BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            job_mode: JobMode::Local,
            local: LocalSchedulerConfig::default(),
            remote: RemoteSchedulerConfig::default(),
            step_interval_ms: 3_000,
            heartbeat_timeout_secs: 3_600,
            refresh_parallelism: None,
            vdr_mode: VdrMode::Rolling,
            retry: RetryConfig::default(),
            full_stage_reset: false,
            versions: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, PipestanceError> {
        let config: Self =
            toml::from_str(text).map_err(|err| PipestanceError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self, PipestanceError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| PipestanceError::Config(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), PipestanceError> {
        if self.step_interval_ms == 0 {
            return Err(PipestanceError::Config(
                "step_interval_ms must be positive".to_string(),
            ));
        }
        if self.heartbeat_timeout_secs == 0 {
            return Err(PipestanceError::Config(
                "heartbeat_timeout_secs must be positive".to_string(),
            ));
        }
        if self.refresh_parallelism == Some(0) {
            return Err(PipestanceError::Config(
                "refresh_parallelism must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn step_interval(&self) -> Duration {
        Duration::from_millis(self.step_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn resolved_refresh_parallelism(&self) -> usize {
        self.refresh_parallelism.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Remote scheduler settings with the template taken from the job mode.
    pub fn remote_scheduler_config(&self) -> Option<RemoteSchedulerConfig> {
        match &self.job_mode {
            JobMode::Local => None,
            JobMode::Remote { template } => Some(RemoteSchedulerConfig {
                template: template.clone(),
                ..self.remote.clone()
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn from_toml_str_empty_expected_defaults() {
        let config = EngineConfig::from_toml_str("").expect("empty config should parse");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(3_600));
        assert!(config.remote_scheduler_config().is_none());
    }

    #[test]
    fn from_toml_str_full_expected_fields_populated() {
        let config = EngineConfig::from_toml_str(
            r#"
            step_interval_ms = 250
            vdr_mode = "post"
            full_stage_reset = true

            [job_mode]
            kind = "remote"
            template = "/etc/pipestance/sge.template"

            [local]
            max_cores = 8
            max_mem_gb = 32

            [remote]
            min_submit_interval_ms = 500
            max_outstanding = 40

            [retry]
            max_auto_retries = 2
            transient_patterns = ["(?i)preempt"]

            [versions]
            pipelines = "4.0.1"
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.step_interval(), Duration::from_millis(250));
        assert_eq!(config.vdr_mode, VdrMode::Post);
        assert!(config.full_stage_reset);
        assert_eq!(config.local.max_cores, Some(8));
        assert_eq!(config.retry.max_auto_retries, 2);
        assert_eq!(config.versions["pipelines"], "4.0.1");
        let remote = config
            .remote_scheduler_config()
            .expect("remote job mode should yield remote settings");
        assert_eq!(remote.template, PathBuf::from("/etc/pipestance/sge.template"));
        assert_eq!(remote.max_outstanding, Some(40));
        assert_eq!(config.job_mode.label(), "sge");
    }

    #[test]
    fn from_toml_str_zero_interval_expected_config_error() {
        let err = EngineConfig::from_toml_str("step_interval_ms = 0")
            .expect_err("zero interval should be rejected");
        assert!(matches!(err, PipestanceError::Config(_)));
    }

    #[test]
    fn from_toml_str_unknown_vdr_mode_expected_config_error() {
        let err = EngineConfig::from_toml_str(r#"vdr_mode = "sometimes""#)
            .expect_err("unknown mode should be rejected");
        assert!(matches!(err, PipestanceError::Config(_)));
    }
}
