use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const METADATA_FILE_PREFIX: &str = "_";
pub const FILES_DIR_NAME: &str = "files";

/// Well-known metadata files a unit directory may hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataFile {
    Args,
    Assert,
    ChunkDefs,
    ChunkOuts,
    Complete,
    Errors,
    Failure,
    FinalState,
    Heartbeat,
    Invocation,
    JobId,
    JobInfo,
    JobMode,
    JobScript,
    Lock,
    Log,
    Outs,
    Progress,
    QueuedLocally,
    StageDefs,
    StdErr,
    StdOut,
    Tags,
    Timestamp,
    VdrKill,
    Versions,
}

impl MetadataFile {
    pub const ALL: [MetadataFile; 26] = [
        MetadataFile::Args,
        MetadataFile::Assert,
        MetadataFile::ChunkDefs,
        MetadataFile::ChunkOuts,
        MetadataFile::Complete,
        MetadataFile::Errors,
        MetadataFile::Failure,
        MetadataFile::FinalState,
        MetadataFile::Heartbeat,
        MetadataFile::Invocation,
        MetadataFile::JobId,
        MetadataFile::JobInfo,
        MetadataFile::JobMode,
        MetadataFile::JobScript,
        MetadataFile::Lock,
        MetadataFile::Log,
        MetadataFile::Outs,
        MetadataFile::Progress,
        MetadataFile::QueuedLocally,
        MetadataFile::StageDefs,
        MetadataFile::StdErr,
        MetadataFile::StdOut,
        MetadataFile::Tags,
        MetadataFile::Timestamp,
        MetadataFile::VdrKill,
        MetadataFile::Versions,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MetadataFile::Args => "args",
            MetadataFile::Assert => "assert",
            MetadataFile::ChunkDefs => "chunk_defs",
            MetadataFile::ChunkOuts => "chunk_outs",
            MetadataFile::Complete => "complete",
            MetadataFile::Errors => "errors",
            MetadataFile::Failure => "failure",
            MetadataFile::FinalState => "finalstate",
            MetadataFile::Heartbeat => "heartbeat",
            MetadataFile::Invocation => "invocation",
            MetadataFile::JobId => "jobid",
            MetadataFile::JobInfo => "jobinfo",
            MetadataFile::JobMode => "jobmode",
            MetadataFile::JobScript => "jobscript",
            MetadataFile::Lock => "lock",
            MetadataFile::Log => "log",
            MetadataFile::Outs => "outs",
            MetadataFile::Progress => "progress",
            MetadataFile::QueuedLocally => "queued_locally",
            MetadataFile::StageDefs => "stage_defs",
            MetadataFile::StdErr => "stderr",
            MetadataFile::StdOut => "stdout",
            MetadataFile::Tags => "tags",
            MetadataFile::Timestamp => "timestamp",
            MetadataFile::VdrKill => "vdrkill",
            MetadataFile::Versions => "versions",
        }
    }

    pub fn file_name(self) -> String {
        format!("{METADATA_FILE_PREFIX}{}", self.as_str())
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        let bare = name.strip_prefix(METADATA_FILE_PREFIX)?;
        Self::ALL.into_iter().find(|file| file.as_str() == bare)
    }

    /// Files whose presence alone changes the derived unit state.
    pub fn is_state_marker(self) -> bool {
        matches!(
            self,
            MetadataFile::Assert
                | MetadataFile::Errors
                | MetadataFile::Complete
                | MetadataFile::Heartbeat
                | MetadataFile::JobInfo
                | MetadataFile::Log
                | MetadataFile::QueuedLocally
                | MetadataFile::JobId
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Waiting,
    Queued,
    Running,
    Complete,
    Failed,
}

impl UnitState {
    pub fn as_str(self) -> &'static str {
        match self {
            UnitState::Waiting => "waiting",
            UnitState::Queued => "queued",
            UnitState::Running => "running",
            UnitState::Complete => "complete",
            UnitState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, UnitState::Complete | UnitState::Failed)
    }

    /// Queued or running: the unit has been handed to a scheduler and has not
    /// reached a terminal marker yet.
    pub fn is_active(self) -> bool {
        matches!(self, UnitState::Queued | UnitState::Running)
    }
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derives a unit state from marker presence.
///
/// Precedence: failure markers, then completion, then running markers, then
/// queued markers. A unit with none of them is waiting.
pub fn derive_state(present: impl Fn(MetadataFile) -> bool) -> UnitState {
    if present(MetadataFile::Assert) || present(MetadataFile::Errors) {
        return UnitState::Failed;
    }
    if present(MetadataFile::Complete) {
        return UnitState::Complete;
    }
    if present(MetadataFile::Heartbeat) || present(MetadataFile::JobInfo) || present(MetadataFile::Log)
    {
        return UnitState::Running;
    }
    if present(MetadataFile::QueuedLocally) || present(MetadataFile::JobId) {
        return UnitState::Queued;
    }
    UnitState::Waiting
}

/// Addresses one unit directory and the directory its user outputs land in.
///
/// The files directory is usually `<path>/files`, but the single chunk of a
/// non-split stage shares the files directory of its fork.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UnitRef {
    pub fqname: String,
    pub path: PathBuf,
    pub files_dir: PathBuf,
}

impl UnitRef {
    pub fn new(fqname: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let files_dir = path.join(FILES_DIR_NAME);
        Self {
            fqname: fqname.into(),
            path,
            files_dir,
        }
    }

    pub fn with_files_dir(mut self, files_dir: impl Into<PathBuf>) -> Self {
        self.files_dir = files_dir.into();
        self
    }

    pub fn file_path(&self, file: MetadataFile) -> PathBuf {
        self.path.join(file.file_name())
    }

    pub fn owns_files_dir(&self) -> bool {
        self.files_dir.starts_with(&self.path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The stage code asserted on its own inputs.
    Assert,
    /// The job crashed, exited nonzero, or could not be submitted.
    Execution,
    /// Heartbeat went stale.
    Timeout,
    /// Resolved arguments failed validation before submission.
    Argument,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Assert => "assert",
            FailureKind::Execution => "execution",
            FailureKind::Timeout => "timeout",
            FailureKind::Argument => "argument",
        }
    }

    /// Marker file whose presence flags the unit as failed.
    pub fn marker(self) -> MetadataFile {
        match self {
            FailureKind::Assert => MetadataFile::Assert,
            _ => MetadataFile::Errors,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub kind: FailureKind,
    pub message: String,
    pub timestamp: String,
}

impl UnitFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp: timestamp_now(),
        }
    }
}

/// Written by a scheduler when it launches a job.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub job_mode: String,
    pub threads: u32,
    pub mem_gb: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// Outcome of deleting the user files of one unit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimedFiles {
    pub count: u64,
    pub size: u64,
    pub paths: Vec<PathBuf>,
    pub errors: Vec<String>,
}

impl ReclaimedFiles {
    pub fn merge(&mut self, other: ReclaimedFiles) {
        self.count += other.count;
        self.size += other.size;
        self.paths.extend(other.paths);
        self.errors.extend(other.errors);
    }
}

pub fn timestamp_now() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:03}Z", now.as_secs(), now.subsec_millis())
}
