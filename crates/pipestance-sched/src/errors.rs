use pipestance_store::MetadataStoreError;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// No capacity to admit the job right now. The unit stays queued and is
    /// offered again on a later cycle.
    #[error("scheduler at capacity: {0}")]
    Capacity(String),

    #[error("invalid job template {path}: {reason}")]
    Template { path: PathBuf, reason: String },

    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    #[error("scheduler has been shut down")]
    Shutdown,

    #[error(transparent)]
    Store(#[from] MetadataStoreError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
