//! Filesystem-backed metadata store for pipestance units.
//!
//! Every schedulable unit (fork, split, chunk, join) owns a directory holding
//! `_`-prefixed metadata files. Unit state is never kept in memory across
//! refresh cycles; it is derived from which of those files exist.

pub mod fs;
pub mod store;
pub mod types;

pub use fs::FsMetadataStore;
pub use store::{
    MetadataStore, MetadataStoreError, MetadataStoreResult, SharedMetadataStore, read_failure,
    read_json, write_failure, write_json,
};
pub use types::{
    FILES_DIR_NAME, FailureKind, JobInfo, METADATA_FILE_PREFIX, MetadataFile, ReclaimedFiles,
    UnitFailure, UnitRef, UnitState, derive_state, timestamp_now,
};
