use crate::types::{MetadataFile, ReclaimedFiles, UnitFailure, UnitRef, UnitState, derive_state};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

#[derive(Debug, thiserror::Error)]
pub enum MetadataStoreError {
    #[error("metadata i/o failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed {file} for {fqname}: {reason}")]
    Malformed {
        fqname: String,
        file: &'static str,
        reason: String,
    },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("backend failure: {0}")]
    Backend(String),
}

impl MetadataStoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }
}

pub type MetadataStoreResult<T> = Result<T, MetadataStoreError>;

/// Per-unit metadata persistence.
///
/// All path and filename construction for unit directories goes through this
/// trait, so the state machine never touches the filesystem directly.
#[async_trait::async_trait]
pub trait MetadataStore: Send + Sync {
    /// Creates the unit directory and its files directory.
    async fn ensure_unit(&self, unit: &UnitRef) -> MetadataStoreResult<()>;

    /// Atomic create-or-replace of pre-formatted text.
    async fn write_raw(
        &self,
        unit: &UnitRef,
        file: MetadataFile,
        text: &str,
    ) -> MetadataStoreResult<()>;

    /// Writes `text` only if the file does not exist yet. Returns false when
    /// another writer got there first.
    async fn create_exclusive(
        &self,
        unit: &UnitRef,
        file: MetadataFile,
        text: &str,
    ) -> MetadataStoreResult<bool>;

    async fn read_raw(
        &self,
        unit: &UnitRef,
        file: MetadataFile,
    ) -> MetadataStoreResult<Option<String>>;

    async fn exists(&self, unit: &UnitRef, file: MetadataFile) -> MetadataStoreResult<bool>;

    async fn remove(&self, unit: &UnitRef, file: MetadataFile) -> MetadataStoreResult<()>;

    /// Metadata files currently present for the unit.
    async fn list(&self, unit: &UnitRef) -> MetadataStoreResult<BTreeSet<MetadataFile>>;

    async fn modified_at(
        &self,
        unit: &UnitRef,
        file: MetadataFile,
    ) -> MetadataStoreResult<Option<SystemTime>>;

    /// Removes every metadata file of the unit and empties its files
    /// directory. Nested unit directories are left alone.
    async fn reset_unit(&self, unit: &UnitRef) -> MetadataStoreResult<()>;

    /// Deletes the user output files of the unit.
    async fn reclaim_files(&self, unit: &UnitRef) -> MetadataStoreResult<ReclaimedFiles>;

    /// Removes a whole unit subtree, used when dropping dynamically created
    /// chunk directories.
    async fn remove_tree(&self, path: &Path) -> MetadataStoreResult<()>;

    /// Serializes `value` as pretty JSON and writes it atomically.
    async fn write_value(
        &self,
        unit: &UnitRef,
        file: MetadataFile,
        value: &Value,
    ) -> MetadataStoreResult<()> {
        let raw = serde_json::to_string_pretty(value)
            .map_err(|err| MetadataStoreError::Serialization(err.to_string()))?;
        self.write_raw(unit, file, &raw).await
    }

    /// Reads a JSON content file. Absent files are `None`; unparsable files
    /// are `Malformed` and never coerced to a default.
    async fn read_value(
        &self,
        unit: &UnitRef,
        file: MetadataFile,
    ) -> MetadataStoreResult<Option<Value>> {
        let Some(raw) = self.read_raw(unit, file).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| MetadataStoreError::Malformed {
                fqname: unit.fqname.clone(),
                file: file.as_str(),
                reason: err.to_string(),
            })
    }

    async fn read_state(&self, unit: &UnitRef) -> MetadataStoreResult<UnitState> {
        let present = self.list(unit).await?;
        Ok(derive_state(|file| present.contains(&file)))
    }

    async fn touch(&self, unit: &UnitRef, file: MetadataFile) -> MetadataStoreResult<()> {
        self.write_raw(unit, file, &crate::types::timestamp_now())
            .await
    }

    fn file_path(&self, unit: &UnitRef, file: MetadataFile) -> PathBuf {
        unit.file_path(file)
    }
}

pub type SharedMetadataStore = Arc<dyn MetadataStore>;

pub async fn write_json<T: Serialize + Sync>(
    store: &dyn MetadataStore,
    unit: &UnitRef,
    file: MetadataFile,
    value: &T,
) -> MetadataStoreResult<()> {
    let value = serde_json::to_value(value)
        .map_err(|err| MetadataStoreError::Serialization(err.to_string()))?;
    store.write_value(unit, file, &value).await
}

pub async fn read_json<T: DeserializeOwned>(
    store: &dyn MetadataStore,
    unit: &UnitRef,
    file: MetadataFile,
) -> MetadataStoreResult<Option<T>> {
    let Some(value) = store.read_value(unit, file).await? else {
        return Ok(None);
    };
    serde_json::from_value(value)
        .map(Some)
        .map_err(|err| MetadataStoreError::Malformed {
            fqname: unit.fqname.clone(),
            file: file.as_str(),
            reason: err.to_string(),
        })
}

/// Records a unit failure: the structured `_failure` record first, then the
/// marker that flips the derived state to failed.
pub async fn write_failure(
    store: &dyn MetadataStore,
    unit: &UnitRef,
    failure: &UnitFailure,
) -> MetadataStoreResult<()> {
    write_json(store, unit, MetadataFile::Failure, failure).await?;
    store
        .write_raw(unit, failure.kind.marker(), &failure.message)
        .await
}

/// Reads the failure payload of a failed unit.
///
/// Units failed by the external job itself only carry the bare marker; those
/// are classified from the marker that is present. A `_failure` record that
/// does not parse is reported as malformed, never read as absent.
pub async fn read_failure(
    store: &dyn MetadataStore,
    unit: &UnitRef,
) -> MetadataStoreResult<Option<UnitFailure>> {
    use crate::types::FailureKind;

    if let Some(assert) = store.read_raw(unit, MetadataFile::Assert).await? {
        let recorded: Option<UnitFailure> = read_json(store, unit, MetadataFile::Failure).await?;
        return Ok(Some(match recorded {
            Some(failure) if failure.kind == FailureKind::Assert => failure,
            _ => UnitFailure::new(FailureKind::Assert, assert),
        }));
    }
    let Some(errors) = store.read_raw(unit, MetadataFile::Errors).await? else {
        return Ok(None);
    };
    let recorded: Option<UnitFailure> = read_json(store, unit, MetadataFile::Failure).await?;
    Ok(Some(match recorded {
        Some(failure) if failure.kind != FailureKind::Assert => failure,
        _ => UnitFailure::new(FailureKind::Execution, errors),
    }))
}
