use crate::errors::PipestanceError;
use pipestance_store::{
    MetadataFile, MetadataStore, MetadataStoreResult, UnitRef, read_json, timestamp_now,
    write_json,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// The durable contract of a pipestance, written once at invoke.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub psid: String,
    pub source: String,
    pub source_hash: String,
    /// Top-level call bindings, for display.
    pub args: Value,
    pub versions: BTreeMap<String, String>,
    pub job_mode: String,
    pub created_at: String,
}

impl InvocationRecord {
    pub fn new(
        psid: &str,
        source: &str,
        args: Value,
        versions: BTreeMap<String, String>,
        job_mode: String,
    ) -> Self {
        Self {
            psid: psid.to_string(),
            source: source.to_string(),
            source_hash: source_hash(source),
            args,
            versions,
            job_mode,
            created_at: timestamp_now(),
        }
    }

    /// Same psid and same source text, ignoring surrounding whitespace.
    pub fn matches(&self, psid: &str, source: &str) -> bool {
        self.psid == psid && self.source_hash == source_hash(source)
    }
}

pub fn source_hash(source: &str) -> String {
    blake3::hash(source.trim().as_bytes()).to_hex().to_string()
}

pub fn validate_psid(psid: &str) -> Result<(), PipestanceError> {
    static PSID: OnceLock<Option<Regex>> = OnceLock::new();
    let valid = PSID
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").ok())
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(psid));
    if valid {
        Ok(())
    } else {
        Err(PipestanceError::InvalidPsid(psid.to_string()))
    }
}

/// Writes `_invocation`, `_versions`, `_jobmode` and `_timestamp` at the
/// pipestance root.
pub async fn write_invocation(
    store: &dyn MetadataStore,
    root: &UnitRef,
    record: &InvocationRecord,
) -> MetadataStoreResult<()> {
    write_json(store, root, MetadataFile::Invocation, record).await?;
    write_json(store, root, MetadataFile::Versions, &record.versions).await?;
    store
        .write_raw(root, MetadataFile::JobMode, &record.job_mode)
        .await?;
    store
        .write_raw(root, MetadataFile::Timestamp, &record.created_at)
        .await
}

pub async fn read_invocation(
    store: &dyn MetadataStore,
    root: &UnitRef,
) -> MetadataStoreResult<Option<InvocationRecord>> {
    read_json(store, root, MetadataFile::Invocation).await
}

/// The recorded job mode label. Falls back to the invocation record when
/// `_jobmode` is missing.
pub async fn read_job_mode(
    store: &dyn MetadataStore,
    root: &UnitRef,
    record: &InvocationRecord,
) -> MetadataStoreResult<String> {
    Ok(store
        .read_raw(root, MetadataFile::JobMode)
        .await?
        .map(|raw| raw.trim().to_string())
        .unwrap_or_else(|| record.job_mode.clone()))
}
