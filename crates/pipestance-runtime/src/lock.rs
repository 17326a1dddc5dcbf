use crate::errors::PipestanceError;
use pipestance_sched::host;
use pipestance_store::{MetadataFile, MetadataStore, UnitRef, timestamp_now};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Content of the pipestance `_lock` file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub host: String,
    pub pid: u32,
    pub timestamp: String,
}

impl LockRecord {
    pub fn current() -> Self {
        Self {
            host: host::hostname(),
            pid: host::current_pid(),
            timestamp: timestamp_now(),
        }
    }

    fn owner(&self) -> String {
        format!("pid {} on {}", self.pid, self.host)
    }

    /// Held by a process on this host that no longer exists.
    fn is_stale(&self) -> bool {
        self.host == host::hostname() && !host::pid_alive(self.pid)
    }
}

/// Takes the pipestance lock. A lock left behind by a dead process on this
/// host is replaced; any other existing lock is refused.
pub async fn acquire_lock(store: &dyn MetadataStore, root: &UnitRef) -> Result<(), PipestanceError> {
    let record = LockRecord::current();
    let text = serde_json::to_string(&record)
        .map_err(|err| pipestance_store::MetadataStoreError::Serialization(err.to_string()))?;
    for _ in 0..2 {
        if store.create_exclusive(root, MetadataFile::Lock, &text).await? {
            info!(path = %root.path.display(), pid = record.pid, "acquired pipestance lock");
            return Ok(());
        }
        let Some(raw) = store.read_raw(root, MetadataFile::Lock).await? else {
            continue;
        };
        let held: Option<LockRecord> = serde_json::from_str(&raw).ok();
        match held {
            Some(held) if held.is_stale() => {
                warn!(
                    path = %root.path.display(),
                    owner = %held.owner(),
                    "replacing stale pipestance lock"
                );
                store.remove(root, MetadataFile::Lock).await?;
            }
            Some(held) => {
                return Err(PipestanceError::Locked {
                    path: root.path.clone(),
                    owner: held.owner(),
                });
            }
            None => {
                return Err(PipestanceError::Locked {
                    path: root.path.clone(),
                    owner: raw.trim().to_string(),
                });
            }
        }
    }
    Err(PipestanceError::Locked {
        path: root.path.clone(),
        owner: "a concurrent engine".to_string(),
    })
}

pub async fn release_lock(store: &dyn MetadataStore, root: &UnitRef) -> Result<(), PipestanceError> {
    store.remove(root, MetadataFile::Lock).await?;
    info!(path = %root.path.display(), "released pipestance lock");
    Ok(())
}
