use crate::store::{MetadataStore, MetadataStoreError, MetadataStoreResult};
use crate::types::{MetadataFile, ReclaimedFiles, UnitRef};
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Metadata store over plain directories, one per unit.
#[derive(Clone, Debug, Default)]
pub struct FsMetadataStore {
    _private: (),
}

impl FsMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn temp_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!("{name}.tmp"))
    }
}

fn not_found(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::NotFound
}

#[async_trait::async_trait]
impl MetadataStore for FsMetadataStore {
    async fn ensure_unit(&self, unit: &UnitRef) -> MetadataStoreResult<()> {
        fs::create_dir_all(&unit.path)
            .await
            .map_err(|err| MetadataStoreError::io(&unit.path, err))?;
        fs::create_dir_all(&unit.files_dir)
            .await
            .map_err(|err| MetadataStoreError::io(&unit.files_dir, err))
    }

    async fn write_raw(
        &self,
        unit: &UnitRef,
        file: MetadataFile,
        text: &str,
    ) -> MetadataStoreResult<()> {
        let path = unit.file_path(file);
        let tmp = Self::temp_path(&path);
        fs::write(&tmp, text)
            .await
            .map_err(|err| MetadataStoreError::io(&tmp, err))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|err| MetadataStoreError::io(&path, err))
    }

    async fn create_exclusive(
        &self,
        unit: &UnitRef,
        file: MetadataFile,
        text: &str,
    ) -> MetadataStoreResult<bool> {
        let path = unit.file_path(file);
        let mut handle = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(handle) => handle,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(err) => return Err(MetadataStoreError::io(path, err)),
        };
        handle
            .write_all(text.as_bytes())
            .await
            .map_err(|err| MetadataStoreError::io(&path, err))?;
        handle
            .sync_all()
            .await
            .map_err(|err| MetadataStoreError::io(&path, err))?;
        Ok(true)
    }

    async fn read_raw(
        &self,
        unit: &UnitRef,
        file: MetadataFile,
    ) -> MetadataStoreResult<Option<String>> {
        let path = unit.file_path(file);
        match fs::read_to_string(&path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if not_found(&err) => Ok(None),
            Err(err) => Err(MetadataStoreError::io(path, err)),
        }
    }

    async fn exists(&self, unit: &UnitRef, file: MetadataFile) -> MetadataStoreResult<bool> {
        let path = unit.file_path(file);
        fs::try_exists(&path)
            .await
            .map_err(|err| MetadataStoreError::io(path, err))
    }

    async fn remove(&self, unit: &UnitRef, file: MetadataFile) -> MetadataStoreResult<()> {
        let path = unit.file_path(file);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if not_found(&err) => Ok(()),
            Err(err) => Err(MetadataStoreError::io(path, err)),
        }
    }

    async fn list(&self, unit: &UnitRef) -> MetadataStoreResult<BTreeSet<MetadataFile>> {
        let mut present = BTreeSet::new();
        let mut entries = match fs::read_dir(&unit.path).await {
            Ok(entries) => entries,
            Err(err) if not_found(&err) => return Ok(present),
            Err(err) => return Err(MetadataStoreError::io(&unit.path, err)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| MetadataStoreError::io(&unit.path, err))?
        {
            if let Some(file) = MetadataFile::from_file_name(&entry.file_name().to_string_lossy())
            {
                present.insert(file);
            }
        }
        Ok(present)
    }

    async fn modified_at(
        &self,
        unit: &UnitRef,
        file: MetadataFile,
    ) -> MetadataStoreResult<Option<SystemTime>> {
        let path = unit.file_path(file);
        match fs::metadata(&path).await {
            Ok(meta) => meta
                .modified()
                .map(Some)
                .map_err(|err| MetadataStoreError::io(path, err)),
            Err(err) if not_found(&err) => Ok(None),
            Err(err) => Err(MetadataStoreError::io(path, err)),
        }
    }

    async fn reset_unit(&self, unit: &UnitRef) -> MetadataStoreResult<()> {
        for file in self.list(unit).await? {
            self.remove(unit, file).await?;
        }
        if unit.owns_files_dir() {
            self.remove_tree(&unit.files_dir).await?;
        }
        self.ensure_unit(unit).await
    }

    async fn reclaim_files(&self, unit: &UnitRef) -> MetadataStoreResult<ReclaimedFiles> {
        let files_dir = unit.files_dir.clone();
        tokio::task::spawn_blocking(move || reclaim_dir_contents(&files_dir))
            .await
            .map_err(|err| MetadataStoreError::Backend(format!("reclaim task failed: {err}")))
    }

    async fn remove_tree(&self, path: &Path) -> MetadataStoreResult<()> {
        match fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(err) if not_found(&err) => Ok(()),
            Err(err) => Err(MetadataStoreError::io(path, err)),
        }
    }
}

/// Deletes every entry below `dir` and tallies what went away. Per-entry
/// failures are collected rather than aborting the sweep.
fn reclaim_dir_contents(dir: &Path) -> ReclaimedFiles {
    let mut report = ReclaimedFiles::default();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if not_found(&err) => return report,
        Err(err) => {
            report.errors.push(format!("{}: {err}", dir.display()));
            return report;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let mut count = 0u64;
        let mut size = 0u64;
        for walked in walkdir::WalkDir::new(&path).into_iter().flatten() {
            if walked.file_type().is_dir() {
                continue;
            }
            count += 1;
            size += walked.metadata().map(|meta| meta.len()).unwrap_or(0);
        }
        let removed = if entry.file_type().is_ok_and(|ty| ty.is_dir()) {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match removed {
            Ok(()) => {
                report.count += count;
                report.size += size;
                report.paths.push(path);
            }
            Err(err) => report.errors.push(format!("{}: {err}", path.display())),
        }
    }
    report
}
