//! JSON file snapshot repository.
//!
//! One pretty-printed file per snapshot, named `<snapshot_id>.json`. Writes
//! go to a temporary file first and are renamed into place, so a crash never
//! leaves a half-written snapshot behind.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use super::traits::{SnapshotMeta, SnapshotRecord, SnapshotRepository, sort_oldest_first};
use crate::error::Result;

const EXTENSION: &str = "json";

#[derive(Debug, Clone)]
pub struct FileSnapshotRepository {
    dir: PathBuf,
}

impl FileSnapshotRepository {
    /// Open `dir`, creating it when missing.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, snapshot_id: Uuid) -> PathBuf {
        self.dir.join(format!("{snapshot_id}.{EXTENSION}"))
    }

    async fn read_record(path: &Path) -> Result<Option<SnapshotRecord>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every readable record in the directory; unreadable files are skipped.
    async fn scan(&self) -> Result<Vec<SnapshotRecord>> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable snapshot"),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl SnapshotRepository for FileSnapshotRepository {
    async fn save(&self, record: &SnapshotRecord) -> Result<()> {
        let path = self.path_for(record.id());
        let tmp = path.with_extension("tmp");
        let bytes = serde_json::to_vec_pretty(record)?;
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &path).await?;
        debug!(snapshot_id = %record.id(), tick = record.meta.tick, bytes = bytes.len(), "Snapshot written");
        Ok(())
    }

    async fn load(&self, snapshot_id: Uuid) -> Result<Option<SnapshotRecord>> {
        Self::read_record(&self.path_for(snapshot_id)).await
    }

    async fn latest(&self, name: &str) -> Result<Option<SnapshotRecord>> {
        let newest = self
            .scan()
            .await?
            .into_iter()
            .filter(|r| r.meta.name == name)
            .max_by(|a, b| {
                a.meta
                    .saved_at
                    .cmp(&b.meta.saved_at)
                    .then(a.meta.tick.cmp(&b.meta.tick))
            });
        Ok(newest)
    }

    async fn list(&self, name: &str) -> Result<Vec<SnapshotMeta>> {
        let mut metas: Vec<SnapshotMeta> = self
            .scan()
            .await?
            .into_iter()
            .filter(|r| r.meta.name == name)
            .map(|r| r.meta)
            .collect();
        sort_oldest_first(&mut metas);
        Ok(metas)
    }

    async fn delete(&self, snapshot_id: Uuid) -> Result<()> {
        match fs::remove_file(self.path_for(snapshot_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
