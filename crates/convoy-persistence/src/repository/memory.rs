//! In-memory snapshot repository, used as the cache tier and in tests.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::traits::{SnapshotMeta, SnapshotRecord, SnapshotRepository, sort_oldest_first};
use crate::error::Result;

#[derive(Debug, Default)]
pub struct MemorySnapshotRepository {
    records: RwLock<HashMap<Uuid, SnapshotRecord>>,
}

impl MemorySnapshotRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl SnapshotRepository for MemorySnapshotRepository {
    async fn save(&self, record: &SnapshotRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.id(), record.clone());
        Ok(())
    }

    async fn load(&self, snapshot_id: Uuid) -> Result<Option<SnapshotRecord>> {
        Ok(self.records.read().await.get(&snapshot_id).cloned())
    }

    async fn latest(&self, name: &str) -> Result<Option<SnapshotRecord>> {
        let records = self.records.read().await;
        let newest = records
            .values()
            .filter(|r| r.meta.name == name)
            .max_by(|a, b| {
                a.meta
                    .saved_at
                    .cmp(&b.meta.saved_at)
                    .then(a.meta.tick.cmp(&b.meta.tick))
            })
            .cloned();
        Ok(newest)
    }

    async fn list(&self, name: &str) -> Result<Vec<SnapshotMeta>> {
        let mut metas: Vec<SnapshotMeta> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.meta.name == name)
            .map(|r| r.meta.clone())
            .collect();
        sort_oldest_first(&mut metas);
        Ok(metas)
    }

    async fn delete(&self, snapshot_id: Uuid) -> Result<()> {
        self.records.write().await.remove(&snapshot_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_load_delete() {
        let repo = MemorySnapshotRepository::new();
        let record = SnapshotRecord::new("demo", 10, json!({"tick": 10}));

        repo.save(&record).await.unwrap();
        assert_eq!(repo.load(record.id()).await.unwrap(), Some(record.clone()));

        repo.delete(record.id()).await.unwrap();
        assert!(repo.load(record.id()).await.unwrap().is_none());
        assert!(repo.is_empty().await);
    }

    #[tokio::test]
    async fn test_latest_filters_by_name() {
        let repo = MemorySnapshotRepository::new();
        let early = SnapshotRecord::new("demo", 10, json!({}));
        let mut late = SnapshotRecord::new("demo", 20, json!({}));
        let other = SnapshotRecord::new("other", 99, json!({}));
        late.meta.saved_at = early.meta.saved_at + chrono::Duration::seconds(5);
        for record in [&early, &late, &other] {
            repo.save(record).await.unwrap();
        }

        let latest = repo.latest("demo").await.unwrap().unwrap();
        assert_eq!(latest.meta.tick, 20);

        let ticks: Vec<u64> = repo.list("demo").await.unwrap().iter().map(|m| m.tick).collect();
        assert_eq!(ticks, vec![10, 20]);
        assert!(repo.latest("missing").await.unwrap().is_none());
    }
}
