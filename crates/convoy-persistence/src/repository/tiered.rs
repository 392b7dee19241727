//! Two-tier snapshot repository: a cache in front of a durable store, with
//! the access pattern picked by [`ReadStrategy`] and [`WriteStrategy`].

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use super::traits::{SnapshotMeta, SnapshotRecord, SnapshotRepository};
use crate::error::{PersistenceError, Result};
use crate::strategy::{CacheError, ReadStrategy, StoreError, WriteStrategy};

fn cache_err(err: PersistenceError) -> CacheError {
    CacheError(Box::new(err))
}

fn store_err(err: PersistenceError) -> StoreError {
    StoreError(Box::new(err))
}

#[derive(Debug)]
pub struct TieredSnapshotRepository<C, S> {
    cache: C,
    store: S,
    read: ReadStrategy,
    write: WriteStrategy,
}

impl<C, S> TieredSnapshotRepository<C, S>
where
    C: SnapshotRepository,
    S: SnapshotRepository,
{
    #[must_use]
    pub fn new(cache: C, store: S) -> Self {
        Self {
            cache,
            store,
            read: ReadStrategy::default(),
            write: WriteStrategy::default(),
        }
    }

    #[must_use]
    pub fn with_strategies(mut self, read: ReadStrategy, write: WriteStrategy) -> Self {
        self.read = read;
        self.write = write;
        self
    }

    pub const fn cache(&self) -> &C {
        &self.cache
    }

    pub const fn store(&self) -> &S {
        &self.store
    }
}

#[async_trait]
impl<C, S> SnapshotRepository for TieredSnapshotRepository<C, S>
where
    C: SnapshotRepository,
    S: SnapshotRepository,
{
    async fn save(&self, record: &SnapshotRecord) -> Result<()> {
        let (cache, store) = (&self.cache, &self.store);
        let id = record.id();
        self.write
            .write(
                record,
                move |r| {
                    let r = r.clone();
                    async move { cache.save(&r).await.map_err(cache_err) }
                },
                move |r| {
                    let r = r.clone();
                    async move { store.save(&r).await.map_err(store_err) }
                },
                move || async move { cache.delete(id).await.map_err(cache_err) },
            )
            .await?;
        debug!(snapshot_id = %id, strategy = ?self.write, "Snapshot saved");
        Ok(())
    }

    async fn load(&self, snapshot_id: Uuid) -> Result<Option<SnapshotRecord>> {
        let (cache, store) = (&self.cache, &self.store);
        let record = self
            .read
            .read(
                move || async move { cache.load(snapshot_id).await.map_err(cache_err) },
                move || async move { store.load(snapshot_id).await.map_err(store_err) },
                move |r: SnapshotRecord| async move { cache.save(&r).await.map_err(cache_err) },
            )
            .await?;
        Ok(record)
    }

    async fn latest(&self, name: &str) -> Result<Option<SnapshotRecord>> {
        let (cache, store) = (&self.cache, &self.store);
        let record = self
            .read
            .read(
                move || async move { cache.latest(name).await.map_err(cache_err) },
                move || async move { store.latest(name).await.map_err(store_err) },
                move |r: SnapshotRecord| async move { cache.save(&r).await.map_err(cache_err) },
            )
            .await?;
        Ok(record)
    }

    /// The cache holds only what this process saw, so listings always
    /// come from the store.
    async fn list(&self, name: &str) -> Result<Vec<SnapshotMeta>> {
        self.store.list(name).await
    }

    async fn delete(&self, snapshot_id: Uuid) -> Result<()> {
        self.store.delete(snapshot_id).await?;
        self.cache.delete(snapshot_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{FileSnapshotRepository, MemorySnapshotRepository};
    use serde_json::json;

    async fn tiered(
        dir: &std::path::Path,
    ) -> TieredSnapshotRepository<MemorySnapshotRepository, FileSnapshotRepository> {
        let store = FileSnapshotRepository::open(dir).await.unwrap();
        TieredSnapshotRepository::new(MemorySnapshotRepository::new(), store)
    }

    #[tokio::test]
    async fn test_write_through_fills_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let repo = tiered(dir.path()).await;
        let record = SnapshotRecord::new("demo", 5, json!({"tick": 5}));

        repo.save(&record).await.unwrap();

        assert!(repo.cache().load(record.id()).await.unwrap().is_some());
        assert!(repo.store().load(record.id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cache_first_populates_on_miss() {
        let dir = tempfile::tempdir().unwrap();
        let record = SnapshotRecord::new("demo", 7, json!({}));
        FileSnapshotRepository::open(dir.path())
            .await
            .unwrap()
            .save(&record)
            .await
            .unwrap();

        let repo = tiered(dir.path()).await;
        assert!(repo.cache().is_empty().await);
        let loaded = repo.latest("demo").await.unwrap().unwrap();
        assert_eq!(loaded.id(), record.id());
        assert_eq!(repo.cache().len().await, 1);
    }

    #[tokio::test]
    async fn test_write_around_leaves_cache_empty() {
        let dir = tempfile::tempdir().unwrap();
        let repo = tiered(dir.path())
            .await
            .with_strategies(ReadStrategy::StoreOnly, WriteStrategy::WriteAround);
        let record = SnapshotRecord::new("demo", 9, json!({}));

        repo.save(&record).await.unwrap();

        assert!(repo.cache().is_empty().await);
        assert_eq!(repo.list("demo").await.unwrap().len(), 1);
        repo.delete(record.id()).await.unwrap();
        assert!(repo.load(record.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_around_drops_stale_cache_copy() {
        let dir = tempfile::tempdir().unwrap();
        let record = SnapshotRecord::new("demo", 11, json!({"v": 1}));
        let repo = tiered(dir.path())
            .await
            .with_strategies(ReadStrategy::CacheFirst, WriteStrategy::WriteAround);
        repo.cache().save(&record).await.unwrap();

        repo.save(&record).await.unwrap();

        assert!(repo.cache().is_empty().await);
        assert!(repo.store().load(record.id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_store_only_reads_never_fill_cache() {
        let dir = tempfile::tempdir().unwrap();
        let record = SnapshotRecord::new("demo", 13, json!({}));
        FileSnapshotRepository::open(dir.path())
            .await
            .unwrap()
            .save(&record)
            .await
            .unwrap();

        let repo = tiered(dir.path())
            .await
            .with_strategies(ReadStrategy::StoreOnly, WriteStrategy::WriteThrough);
        let loaded = repo.latest("demo").await.unwrap().unwrap();
        assert_eq!(loaded.id(), record.id());
        assert!(repo.cache().is_empty().await);
    }
}
