//! Read strategy implementations using enum dispatch.

use std::fmt::Debug;
use std::future::Future;

/// Which tier answers a snapshot read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadStrategy {
    /// Check the cache first, fall back to the store on a miss and keep
    /// the loaded snapshot in the cache
    #[default]
    CacheFirst,
    /// Always read the store; the cache is never consulted or filled
    StoreOnly,
}

impl ReadStrategy {
    /// Execute a read according to the strategy.
    ///
    /// - `cache_fn`: reads from the cache tier
    /// - `store_fn`: reads from the durable store
    /// - `populate_fn`: copies a store hit into the cache
    pub async fn read<T, CacheFut, StoreFut, PopulateFut>(
        &self,
        cache_fn: impl FnOnce() -> CacheFut,
        store_fn: impl FnOnce() -> StoreFut,
        populate_fn: impl FnOnce(T) -> PopulateFut,
    ) -> Result<Option<T>, ReadError>
    where
        T: Clone + Debug,
        CacheFut: Future<Output = Result<Option<T>, CacheError>>,
        StoreFut: Future<Output = Result<Option<T>, StoreError>>,
        PopulateFut: Future<Output = Result<(), CacheError>>,
    {
        match self {
            Self::CacheFirst => {
                match cache_fn().await {
                    Ok(Some(value)) => {
                        tracing::debug!("Cache hit");
                        return Ok(Some(value));
                    }
                    Ok(None) => tracing::debug!("Cache miss, falling back to store"),
                    Err(e) => tracing::warn!(error = %e, "Cache error, falling back to store"),
                }
                let result = store_fn().await.map_err(ReadError::Store)?;
                if let Some(value) = &result {
                    if let Err(e) = populate_fn(value.clone()).await {
                        tracing::warn!(error = %e, "Failed to populate cache");
                    }
                }
                Ok(result)
            }
            Self::StoreOnly => store_fn().await.map_err(ReadError::Store),
        }
    }
}

/// Cache tier failure.
#[derive(Debug, thiserror::Error)]
#[error("Cache error: {0}")]
pub struct CacheError(#[from] pub Box<dyn std::error::Error + Send + Sync>);

/// Store tier failure.
#[derive(Debug, thiserror::Error)]
#[error("Store error: {0}")]
pub struct StoreError(#[from] pub Box<dyn std::error::Error + Send + Sync>);

/// Read operation error.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::{Ready, ready};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_populate(_: u32) -> Ready<Result<(), CacheError>> {
        ready(Ok(()))
    }

    #[tokio::test]
    async fn test_cache_first_hit() {
        let result = ReadStrategy::CacheFirst
            .read(|| async { Ok(Some(42)) }, || async { Ok(Some(99)) }, no_populate)
            .await
            .unwrap();
        assert_eq!(result, Some(42));
    }

    #[tokio::test]
    async fn test_cache_first_miss_populates() {
        let populated = Arc::new(AtomicU32::new(0));
        let sink = populated.clone();
        let result = ReadStrategy::CacheFirst
            .read(
                || async { Ok(None) },
                || async { Ok(Some(99)) },
                move |value: u32| {
                    sink.store(value, Ordering::SeqCst);
                    async { Ok(()) }
                },
            )
            .await
            .unwrap();
        assert_eq!(result, Some(99));
        assert_eq!(populated.load(Ordering::SeqCst), 99);
    }

    #[tokio::test]
    async fn test_cache_failure_falls_back_to_store() {
        let result = ReadStrategy::CacheFirst
            .read(
                || async { Err(CacheError("down".into())) },
                || async { Ok(Some(99)) },
                no_populate,
            )
            .await
            .unwrap();
        assert_eq!(result, Some(99));
    }

    #[tokio::test]
    async fn test_store_only_skips_cache() {
        let populated = Arc::new(AtomicU32::new(0));
        let sink = populated.clone();
        let result = ReadStrategy::StoreOnly
            .read(
                || async { Ok(Some(42)) },
                || async { Ok(Some(99)) },
                move |value: u32| {
                    sink.store(value, Ordering::SeqCst);
                    async { Ok(()) }
                },
            )
            .await
            .unwrap();
        assert_eq!(result, Some(99));
        assert_eq!(populated.load(Ordering::SeqCst), 0);
    }
}
