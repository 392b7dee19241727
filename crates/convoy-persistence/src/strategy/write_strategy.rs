//! Write strategy implementations using enum dispatch.

use std::fmt::Debug;
use std::future::Future;

use super::read_strategy::{CacheError, StoreError};

/// Which tiers a snapshot write lands in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteStrategy {
    /// Write the store, then the cache
    #[default]
    WriteThrough,
    /// Write the store only and drop any cached copy of the snapshot
    WriteAround,
}

impl WriteStrategy {
    /// Execute a write according to the strategy.
    ///
    /// - `cache_fn`: writes to the cache tier
    /// - `store_fn`: writes to the durable store
    /// - `invalidate_fn`: drops the cache entry
    ///
    /// A store failure is returned; cache failures are only logged.
    pub async fn write<T, CacheFut, StoreFut, InvalidateFut>(
        &self,
        value: &T,
        cache_fn: impl FnOnce(&T) -> CacheFut,
        store_fn: impl FnOnce(&T) -> StoreFut,
        invalidate_fn: impl FnOnce() -> InvalidateFut,
    ) -> Result<(), WriteError>
    where
        T: Debug,
        CacheFut: Future<Output = Result<(), CacheError>>,
        StoreFut: Future<Output = Result<(), StoreError>>,
        InvalidateFut: Future<Output = Result<(), CacheError>>,
    {
        store_fn(value).await.map_err(WriteError::Store)?;
        match self {
            Self::WriteThrough => {
                if let Err(e) = cache_fn(value).await {
                    tracing::warn!(error = %e, "Failed to write to cache");
                }
            }
            Self::WriteAround => {
                if let Err(e) = invalidate_fn().await {
                    tracing::warn!(error = %e, "Failed to invalidate cache");
                }
            }
        }
        Ok(())
    }
}

/// Write operation error.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
