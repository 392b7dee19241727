//! # Convoy Persistence Library
//!
//! Snapshot storage for the convoy simulator.
//!
//! ## Architecture
//!
//! Repository pattern with pluggable enum-dispatched strategies for the
//! access pattern between a fast tier and a durable one:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Simulator / CLI                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  SnapshotRepository trait                    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 TieredSnapshotRepository                     │
//! │              (applies read/write strategies)                 │
//! └─────────────────────────────────────────────────────────────┘
//!                    │                   │
//!                    ▼                   ▼
//! ┌─────────────────────────┐   ┌──────────────────────────────┐
//! │  MemorySnapshotRepo     │   │   FileSnapshotRepository     │
//! │  (this process)         │   │   (source of truth, JSON)    │
//! └─────────────────────────┘   └──────────────────────────────┘
//! ```
//!
//! Snapshot bodies are opaque JSON values; the simulator owns their format.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use convoy_persistence::{open_tiered, ReadStrategy, SnapshotRecord, SnapshotRepository, WriteStrategy};
//!
//! let repo = open_tiered("./snapshots", ReadStrategy::CacheFirst, WriteStrategy::WriteThrough).await?;
//! repo.save(&SnapshotRecord::new("demo", tick, body)).await?;
//! let resumed = repo.latest("demo").await?;
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod repository;
pub mod strategy;

pub use error::{PersistenceError, Result};
pub use repository::{
    FileSnapshotRepository, MemorySnapshotRepository, SnapshotMeta, SnapshotRecord,
    SnapshotRepository, TieredSnapshotRepository,
};
pub use strategy::{ReadStrategy, WriteStrategy};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Memory cache in front of JSON files under `dir`.
///
/// # Errors
///
/// Returns an error if `dir` cannot be created.
pub async fn open_tiered(
    dir: impl Into<std::path::PathBuf>,
    read: ReadStrategy,
    write: WriteStrategy,
) -> Result<TieredSnapshotRepository<MemorySnapshotRepository, FileSnapshotRepository>> {
    let store = FileSnapshotRepository::open(dir).await?;
    Ok(TieredSnapshotRepository::new(MemorySnapshotRepository::new(), store)
        .with_strategies(read, write))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[tokio::test]
    async fn test_open_tiered_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("snapshots");
        let repo = open_tiered(&target, ReadStrategy::default(), WriteStrategy::default())
            .await
            .unwrap();
        assert!(target.is_dir());
        assert!(repo.list("demo").await.unwrap().is_empty());
    }
}
