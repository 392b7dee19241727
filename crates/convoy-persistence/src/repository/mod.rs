//! # Repository Module
//!
//! Snapshot repository backends.

pub mod file;
pub mod memory;
pub mod tiered;
pub mod traits;

pub use file::FileSnapshotRepository;
pub use memory::MemorySnapshotRepository;
pub use tiered::TieredSnapshotRepository;
pub use traits::{SnapshotMeta, SnapshotRecord, SnapshotRepository};
