//! # Strategy Module
//!
//! Enum-dispatched access patterns for a two-tier snapshot repository: a fast
//! cache tier in front of a durable store.
//!
//! ## Read Strategies
//! - `CacheFirst` - Check the cache, fall back to the store on a miss (default)
//! - `StoreOnly` - Skip the cache entirely
//!
//! ## Write Strategies
//! - `WriteThrough` - Write the store, then the cache (default)
//! - `WriteAround` - Write the store only, invalidate the cache

pub mod read_strategy;
pub mod write_strategy;

pub use read_strategy::{CacheError, ReadError, ReadStrategy, StoreError};
pub use write_strategy::{WriteError, WriteStrategy};
