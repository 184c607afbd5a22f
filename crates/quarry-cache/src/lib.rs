//! Singleflight result cache for Quarry.
//!
//! The [`quarry_core::ports::CacheStore`] port guarantees at most one
//! concurrent computation per cache key; this crate provides the
//! wait-with-backoff coordination on top of it, plus in-memory adapters
//! for local development and tests.

pub mod coordinator;
pub mod memory;

pub use coordinator::{WaitPolicy, acquire_or_wait};
pub use memory::{MemoryCacheStore, MemoryJobRepository, MemorySectionStore};
