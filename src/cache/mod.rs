//! Normalized query-result cache.
//!
//! This module is entity-agnostic:
//! - One entry per (entity, operation identifier, serialized args)
//! - Subscribers see every write synchronously via watch channels
//! - Entries without subscribers are evicted after a grace period
//! - Tag invalidation marks entries stale for a forced refetch

mod store;
mod traits;

pub use store::{CacheStore, Subscription};
pub use traits::{
  CacheEntry, CacheKey, CacheResult, CacheSource, Pagination, QueryArgs, QueryData, QueryKind,
  Record, Tag, DEFAULT_PAGE_LIMIT, DEFAULT_PAGE_NUMBER, PAGE_LIMIT, PAGE_NUMBER,
};
