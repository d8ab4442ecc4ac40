//! Cache-first REST data access with optimistic mutations and session refresh.
//!
//! Entities are described by route descriptors, either configured statically or
//! derived by convention the first time an unknown name is used. Reads go through
//! a shared cache with single-flight fetches; updates and deletes patch the cache
//! immediately and roll back exactly if the server refuses.

pub mod cache;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod executor;
pub mod mutation;
pub mod query;
pub mod routes;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use client::DataClient;
pub use error::{SyncError, SyncResult};
