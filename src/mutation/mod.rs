//! Mutations with optimistic cache patches.
//!
//! Create is applied only once the server answers, since the server assigns
//! identity. Update and delete patch the cache immediately and keep an exact
//! inverse until the server confirms or refuses.

mod coordinator;
mod patch;

pub use coordinator::MutationCoordinator;
pub use patch::{merge, record_id, InverseOp, OptimisticPatch};
