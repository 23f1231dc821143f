//! Digest-keyed in-memory storage and the per-namespace wrapper that adds
//! cost accounting used by the migration and replication flows.
//!
//! - **Layer 1** ([`engine`]): [`StorageEngine`], the raw key-value store
//! - **Layer 2** ([`namespace`]): [`Namespace`], which applies the merge
//!   policy and enforces the storage cost budget on every write

pub mod engine;
pub mod memory;
pub mod namespace;

pub use engine::{FetchResult, IterationCursor, StorageEngine};
pub use memory::HashMapStorage;
pub use namespace::Namespace;
