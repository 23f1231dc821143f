//! Low-level storage engine trait and cursor-based iteration types.
//!
//! Defines [`StorageEngine`], the innermost storage layer. Implementations
//! provide digest-keyed record storage with cursor-based iteration, used
//! by the emigrator to walk a partition and by the immigrator/replicated
//! writer to apply inbound records.

use partdb_core::{partition_of, Digest, PartitionId, Record};

/// Opaque cursor for resumable iteration over storage entries.
///
/// Implementations encode their internal position in the `state` field.
/// Consumers should treat `state` as opaque and only check `finished`.
#[derive(Debug, Clone)]
pub struct IterationCursor {
    pub state: Vec<u8>,
    pub finished: bool,
}

impl IterationCursor {
    #[must_use]
    pub fn start() -> Self {
        Self {
            state: Vec::new(),
            finished: false,
        }
    }
}

/// Result of a cursor-based fetch operation.
#[derive(Debug)]
pub struct FetchResult<T> {
    pub items: Vec<T>,
    pub next_cursor: IterationCursor,
}

/// Low-level digest-keyed record storage with cursor-based iteration.
///
/// Implementations are in-memory. All operations are synchronous, wrapped
/// in `Arc<dyn StorageEngine>` for sharing across async boundaries.
pub trait StorageEngine: Send + Sync + 'static {
    /// Insert or replace a record by digest. Returns the previous record if any.
    fn put(&self, digest: Digest, record: Record) -> Option<Record>;

    /// Retrieve a record by digest, or `None` if not present.
    fn get(&self, digest: &Digest) -> Option<Record>;

    /// Remove a record by digest, returning the removed record.
    fn remove(&self, digest: &Digest) -> Option<Record>;

    fn contains_key(&self, digest: &Digest) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool;

    fn clear(&self);

    /// Estimated heap cost of all stored entries in bytes.
    fn estimated_cost(&self) -> u64;

    /// Fetch at least `size` entries (digest + record) starting from `cursor`.
    fn fetch_entries(&self, cursor: &IterationCursor, size: usize) -> FetchResult<(Digest, Record)>;

    /// Return a point-in-time snapshot of all entries.
    fn snapshot_iter(&self) -> Vec<(Digest, Record)>;

    /// Return all entries belonging to the given partition, used by the
    /// emigrator to walk one partition's data for a migration session.
    ///
    /// Default implementation filters a full snapshot; implementations
    /// backed by a partition-sharded map may override this for efficiency.
    fn entries_in_partition(&self, partition_count: u32, partition: PartitionId) -> Vec<(Digest, Record)> {
        self.snapshot_iter()
            .into_iter()
            .filter(|(digest, _)| partition_of(digest, partition_count) == partition)
            .collect()
    }
}
