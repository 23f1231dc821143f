//! Small newtype identifiers shared across the migration and replication
//! flows. Kept as distinct types (rather than bare `u32`/`u64`) so a
//! partition ID and an emigration ID can never be swapped at a call site
//! without a compile error — the same motivation as the teacher's
//! `ConnectionId(pub u64)`.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Opaque 64-bit node identifier, unique per process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Partition ID in `[0, partition_count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct PartitionId(pub u32);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `partition_of(key) = hash(digest) mod partition_count`.
///
/// Uses the top 4 bytes of the digest rather than re-hashing it — the
/// digest is already a uniform cryptographic hash, so any fixed-width slice
/// of it is as good a distribution source as hashing it again.
#[must_use]
pub fn partition_of(digest: &crate::digest::Digest, partition_count: u32) -> PartitionId {
    let bytes = digest.as_bytes();
    let top = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    PartitionId(top % partition_count)
}

/// Sender-chosen emigration session ID, monotonically increasing and unique
/// among this process's live sessions (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct EmigId(pub u32);

/// Per-INSERT sequence number within one emigration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct InsertId(pub u32);

/// Process-wide generator for [`EmigId`] and [`InsertId`] values.
///
/// A single process-wide counter per spec.md §3 ("monotonically increasing
/// 32-bit, process-unique while live"); wraps silently after `u32::MAX`
/// sessions/inserts, which is acceptable since only live sessions need to be
/// distinguishable and sessions are short-lived relative to `u32` exhaustion.
#[derive(Debug, Default)]
pub struct IdSequence {
    emig: AtomicU32,
    insert: AtomicU64,
}

impl IdSequence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_emig_id(&self) -> EmigId {
        EmigId(self.emig.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_insert_id(&self) -> InsertId {
        InsertId(self.insert.fetch_add(1, Ordering::Relaxed) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;

    #[test]
    fn partition_of_is_in_range() {
        for i in 0..1000u32 {
            let d = Digest::compute("ns", &i.to_be_bytes());
            let pid = partition_of(&d, 4096);
            assert!(pid.0 < 4096);
        }
    }

    #[test]
    fn partition_of_is_deterministic() {
        let d = Digest::compute("ns", b"key-1");
        assert_eq!(partition_of(&d, 4096), partition_of(&d, 4096));
    }

    #[test]
    fn id_sequence_increments() {
        let seq = IdSequence::new();
        let a = seq.next_emig_id();
        let b = seq.next_emig_id();
        assert_ne!(a, b);
        let i1 = seq.next_insert_id();
        let i2 = seq.next_insert_id();
        assert_ne!(i1, i2);
    }
}
