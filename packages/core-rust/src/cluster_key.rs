//! Cluster-key fencing token.
//!
//! The cluster key is bumped by the (out-of-scope) membership subsystem on
//! every composition change and carried on every `MIGRATE`/`RW` message as a
//! fencing token (spec.md §3 invariant 5, §9 "Cluster-key fencing"). This
//! module only provides the local holder every handler reads to compare
//! against an incoming message's `cluster_key` — it does not implement
//! membership or epoch advancement policy.

use std::sync::atomic::{AtomicU64, Ordering};

/// A single fencing epoch value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct ClusterKey(pub u64);

impl ClusterKey {
    pub const INITIAL: Self = Self(0);
}

impl std::fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lock-free holder for the node's current cluster key.
///
/// Mirrors the `AtomicU64` version counter the teacher's
/// `ClusterPartitionTable` uses for its own table version — the same
/// "cheap atomic epoch, `Acquire`/`Release` pair" idiom applies here.
#[derive(Debug)]
pub struct ClusterKeyProvider {
    current: AtomicU64,
}

impl ClusterKeyProvider {
    #[must_use]
    pub fn new(initial: ClusterKey) -> Self {
        Self {
            current: AtomicU64::new(initial.0),
        }
    }

    /// Returns the cluster key in effect right now.
    ///
    /// `Acquire` so that callers observe every state change (partition
    /// table rewrite, reservation invalidation) that happened-before the
    /// epoch bump.
    pub fn current(&self) -> ClusterKey {
        ClusterKey(self.current.load(Ordering::Acquire))
    }

    /// Advances to a new cluster key. No-op (and returns `false`) if
    /// `new_key` is not strictly greater than the current one — epochs only
    /// move forward.
    pub fn advance(&self, new_key: ClusterKey) -> bool {
        let mut prev = self.current.load(Ordering::Relaxed);
        loop {
            if new_key.0 <= prev {
                return false;
            }
            match self.current.compare_exchange_weak(
                prev,
                new_key.0,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => prev = actual,
            }
        }
    }

    /// `true` if `candidate` matches the cluster key in effect now — the
    /// fencing check every receiver performs before applying a mutation.
    pub fn matches(&self, candidate: ClusterKey) -> bool {
        self.current() == candidate
    }
}

impl Default for ClusterKeyProvider {
    fn default() -> Self {
        Self::new(ClusterKey::INITIAL)
    }
}
