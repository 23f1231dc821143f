//! Coordinator-side bookkeeping for one synchronous replicated write:
//! which replicas are still outstanding, and what each one said.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use partdb_core::{ClusterKey, Digest, NodeId, RecordMeta};

use crate::pickle::Pickle;
use crate::replicate::message::{RwId, WriteOutcome};

/// One replica's current status for a pending write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaStatus {
    Outstanding,
    Acked(WriteOutcome),
}

/// A write the coordinator is waiting on every replica to acknowledge.
pub struct PendingWrite {
    pub digest: Digest,
    pub meta: RecordMeta,
    pub pickle: Pickle,
    pub cluster_key: ClusterKey,
    started_at: Instant,
    last_sent: HashMap<NodeId, Instant>,
    replicas: HashMap<NodeId, ReplicaStatus>,
}

impl PendingWrite {
    #[must_use]
    pub fn new(digest: Digest, meta: RecordMeta, pickle: Pickle, cluster_key: ClusterKey, replicas: &[NodeId]) -> Self {
        let now = Instant::now();
        Self {
            digest,
            meta,
            pickle,
            cluster_key,
            started_at: now,
            last_sent: replicas.iter().map(|n| (*n, now)).collect(),
            replicas: replicas.iter().map(|n| (*n, ReplicaStatus::Outstanding)).collect(),
        }
    }

    /// Records `from`'s response. Returns `true` if this was the first
    /// response recorded for that replica (a duplicate ack is ignored). A
    /// `Fenced` outcome is also ignored: spec.md §4.E point 6 says
    /// `CLUSTER_KEY_MISMATCH` acks don't count toward completion, since
    /// rebalance will reissue the write under the new cluster key -- the
    /// replica stays `Outstanding` so `due_for_retransmit` keeps resending.
    pub fn ack(&mut self, from: NodeId, outcome: WriteOutcome) -> bool {
        if outcome == WriteOutcome::Fenced {
            return false;
        }
        match self.replicas.get_mut(&from) {
            Some(status @ ReplicaStatus::Outstanding) => {
                *status = ReplicaStatus::Acked(outcome);
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.replicas
            .values()
            .all(|s| !matches!(s, ReplicaStatus::Outstanding))
    }

    /// `true` if every replica that responded applied the write (stale
    /// responses still count as success: the replica's copy is already
    /// at least as fresh).
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.replicas.values().all(|s| {
            matches!(
                s,
                ReplicaStatus::Acked(WriteOutcome::Applied | WriteOutcome::Stale)
            )
        })
    }

    /// The first replica response that wasn't a success, if any -- used to
    /// surface a specific reason when [`PendingWrite::all_succeeded`] is
    /// `false` rather than collapsing every rejection to one generic error.
    /// Never `Fenced`: [`PendingWrite::ack`] never records that outcome.
    #[must_use]
    pub fn first_failure(&self) -> Option<WriteOutcome> {
        self.replicas.values().find_map(|s| match s {
            ReplicaStatus::Acked(outcome @ (WriteOutcome::OutOfSpace | WriteOutcome::Forbidden)) => Some(*outcome),
            _ => None,
        })
    }

    #[must_use]
    pub fn outstanding(&self) -> Vec<NodeId> {
        self.replicas
            .iter()
            .filter(|(_, s)| matches!(s, ReplicaStatus::Outstanding))
            .map(|(n, _)| *n)
            .collect()
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Outstanding replicas that haven't been (re)sent to within
    /// `backoff`, bumping their `last_sent` stamp as they're returned.
    pub fn due_for_retransmit(&mut self, backoff: Duration) -> Vec<NodeId> {
        let now = Instant::now();
        let mut due = Vec::new();
        for node in self.outstanding() {
            let last = self.last_sent.get(&node).copied().unwrap_or(self.started_at);
            if now.duration_since(last) >= backoff {
                self.last_sent.insert(node, now);
                due.push(node);
            }
        }
        due
    }
}

/// Lock-striped table of in-flight replicated writes, sharded by `RwId`
/// so two writes to unrelated digests don't contend on one global mutex
/// -- spec.md §5's "all hashes used for cross-thread lookup are
/// lock-striped", applied to the coordinator's request table the same
/// way the emigration/immigration session tables use a `DashMap`.
pub struct PendingWriteTable {
    shards: Vec<Mutex<HashMap<RwId, PendingWrite>>>,
}

impl PendingWriteTable {
    #[must_use]
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard_for(&self, rw_id: RwId) -> &Mutex<HashMap<RwId, PendingWrite>> {
        &self.shards[rw_id.0 as usize % self.shards.len()]
    }

    pub fn insert(&self, rw_id: RwId, write: PendingWrite) {
        self.shard_for(rw_id).lock().insert(rw_id, write);
    }

    pub fn remove(&self, rw_id: RwId) -> Option<PendingWrite> {
        self.shard_for(rw_id).lock().remove(&rw_id)
    }

    /// Runs `f` against the pending write for `rw_id` if it's still
    /// tracked, returning `None` once it has been removed (completed,
    /// timed out, or never existed).
    pub fn with_mut<R>(&self, rw_id: RwId, f: impl FnOnce(&mut PendingWrite) -> R) -> Option<R> {
        self.shard_for(rw_id).lock().get_mut(&rw_id).map(f)
    }

    #[must_use]
    pub fn is_complete(&self, rw_id: RwId) -> bool {
        self.shard_for(rw_id)
            .lock()
            .get(&rw_id)
            .is_some_and(PendingWrite::is_complete)
    }
}
