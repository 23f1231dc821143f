//! Session bookkeeping for both sides of a `MIGRATE` transfer: the
//! emigrator's unacknowledged-insert tracking, and the immigrator's
//! at-most-once DONE observation (spec.md §3 "Emigration session" /
//! "Immigration session").

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use partdb_core::{ClusterKey, Digest, EmigId, InsertId, NodeId, PartitionId, RecordMeta};

use crate::error::{NodeError, NodeResult};
use crate::pickle::Pickle;

/// One record awaiting acknowledgement, plus enough to re-encode and
/// resend it if the ack doesn't arrive in time.
#[derive(Debug, Clone)]
pub struct PendingInsert {
    pub digest: Digest,
    pub meta: RecordMeta,
    pub pickle: Pickle,
    pub sent_at: Instant,
    pub attempts: u32,
    /// On-wire `Insert` message size, counted against the session's
    /// `bytes_in_flight` backpressure valve (spec.md §3/§4.C).
    pub wire_size: u64,
}

/// Tracks one emigration session's in-flight inserts.
pub struct EmigrationSession {
    pub emig_id: EmigId,
    pub partition: PartitionId,
    pub dest: NodeId,
    pub cluster_key: ClusterKey,
    pending: HashMap<InsertId, PendingInsert>,
    bytes_in_flight: u64,
}

impl EmigrationSession {
    #[must_use]
    pub fn new(emig_id: EmigId, partition: PartitionId, dest: NodeId, cluster_key: ClusterKey) -> Self {
        Self {
            emig_id,
            partition,
            dest,
            cluster_key,
            pending: HashMap::new(),
            bytes_in_flight: 0,
        }
    }

    pub fn track(&mut self, insert_id: InsertId, digest: Digest, meta: RecordMeta, pickle: Pickle, wire_size: u64) {
        self.bytes_in_flight += wire_size;
        self.pending.insert(
            insert_id,
            PendingInsert {
                digest,
                meta,
                pickle,
                sent_at: Instant::now(),
                attempts: 1,
                wire_size,
            },
        );
    }

    /// Acknowledges `insert_id`.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::DuplicateAck`] if `insert_id` is not currently
    /// pending -- either it was never sent, or it was already acked once.
    pub fn ack(&mut self, insert_id: InsertId) -> NodeResult<()> {
        let pending = self.pending.remove(&insert_id).ok_or(NodeError::DuplicateAck(insert_id.0))?;
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(pending.wire_size);
        Ok(())
    }

    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.pending.is_empty()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Bytes of not-yet-acked `Insert` messages outstanding to this
    /// session's destination -- the backpressure valve spec.md §3/§4.C
    /// caps at 32 MiB (testable property #5).
    #[must_use]
    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    /// Returns inserts that have been outstanding longer than `max_age`
    /// and bumps their attempt counter, for the retransmit loop to resend.
    pub fn due_for_retransmit(&mut self, max_age: Duration) -> Vec<(InsertId, PendingInsert)> {
        let now = Instant::now();
        let mut due = Vec::new();
        for (id, pending) in &mut self.pending {
            if now.duration_since(pending.sent_at) >= max_age {
                pending.sent_at = now;
                pending.attempts += 1;
                due.push((*id, pending.clone()));
            }
        }
        due
    }
}

/// Immigration-side session: which `(source, emig_id)` this node is
/// receiving a partition from, plus `done_recv` -- an atomic counter that
/// guards the "notify downstream exactly once" invariant (spec.md §3
/// invariant 4) no matter how many times `Done` is retransmitted.
pub struct ImmigrationSession {
    pub source: NodeId,
    pub partition: PartitionId,
    pub cluster_key: ClusterKey,
    pub started_at: Instant,
    done_recv: AtomicU64,
    done_received_at: Mutex<Option<Instant>>,
}

impl ImmigrationSession {
    #[must_use]
    pub fn new(source: NodeId, partition: PartitionId, cluster_key: ClusterKey) -> Self {
        Self {
            source,
            partition,
            cluster_key,
            started_at: Instant::now(),
            done_recv: AtomicU64::new(0),
            done_received_at: Mutex::new(None),
        }
    }

    /// Records an observed `Done`. Returns `true` only for the call that
    /// transitions this session from in-flight to done -- every
    /// subsequent call (a retransmitted `Done`) returns `false` so the
    /// caller fires its "migration complete" notification at most once.
    pub fn mark_done(&self) -> bool {
        let previous = self.done_recv.fetch_add(1, Ordering::AcqRel);
        if previous == 0 {
            *self.done_received_at.lock() = Some(Instant::now());
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done_recv.load(Ordering::Acquire) > 0
    }

    #[must_use]
    pub fn done_recv_count(&self) -> u64 {
        self.done_recv.load(Ordering::Acquire)
    }

    /// Time since `Done` was first observed, or `None` if still in-flight.
    #[must_use]
    pub fn done_age(&self) -> Option<Duration> {
        self.done_received_at.lock().map(|at| at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn meta() -> RecordMeta {
        RecordMeta {
            generation: 1,
            void_time: 0,
            last_update_time: 1,
            set_id: 0,
        }
    }

    #[test]
    fn track_then_ack_drains() {
        let mut session = EmigrationSession::new(EmigId(1), PartitionId(0), NodeId(2), ClusterKey(1));
        session.track(InsertId(0), Digest::compute("ns", b"a"), meta(), Pickle::Bins(BTreeMap::new()), 64);
        assert!(!session.is_drained());
        session.ack(InsertId(0)).unwrap();
        assert!(session.is_drained());
    }

    #[test]
    fn acking_unknown_insert_is_duplicate_ack() {
        let mut session = EmigrationSession::new(EmigId(1), PartitionId(0), NodeId(2), ClusterKey(1));
        let err = session.ack(InsertId(9)).unwrap_err();
        assert!(matches!(err, NodeError::DuplicateAck(9)));
    }

    #[test]
    fn double_ack_is_rejected() {
        let mut session = EmigrationSession::new(EmigId(1), PartitionId(0), NodeId(2), ClusterKey(1));
        session.track(InsertId(0), Digest::compute("ns", b"a"), meta(), Pickle::Bins(BTreeMap::new()), 64);
        session.ack(InsertId(0)).unwrap();
        assert!(session.ack(InsertId(0)).is_err());
    }

    #[test]
    fn due_for_retransmit_respects_age() {
        let mut session = EmigrationSession::new(EmigId(1), PartitionId(0), NodeId(2), ClusterKey(1));
        session.track(InsertId(0), Digest::compute("ns", b"a"), meta(), Pickle::Bins(BTreeMap::new()), 64);
        assert!(session.due_for_retransmit(Duration::from_secs(60)).is_empty());
        let due = session.due_for_retransmit(Duration::from_secs(0));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1.attempts, 2);
    }

    #[test]
    fn immigration_session_starts_not_done() {
        let session = ImmigrationSession::new(NodeId(1), PartitionId(0), ClusterKey(1));
        assert!(!session.is_done());
        assert!(session.done_age().is_none());
    }

    #[test]
    fn mark_done_fires_only_on_first_call() {
        let session = ImmigrationSession::new(NodeId(1), PartitionId(0), ClusterKey(1));
        assert!(session.mark_done());
        assert!(!session.mark_done());
        assert!(!session.mark_done());
        assert_eq!(session.done_recv_count(), 3);
        assert!(session.is_done());
        assert!(session.done_age().is_some());
    }

    #[test]
    fn bytes_in_flight_tracks_tracked_and_acked_inserts() {
        let mut session = EmigrationSession::new(EmigId(1), PartitionId(0), NodeId(2), ClusterKey(1));
        session.track(InsertId(0), Digest::compute("ns", b"a"), meta(), Pickle::Bins(BTreeMap::new()), 100);
        session.track(InsertId(1), Digest::compute("ns", b"b"), meta(), Pickle::Bins(BTreeMap::new()), 200);
        assert_eq!(session.bytes_in_flight(), 300);
        session.ack(InsertId(0)).unwrap();
        assert_eq!(session.bytes_in_flight(), 200);
        session.ack(InsertId(1)).unwrap();
        assert_eq!(session.bytes_in_flight(), 0);
    }
}
