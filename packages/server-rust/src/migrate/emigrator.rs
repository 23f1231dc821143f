//! Emigration: streaming one partition's records to a destination node.
//!
//! Work is handed to a small pool of tokio tasks (`n_migrate_threads`)
//! pulling jobs off a shared [`EmigrationQueue`] (spec.md §4.C
//! "Scheduling"), each worker watching a `watch<bool>` shutdown signal --
//! the same pool-plus-shutdown-watch shape as the teacher's
//! `ShutdownController`, generalized from "stop accepting requests" to
//! "stop picking up migration jobs".

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use partdb_core::{ClusterKeyProvider, EmigId, IdSequence, NodeId, PartitionId};
use rand::Rng;
use tokio::sync::watch;
use tokio_util::codec::Encoder;

use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult};
use crate::fabric::{Fabric, FabricMessage, SendError};
use crate::migrate::message::{MigrateMessage, StartAckResult};
use crate::migrate::queue::EmigrationQueue;
use crate::migrate::session::EmigrationSession;
use crate::pickle::{Pickle, PickleCodec};
use crate::reservation::{PartitionRegistry, PartitionState};
use crate::storage::Namespace;

/// Cap on a session's unacknowledged `Insert` bytes before the streaming
/// loop blocks (spec.md §3 "Emigration session" / §4.C step 5, testable
/// property #5: "`bytes_in_flight` never exceeds 32 MiB + largest_pickle").
const BYTES_IN_FLIGHT_CAP: u64 = 32 * 1024 * 1024;

/// One partition to migrate to one destination.
#[derive(Debug, Clone, Copy)]
pub struct MigrationJob {
    pub partition: PartitionId,
    pub dest: NodeId,
}

pub struct Emigrator {
    config: NodeConfig,
    namespace: Arc<Namespace>,
    fabric: Arc<dyn Fabric>,
    cluster_key: Arc<ClusterKeyProvider>,
    partitions: Arc<PartitionRegistry>,
    ids: IdSequence,
    sessions: DashMap<EmigId, Mutex<EmigrationSession>>,
}

impl Emigrator {
    #[must_use]
    pub fn new(
        config: NodeConfig,
        namespace: Arc<Namespace>,
        fabric: Arc<dyn Fabric>,
        cluster_key: Arc<ClusterKeyProvider>,
        partitions: Arc<PartitionRegistry>,
    ) -> Self {
        crate::metrics::init_from_config(&config);
        Self {
            config,
            namespace,
            fabric,
            cluster_key,
            partitions,
            ids: IdSequence::new(),
            sessions: DashMap::new(),
        }
    }

    /// Opens an emigration session for `job`, reserving the partition and
    /// sending the `Start` handshake.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Forbidden`] if the partition is already
    /// migrating, or a fabric send error if `Start` cannot be enqueued.
    pub fn start_session(&self, job: MigrationJob) -> NodeResult<EmigId> {
        self.partitions
            .begin_migration(job.partition, PartitionState::Emigrating { dest: job.dest })?;

        let emig_id = self.ids.next_emig_id();
        let cluster_key = self.cluster_key.current();
        let session = EmigrationSession::new(emig_id, job.partition, job.dest, cluster_key);
        self.sessions.insert(emig_id, Mutex::new(session));

        let start = MigrateMessage::Start {
            emig_id,
            partition: job.partition,
            cluster_key,
            source: self.config.node_id,
        };
        if let Err(e) = self.send(job.dest, job.partition, &start) {
            self.abort_session(emig_id);
            return Err(e);
        }
        tracing::debug!(?emig_id, partition = job.partition.0, dest = job.dest.0, "emigration session opened");
        crate::metrics::migrate_session_started();
        Ok(emig_id)
    }

    /// Streams every record in the session's partition to its destination,
    /// drains any still-unacked inserts (spec.md §3 invariant 3, §4.C:
    /// "the session cannot send DONE until [the reinsert table is
    /// empty]"), then sends `Done`. Aborts early (without error) if the
    /// cluster key has advanced since the session started -- a
    /// soft-cancel.
    ///
    /// # Errors
    ///
    /// Returns a fabric send error if a message cannot be enqueued.
    pub fn run_session(&self, emig_id: EmigId) -> NodeResult<()> {
        let Some((partition, dest)) = self.sessions.get(&emig_id).map(|entry| {
            let session = entry.lock();
            (session.partition, session.dest)
        }) else {
            return Ok(());
        };

        let _reservation = self.partitions.reserve(partition);

        let entries = self
            .namespace
            .storage()
            .entries_in_partition(self.config.partition_count, partition);

        for (digest, record) in entries {
            if !self.cluster_key_still_matches(emig_id) {
                tracing::warn!(?emig_id, partition = partition.0, "cluster key advanced mid-emigration, aborting session");
                self.abort_session(emig_id);
                return Ok(());
            }

            self.wait_for_backpressure(emig_id);

            let pickle = if record.is_tombstone() {
                Pickle::Drop
            } else {
                Pickle::Bins(record.bins.clone())
            };

            let mut buf = bytes::BytesMut::new();
            let mut codec = PickleCodec;
            codec
                .encode(pickle.clone(), &mut buf)
                .map_err(|e| NodeError::PickleMalformed(e.to_string()))?;

            let insert_id = self.ids.next_insert_id();
            if let Some(entry) = self.sessions.get(&emig_id) {
                entry.lock().track(insert_id, digest, record.meta, pickle, buf.len() as u64);
            }

            let msg = MigrateMessage::Insert {
                emig_id,
                insert_id,
                digest,
                meta: record.meta,
                pickle: buf.to_vec(),
            };
            if self.send_in_session(emig_id, partition, dest, &msg).is_err() {
                // Fatal (no-node) or retry budget exhausted (persistent
                // queue-full): send_in_session already aborted the
                // session, nothing further to stream.
                return Ok(());
            }
            crate::metrics::migrate_insert_sent(partition);
        }

        for _ in 0..self.config.replica_max_attempts {
            if self.pending_count(emig_id) == 0 {
                break;
            }
            let jitter_ms = rand::rng().random_range(0..=self.config.migrate_throttle_delay.as_millis() as u64);
            std::thread::sleep(self.config.replica_retransmit_backoff + std::time::Duration::from_millis(jitter_ms));
            if self.retransmit_due(emig_id).is_err() {
                return Ok(());
            }
        }

        if self.send_in_session(emig_id, partition, dest, &MigrateMessage::Done { emig_id }).is_err() {
            return Ok(());
        }
        tracing::debug!(?emig_id, partition = partition.0, pending = self.pending_count(emig_id), "emigration stream complete, done sent");
        Ok(())
    }

    /// Sends `msg` for a live session, distinguishing spec.md §4.C's two
    /// failure classes: `QueueFull` is transient and retried with a short
    /// sleep up to a bounded number of attempts; `NoNode` is fatal and
    /// aborts the session immediately so rebalance can reissue it
    /// elsewhere (spec.md §7).
    fn send_in_session(&self, emig_id: EmigId, partition: PartitionId, dest: NodeId, msg: &MigrateMessage) -> NodeResult<()> {
        const MAX_QUEUE_FULL_RETRIES: u32 = 5;
        let mut attempts = 0;
        loop {
            match self.send(dest, partition, msg) {
                Ok(()) => return Ok(()),
                Err(NodeError::QueueFull(_)) if attempts < MAX_QUEUE_FULL_RETRIES => {
                    attempts += 1;
                    tracing::debug!(?emig_id, partition = partition.0, attempts, "fabric queue full, backing off");
                    std::thread::sleep(self.config.migrate_throttle_delay);
                }
                Err(e @ NodeError::NoNode(_)) => {
                    tracing::warn!(?emig_id, partition = partition.0, "destination unreachable, aborting session");
                    self.abort_session(emig_id);
                    crate::metrics::migrate_session_cancelled();
                    return Err(e);
                }
                Err(e) => {
                    self.abort_session(emig_id);
                    return Err(e);
                }
            }
        }
    }

    /// Applies an ack/cancel message from the destination.
    pub fn handle_incoming(&self, msg: MigrateMessage) -> NodeResult<()> {
        match msg {
            MigrateMessage::StartAck { emig_id, result } => {
                match result {
                    StartAckResult::Ok | StartAckResult::Eagain => {}
                    StartAckResult::AlreadyDone => {
                        tracing::debug!(?emig_id, "destination already holds this session, completing locally");
                        self.complete_session(emig_id);
                        crate::metrics::migrate_session_completed();
                    }
                    StartAckResult::Fail => {
                        tracing::warn!(?emig_id, "start rejected by destination, aborting session");
                        self.abort_session(emig_id);
                    }
                }
                Ok(())
            }
            MigrateMessage::InsertAck { emig_id, insert_id } => {
                let Some(entry) = self.sessions.get(&emig_id) else {
                    return Err(NodeError::DuplicateAck(insert_id.0));
                };
                let result = entry.lock().ack(insert_id);
                if result.is_ok() {
                    crate::metrics::migrate_insert_acked(entry.lock().partition);
                }
                result
            }
            MigrateMessage::DoneAck { emig_id } => {
                tracing::debug!(?emig_id, "emigration session complete");
                self.complete_session(emig_id);
                crate::metrics::migrate_session_completed();
                Ok(())
            }
            MigrateMessage::Cancel { emig_id } => {
                tracing::warn!(?emig_id, "emigration session cancelled by destination");
                self.abort_session(emig_id);
                crate::metrics::migrate_session_cancelled();
                Ok(())
            }
            MigrateMessage::Start { .. }
            | MigrateMessage::Insert { .. }
            | MigrateMessage::Done { .. } => Ok(()),
        }
    }

    /// Blocks the streaming loop while the session's unacked `Insert`
    /// bytes exceed [`BYTES_IN_FLIGHT_CAP`] -- spec.md §4.C step 5's
    /// backpressure valve, re-checked every 1 ms per §5's "`bytes_in_flight`
    /// backoff loop (sleep 1 ms)". Rechecks the cluster key between sleeps
    /// so a fenced session doesn't spin here forever; `run_session`'s own
    /// fencing check catches the abort on the next iteration.
    fn wait_for_backpressure(&self, emig_id: EmigId) {
        while self
            .sessions
            .get(&emig_id)
            .is_some_and(|entry| entry.lock().bytes_in_flight() > BYTES_IN_FLIGHT_CAP)
        {
            if !self.cluster_key_still_matches(emig_id) {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    fn cluster_key_still_matches(&self, emig_id: EmigId) -> bool {
        self.sessions
            .get(&emig_id)
            .is_some_and(|entry| entry.lock().cluster_key == self.cluster_key.current())
    }

    fn complete_session(&self, emig_id: EmigId) {
        if let Some((_, session)) = self.sessions.remove(&emig_id) {
            let partition = session.lock().partition;
            self.partitions.end_migration(partition, self.config.partition_drain_timeout);
        }
    }

    fn abort_session(&self, emig_id: EmigId) {
        self.complete_session(emig_id);
    }

    /// Sends `msg` to `dest`, classifying a fabric send failure as
    /// [`NodeError::QueueFull`] (transient) or [`NodeError::NoNode`]
    /// (fatal) rather than collapsing both into one opaque error --
    /// `send_in_session` relies on telling them apart.
    fn send(&self, dest: NodeId, partition: PartitionId, msg: &MigrateMessage) -> NodeResult<()> {
        let bytes = msg
            .to_bytes()
            .map_err(|e| NodeError::Fabric(anyhow::anyhow!(e)))?;
        self.fabric
            .try_send(FabricMessage {
                to: dest,
                bytes: Arc::from(bytes.into_boxed_slice()),
            })
            .map_err(|(_, e)| match e {
                SendError::Full => NodeError::QueueFull(partition),
                SendError::Disconnected => NodeError::NoNode(partition),
                SendError::Timeout => NodeError::Fabric(anyhow::anyhow!("fabric send timed out")),
            })
    }

    #[must_use]
    pub fn pending_count(&self, emig_id: EmigId) -> usize {
        self.sessions
            .get(&emig_id)
            .map_or(0, |entry| entry.lock().pending_count())
    }

    /// Resends inserts that have been outstanding longer than the
    /// configured backoff, reusing their original insert IDs so the
    /// destination's dedup against `insert_id` still applies.
    ///
    /// # Errors
    ///
    /// Returns a pickle-encode or fabric-send error.
    pub fn retransmit_due(&self, emig_id: EmigId) -> NodeResult<()> {
        let Some((dest, partition, due)) = self.sessions.get(&emig_id).map(|entry| {
            let mut session = entry.lock();
            let due = session.due_for_retransmit(self.config.replica_retransmit_backoff);
            (session.dest, session.partition, due)
        }) else {
            return Ok(());
        };

        for (insert_id, pending) in due {
            let mut buf = bytes::BytesMut::new();
            let mut codec = PickleCodec;
            codec
                .encode(pending.pickle.clone(), &mut buf)
                .map_err(|e| NodeError::PickleMalformed(e.to_string()))?;
            let msg = MigrateMessage::Insert {
                emig_id,
                insert_id,
                digest: pending.digest,
                meta: pending.meta,
                pickle: buf.to_vec(),
            };
            self.send_in_session(emig_id, partition, dest, &msg)?;
            crate::metrics::migrate_insert_retransmitted(partition);
        }
        Ok(())
    }
}

/// How many jobs at the head of the [`EmigrationQueue`] a worker inspects
/// before choosing one, per spec.md §4.C "Work selection" ("the worker
/// inspects up to the head of the queue").
const SCAN_WINDOW: usize = 8;

/// Spawns `config.n_migrate_threads` worker tasks pulling from `queue`,
/// each watching `shutdown` for a graceful stop signal -- the same
/// pool-plus-shutdown-watch shape as the teacher's `ShutdownController`,
/// generalized from "stop accepting requests" to "stop picking up
/// migration jobs". Workers share one queue rather than each owning a
/// dedicated channel, so the scan-and-choose rule in
/// [`EmigrationQueue::pop`] sees every worker's contention for the same
/// pending jobs.
#[must_use]
pub fn spawn_workers(
    emigrator: Arc<Emigrator>,
    queue: Arc<EmigrationQueue>,
    shutdown: watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let n = emigrator.config.n_migrate_threads.max(1);

    (0..n)
        .map(|_| {
            let emigrator = Arc::clone(&emigrator);
            let queue = Arc::clone(&queue);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let Some(job) = next_job(&emigrator, &queue, &mut shutdown).await else {
                        return;
                    };
                    run_job_with_retry(&emigrator, job).await;
                }
            })
        })
        .collect()
}

/// Waits for and picks the next job the scan-and-choose rule prefers,
/// re-checking the shutdown signal between polls so a worker idling on
/// an empty queue still notices a graceful stop.
async fn next_job(
    emigrator: &Emigrator,
    queue: &EmigrationQueue,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<MigrationJob> {
    loop {
        if let Some(job) = queue.pop(SCAN_WINDOW, |job| {
            emigrator
                .namespace
                .storage()
                .entries_in_partition(emigrator.config.partition_count, job.partition)
                .len()
        }) {
            return Some(job);
        }
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return None;
                }
            }
            () = queue.wait_for_work() => {}
        }
    }
}

/// Runs one migration job. `run_session` streams the partition and drains
/// unacknowledged inserts itself before sending `Done`, bounded by
/// `replica_max_attempts`.
async fn run_job_with_retry(emigrator: &Arc<Emigrator>, job: MigrationJob) {
    let Ok(emig_id) = emigrator.start_session(job) else {
        return;
    };
    let _ = emigrator.run_session(emig_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::test_support::RecordingFabric;
    use crate::storage::memory::HashMapStorage;
    use partdb_core::{Digest, Record, RecordMeta};
    use std::collections::BTreeMap;

    fn setup() -> (Arc<Emigrator>, Arc<RecordingFabric>) {
        let config = NodeConfig {
            node_id: NodeId(1),
            partition_count: 16,
            ..NodeConfig::default()
        };
        let storage = Arc::new(HashMapStorage::new());
        let namespace = Arc::new(Namespace::new(storage, 1 << 30));
        let fabric = Arc::new(RecordingFabric::default());
        let cluster_key = Arc::new(ClusterKeyProvider::default());
        let partitions = Arc::new(PartitionRegistry::new());
        let emigrator = Arc::new(Emigrator::new(
            config,
            namespace,
            fabric.clone(),
            cluster_key,
            partitions,
        ));
        (emigrator, fabric)
    }

    #[test]
    fn start_session_sends_start_message() {
        let (emigrator, fabric) = setup();
        let emig_id = emigrator
            .start_session(MigrationJob {
                partition: PartitionId(0),
                dest: NodeId(2),
            })
            .unwrap();
        assert_eq!(fabric.sent.lock().len(), 1);
        assert_eq!(emigrator.pending_count(emig_id), 0);
    }

    #[test]
    fn cannot_start_two_sessions_for_same_partition() {
        let (emigrator, _fabric) = setup();
        emigrator
            .start_session(MigrationJob { partition: PartitionId(0), dest: NodeId(2) })
            .unwrap();
        let err = emigrator
            .start_session(MigrationJob { partition: PartitionId(0), dest: NodeId(3) })
            .unwrap_err();
        assert!(matches!(err, NodeError::Forbidden));
    }

    #[test]
    fn run_session_streams_records_and_sends_done() {
        let (emigrator, fabric) = setup();
        let digest = digest_for_partition();
        emigrator
            .namespace
            .apply_write(
                digest,
                Record::new(
                    RecordMeta { generation: 1, void_time: 0, last_update_time: 1, set_id: 0 },
                    BTreeMap::new(),
                ),
            )
            .unwrap();

        let partition = partdb_core::partition_of(&digest, emigrator.config.partition_count);
        let emig_id = emigrator
            .start_session(MigrationJob { partition, dest: NodeId(2) })
            .unwrap();

        // Acks the one pending insert from another thread while
        // `run_session` is blocked in its drain-before-`Done` wait, so
        // `Done` only goes out once the reinsert table is actually empty.
        let emigrator2 = Arc::clone(&emigrator);
        let acker = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            emigrator2
                .handle_incoming(MigrateMessage::InsertAck { emig_id, insert_id: partdb_core::InsertId(0) })
                .unwrap();
        });

        emigrator.run_session(emig_id).unwrap();
        acker.join().unwrap();

        // Start + Insert + Done
        assert_eq!(fabric.sent.lock().len(), 3);
        assert_eq!(emigrator.pending_count(emig_id), 0);
    }

    /// An unacked `Insert` counts against the session's `bytes_in_flight`
    /// backpressure valve; acking it frees the budget back up.
    #[test]
    fn streaming_an_insert_tracks_bytes_in_flight_until_acked() {
        let (emigrator, _fabric) = setup();
        let digest = digest_for_partition();
        emigrator
            .namespace
            .apply_write(
                digest,
                Record::new(
                    RecordMeta { generation: 1, void_time: 0, last_update_time: 1, set_id: 0 },
                    BTreeMap::new(),
                ),
            )
            .unwrap();

        let partition = partdb_core::partition_of(&digest, emigrator.config.partition_count);
        let emig_id = emigrator
            .start_session(MigrationJob { partition, dest: NodeId(2) })
            .unwrap();
        emigrator.run_session(emig_id).unwrap();

        assert!(emigrator.sessions.get(&emig_id).unwrap().lock().bytes_in_flight() > 0);

        let insert_id = partdb_core::InsertId(0);
        emigrator
            .handle_incoming(MigrateMessage::InsertAck { emig_id, insert_id })
            .unwrap();
        assert_eq!(emigrator.sessions.get(&emig_id).unwrap().lock().bytes_in_flight(), 0);
    }

    #[test]
    fn start_ack_rejection_aborts_session() {
        let (emigrator, _fabric) = setup();
        let emig_id = emigrator
            .start_session(MigrationJob { partition: PartitionId(0), dest: NodeId(2) })
            .unwrap();
        emigrator
            .handle_incoming(MigrateMessage::StartAck { emig_id, result: StartAckResult::Fail })
            .unwrap();
        // partition is free again
        emigrator
            .start_session(MigrationJob { partition: PartitionId(0), dest: NodeId(3) })
            .unwrap();
    }

    #[test]
    fn done_ack_releases_the_partition_reservation() {
        let (emigrator, _fabric) = setup();
        let emig_id = emigrator
            .start_session(MigrationJob { partition: PartitionId(1), dest: NodeId(2) })
            .unwrap();
        emigrator
            .handle_incoming(MigrateMessage::DoneAck { emig_id })
            .unwrap();
        emigrator
            .start_session(MigrationJob { partition: PartitionId(1), dest: NodeId(5) })
            .unwrap();
    }

    fn digest_for_partition() -> Digest {
        Digest::compute("ns", b"fixed-key-for-test")
    }

    #[test]
    fn unreachable_destination_aborts_the_session_and_frees_the_partition() {
        let (emigrator, fabric) = setup();
        fabric.unreachable.lock().insert(NodeId(2));

        let err = emigrator
            .start_session(MigrationJob { partition: PartitionId(0), dest: NodeId(2) })
            .unwrap_err();
        assert!(matches!(err, NodeError::NoNode(_)));

        // The reservation was released, so a retry at a different
        // destination succeeds immediately.
        emigrator
            .start_session(MigrationJob { partition: PartitionId(0), dest: NodeId(3) })
            .unwrap();
    }
}
