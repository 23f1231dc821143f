//! Immigration: the receiving side of a `MIGRATE` session.
//!
//! Structurally the mirror image of [`crate::migrate::emigrator`]: where
//! the emigrator drives a session forward by sending, the immigrator is
//! purely reactive, applying whatever arrives and acking it.

use std::sync::Arc;

use dashmap::DashMap;
use partdb_core::{ClusterKeyProvider, EmigId, NodeId, PartitionId};

use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult};
use crate::fabric::{Fabric, FabricMessage};
use crate::migrate::message::{MigrateMessage, StartAckResult};
use crate::migrate::session::ImmigrationSession;
use crate::pickle::{Pickle, PickleCodec};
use crate::reservation::{check_fence, PartitionRegistry, PartitionState};
use crate::storage::Namespace;
use partdb_core::Record;
use tokio_util::codec::Decoder;

pub struct Immigrator {
    config: NodeConfig,
    namespace: Arc<Namespace>,
    fabric: Arc<dyn Fabric>,
    cluster_key: Arc<ClusterKeyProvider>,
    partitions: Arc<PartitionRegistry>,
    sessions: DashMap<EmigId, Arc<ImmigrationSession>>,
}

impl Immigrator {
    #[must_use]
    pub fn new(
        config: NodeConfig,
        namespace: Arc<Namespace>,
        fabric: Arc<dyn Fabric>,
        cluster_key: Arc<ClusterKeyProvider>,
        partitions: Arc<PartitionRegistry>,
    ) -> Self {
        Self {
            config,
            namespace,
            fabric,
            cluster_key,
            partitions,
            sessions: DashMap::new(),
        }
    }

    /// Handles one inbound `MigrateMessage`, applying it and (where the
    /// protocol calls for one) sending the matching ack back to `from`.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Forbidden`] if `Start` arrives for a partition
    /// already mid-migration, [`NodeError::ClusterKeyMismatch`] if a
    /// message's fencing token no longer matches, or a pickle/fabric error
    /// surfaced while applying or acking.
    pub fn handle(&self, from: NodeId, msg: MigrateMessage) -> NodeResult<()> {
        match msg {
            MigrateMessage::Start { emig_id, partition, cluster_key, source } => {
                self.on_start(from, emig_id, partition, cluster_key, source)
            }
            MigrateMessage::Insert { emig_id, insert_id, digest, meta, pickle } => {
                self.on_insert(from, emig_id, insert_id, digest, meta, pickle)
            }
            MigrateMessage::Done { emig_id } => self.on_done(from, emig_id),
            MigrateMessage::Cancel { emig_id } => {
                self.abort(emig_id);
                Ok(())
            }
            MigrateMessage::StartAck { .. }
            | MigrateMessage::InsertAck { .. }
            | MigrateMessage::DoneAck { .. } => Ok(()),
        }
    }

    fn on_start(
        &self,
        from: NodeId,
        emig_id: EmigId,
        partition: PartitionId,
        cluster_key: partdb_core::ClusterKey,
        source: NodeId,
    ) -> NodeResult<()> {
        // Duplicate Start for a session we already know about is answered
        // idempotently, without resetting any state (spec.md §4.D, S6):
        // still in flight -> Ok again; already completed -> AlreadyDone.
        if let Some(session) = self.sessions.get(&emig_id) {
            let result = if session.is_done() {
                StartAckResult::AlreadyDone
            } else {
                StartAckResult::Ok
            };
            return self.send(from, &MigrateMessage::StartAck { emig_id, result });
        }

        if check_fence(self.cluster_key.current(), cluster_key).is_err() {
            tracing::warn!(?emig_id, partition = partition.0, "start fenced by stale cluster key, asking source to retry");
            return self.send(from, &MigrateMessage::StartAck { emig_id, result: StartAckResult::Eagain });
        }

        let result = match self
            .partitions
            .begin_migration(partition, PartitionState::Immigrating { source })
        {
            Ok(()) => {
                self.sessions
                    .insert(emig_id, Arc::new(ImmigrationSession::new(source, partition, cluster_key)));
                tracing::debug!(?emig_id, partition = partition.0, ?source, "immigration session opened");
                StartAckResult::Ok
            }
            Err(_) => StartAckResult::Fail,
        };

        self.send(from, &MigrateMessage::StartAck { emig_id, result })
    }

    fn on_insert(
        &self,
        from: NodeId,
        emig_id: EmigId,
        insert_id: partdb_core::InsertId,
        digest: partdb_core::Digest,
        meta: partdb_core::RecordMeta,
        pickle_bytes: Vec<u8>,
    ) -> NodeResult<()> {
        let Some(session) = self.sessions.get(&emig_id) else {
            // No matching session (never started, or already cancelled);
            // silently drop rather than erroring the whole connection
            // (spec.md §4.D INSERT handling step 1).
            return Ok(());
        };
        if check_fence(self.cluster_key.current(), session.cluster_key).is_err() {
            // Stale session; drop silently, the reaper will evict it.
            tracing::warn!(?emig_id, ?insert_id, "dropping insert for a session fenced by a cluster key bump");
            return Ok(());
        }
        let partition = session.partition;
        drop(session);

        // Held across the apply below so `Done`'s `end_migration` can't
        // flip the partition back to `Stable` while this insert is still
        // being written (spec.md §3 invariant 2).
        let _reservation = self.partitions.reserve(partition);

        let mut buf = bytes::BytesMut::from(pickle_bytes.as_slice());
        let pickle = PickleCodec
            .decode(&mut buf)
            .map_err(|e| {
                crate::metrics::migrate_pickle_rejected();
                NodeError::PickleMalformed(e.to_string())
            })?
            .ok_or_else(|| NodeError::PickleMalformed("truncated pickle frame".into()))?;

        let record = match pickle {
            Pickle::Drop => Record::tombstone(meta),
            Pickle::Bins(bins) => Record::new(meta, bins),
        };

        match self.namespace.apply_write(digest, record) {
            Ok(_applied) => self.send(from, &MigrateMessage::InsertAck { emig_id, insert_id }),
            Err(NodeError::OutOfSpace) => {
                // Out-of-space is a durable local condition, not a
                // transient failure the source should retransmit through;
                // cancel the whole session so the source stops sending.
                tracing::warn!(?emig_id, "local storage full, cancelling immigration session");
                self.abort(emig_id);
                self.send(from, &MigrateMessage::Cancel { emig_id })
            }
            Err(NodeError::Forbidden) => {
                // The record's set has been truncated past this LUT;
                // the insert is a no-op, not a reason to tear down the
                // session (spec.md §4.D "Ack positively (always)").
                tracing::debug!(?emig_id, ?insert_id, "dropping insert, set truncated past this record's LUT");
                self.send(from, &MigrateMessage::InsertAck { emig_id, insert_id })
            }
            Err(e) => Err(e),
        }
    }

    /// Handles `Done`. Only the call that transitions the session from
    /// in-flight to done releases the reservation and fires the
    /// migration-complete notification -- a retransmitted `Done` for an
    /// already-done session still gets acked (spec.md §4.D) but is
    /// otherwise a no-op, satisfying the at-most-once-observation
    /// invariant (spec.md §3 invariant 4) under arbitrary retransmission.
    fn on_done(&self, from: NodeId, emig_id: EmigId) -> NodeResult<()> {
        if let Some(session) = self.sessions.get(&emig_id) {
            if session.mark_done() {
                tracing::debug!(?emig_id, partition = session.partition.0, "immigration session done");
                self.partitions.end_migration(session.partition, self.config.partition_drain_timeout);
                crate::metrics::migrate_done_observed(session.partition);
                if self.config.migrate_rx_lifetime.is_zero() {
                    drop(session);
                    self.sessions.remove(&emig_id);
                }
            }
        }
        self.send(from, &MigrateMessage::DoneAck { emig_id })
    }

    /// Unconditionally drops the session and releases its reservation,
    /// used both for `Cancel` and for a local failure (e.g. out-of-space)
    /// that aborts the session before any `Done` arrives.
    fn complete(&self, emig_id: EmigId) {
        if let Some((_, session)) = self.sessions.remove(&emig_id) {
            self.partitions.end_migration(session.partition, self.config.partition_drain_timeout);
        }
    }

    fn abort(&self, emig_id: EmigId) {
        self.complete(emig_id);
    }

    /// Evicts sessions whose cluster key no longer matches the local
    /// epoch, or whose `Done` was observed more than `migrate_rx_lifetime`
    /// ago (spec.md §4.D "Reaper"). An in-flight session evicted for a
    /// stale cluster key still releases its reservation so rebalance can
    /// re-plan the transfer (spec.md §9 "Cluster-key fencing").
    pub fn reap_stale_sessions(&self) {
        let current_key = self.cluster_key.current();
        let rx_lifetime = self.config.migrate_rx_lifetime;

        let stale: Vec<EmigId> = self
            .sessions
            .iter()
            .filter(|entry| {
                let session = entry.value();
                session.cluster_key != current_key
                    || session.done_age().is_some_and(|age| age >= rx_lifetime)
            })
            .map(|entry| *entry.key())
            .collect();

        for emig_id in stale {
            if let Some((_, session)) = self.sessions.remove(&emig_id) {
                tracing::debug!(?emig_id, partition = session.partition.0, "reaped stale immigration session");
                self.partitions.end_migration(session.partition, self.config.partition_drain_timeout);
                crate::metrics::migrate_session_reaped();
            }
        }
    }

    fn send(&self, dest: NodeId, msg: &MigrateMessage) -> NodeResult<()> {
        let bytes = msg
            .to_bytes()
            .map_err(|e| NodeError::Fabric(anyhow::anyhow!(e)))?;
        self.fabric
            .try_send(FabricMessage {
                to: dest,
                bytes: Arc::from(bytes.into_boxed_slice()),
            })
            .map_err(|(_, e)| NodeError::Fabric(anyhow::anyhow!("fabric send failed: {e:?}")))
    }

    #[must_use]
    pub fn partition_count(&self) -> u32 {
        self.config.partition_count
    }
}
