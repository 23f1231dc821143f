//! The coordinator side of a synchronous replicated write: apply locally,
//! fan the write out to every replica, and block until either all of them
//! have acknowledged or the write's timeout expires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use partdb_core::{ClusterKeyProvider, Digest, NodeId, Record};
use tokio_util::codec::Encoder;

use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult};
use crate::fabric::{Fabric, FabricMessage};
use crate::pickle::{Pickle, PickleCodec};
use crate::replicate::message::{RwId, RwMessage, WriteOutcome};
use crate::replicate::request::{PendingWrite, PendingWriteTable};
use crate::storage::Namespace;

/// Coordinates replicated writes for one namespace.
pub struct ReplicatedWriter {
    config: NodeConfig,
    namespace: Arc<Namespace>,
    fabric: Arc<dyn Fabric>,
    cluster_key: Arc<ClusterKeyProvider>,
    next_rw_id: AtomicU64,
    pending: PendingWriteTable,
}

impl ReplicatedWriter {
    #[must_use]
    pub fn new(
        config: NodeConfig,
        namespace: Arc<Namespace>,
        fabric: Arc<dyn Fabric>,
        cluster_key: Arc<ClusterKeyProvider>,
    ) -> Self {
        crate::metrics::init_from_config(&config);
        let pending = PendingWriteTable::new(config.rw_request_shard_count);
        Self {
            config,
            namespace,
            fabric,
            cluster_key,
            next_rw_id: AtomicU64::new(0),
            pending,
        }
    }

    /// Applies `record` locally, replicates it to `replicas`, and waits
    /// for every replica to acknowledge.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::OutOfSpace`] if the local apply fails the
    /// storage budget, or [`NodeError::Timeout`] if not every replica
    /// acknowledges within `replica_write_timeout`.
    pub async fn write(&self, digest: Digest, record: Record, replicas: &[NodeId]) -> NodeResult<()> {
        self.namespace.apply_write(digest, record.clone())?;

        if replicas.is_empty() {
            return Ok(());
        }

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

        let rw_id = RwId(self.next_rw_id.fetch_add(1, Ordering::Relaxed));
        let cluster_key = self.cluster_key.current();
        let pending = PendingWrite::new(digest, record.meta, pickle, cluster_key, replicas);
        self.pending.insert(rw_id, pending);

        for &replica in replicas {
            self.send_write(replica, rw_id, cluster_key, digest, record.meta, buf.to_vec())?;
        }
        tracing::debug!(?rw_id, ?digest, replicas = replicas.len(), "replicated write started");
        crate::metrics::replicated_write_attempted();

        let deadline = tokio::time::Instant::now() + self.config.replica_write_timeout;
        loop {
            if self.is_complete(rw_id) {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                self.pending.remove(rw_id);
                tracing::warn!(?rw_id, timeout = ?self.config.replica_write_timeout, "replicated write timed out waiting on replica acks");
                crate::metrics::replicated_write_timed_out();
                return Err(NodeError::Timeout(self.config.replica_write_timeout));
            }

            let due: Vec<NodeId> = self
                .pending
                .with_mut(rw_id, |w| w.due_for_retransmit(self.config.replica_retransmit_backoff))
                .unwrap_or_default();
            for replica in due {
                self.send_write(replica, rw_id, cluster_key, digest, record.meta, buf.to_vec())?;
            }

            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let finished = self.pending.remove(rw_id);
        match finished {
            Some(w) if w.all_succeeded() => {
                tracing::debug!(?rw_id, "replicated write completed, all replicas acked");
                crate::metrics::replicated_write_succeeded();
                Ok(())
            }
            Some(w) => {
                let failure = w.first_failure();
                tracing::warn!(?rw_id, ?failure, "replicated write failed, a replica rejected the write");
                // `first_failure` never reports `Fenced`: `PendingWrite::ack`
                // ignores that outcome entirely, so a fenced replica stays
                // `Outstanding` and this branch only sees genuine rejections
                // (or `Applied`/`Stale`, which can't coexist with `!all_succeeded`
                // unless another replica is still outstanding past the timeout).
                Err(match failure {
                    Some(WriteOutcome::OutOfSpace) => NodeError::OutOfSpace,
                    Some(WriteOutcome::Forbidden) => NodeError::Forbidden,
                    Some(WriteOutcome::Applied | WriteOutcome::Stale | WriteOutcome::Fenced) | None => {
                        NodeError::Forbidden
                    }
                })
            }
            None => Err(NodeError::Forbidden),
        }
    }

    /// Applies an inbound `WriteAck`.
    pub fn handle_ack(&self, from: NodeId, rw_id: RwId, outcome: WriteOutcome) {
        self.pending.with_mut(rw_id, |pending| pending.ack(from, outcome));
    }

    fn is_complete(&self, rw_id: RwId) -> bool {
        self.pending.is_complete(rw_id)
    }

    fn send_write(
        &self,
        replica: NodeId,
        rw_id: RwId,
        cluster_key: partdb_core::ClusterKey,
        digest: Digest,
        meta: partdb_core::RecordMeta,
        pickle: Vec<u8>,
    ) -> NodeResult<()> {
        let msg = RwMessage::Write {
            rw_id,
            cluster_key,
            coordinator: self.config.node_id,
            digest,
            meta,
            pickle,
        };
        let bytes = msg
            .to_bytes()
            .map_err(|e| NodeError::Fabric(anyhow::anyhow!(e)))?;
        self.fabric
            .try_send(FabricMessage { to: replica, bytes: Arc::from(bytes.into_boxed_slice()) })
            .map_err(|(_, e)| NodeError::Fabric(anyhow::anyhow!("fabric send failed: {e:?}")))
    }
}
