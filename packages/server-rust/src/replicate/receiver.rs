//! The replica side of a synchronous replicated write: apply an inbound
//! `RwMessage::Write` through the same merge policy as migration, and
//! report back what happened.

use std::sync::Arc;

use partdb_core::{ClusterKeyProvider, NodeId, Record};
use tokio_util::codec::Decoder;

use crate::error::{NodeError, NodeResult};
use crate::fabric::{Fabric, FabricMessage};
use crate::pickle::{Pickle, PickleCodec};
use crate::replicate::message::{RwMessage, WriteOutcome};
use crate::storage::Namespace;

pub struct ReplicaReceiver {
    namespace: Arc<Namespace>,
    fabric: Arc<dyn Fabric>,
    cluster_key: Arc<ClusterKeyProvider>,
}

impl ReplicaReceiver {
    #[must_use]
    pub fn new(namespace: Arc<Namespace>, fabric: Arc<dyn Fabric>, cluster_key: Arc<ClusterKeyProvider>) -> Self {
        Self { namespace, fabric, cluster_key }
    }

    /// Handles one inbound `RwMessage::Write`, applying it and sending a
    /// `WriteAck` back to `from`.
    ///
    /// # Errors
    ///
    /// Returns a pickle-decode or fabric-send error. A cluster-key
    /// mismatch or storage-budget failure is reported in the ack's
    /// `WriteOutcome`, not as an `Err` -- the coordinator still needs a
    /// response to stop retransmitting.
    pub fn handle(&self, from: NodeId, msg: RwMessage) -> NodeResult<()> {
        let RwMessage::Write { rw_id, cluster_key, digest, meta, pickle, .. } = msg else {
            return Ok(());
        };

        if !self.cluster_key.matches(cluster_key) {
            tracing::warn!(?rw_id, from = ?from, "rejecting replicated write, coordinator's cluster key is stale");
            return self.ack(from, rw_id, WriteOutcome::Fenced);
        }

        let footprint = crate::pickle::footprint(&pickle).map_err(|e| NodeError::PickleMalformed(e.to_string()))?;
        match self.namespace.precheck_write(&digest, &meta, footprint) {
            Ok(true) => {}
            Ok(false) => return self.ack(from, rw_id, WriteOutcome::Stale),
            Err(NodeError::OutOfSpace) => {
                tracing::warn!(?rw_id, "rejecting replicated write, local storage is over budget");
                return self.ack(from, rw_id, WriteOutcome::OutOfSpace);
            }
            Err(NodeError::Forbidden) => {
                tracing::warn!(?rw_id, "rejecting replicated write, set has been truncated past this record's LUT");
                return self.ack(from, rw_id, WriteOutcome::Forbidden);
            }
            Err(e) => return Err(e),
        }

        let mut buf = bytes::BytesMut::from(pickle.as_slice());
        let decoded = PickleCodec
            .decode(&mut buf)
            .map_err(|e| NodeError::PickleMalformed(e.to_string()))?
            .ok_or_else(|| NodeError::PickleMalformed("truncated pickle frame".into()))?;

        let record = match decoded {
            Pickle::Drop => Record::tombstone(meta),
            Pickle::Bins(bins) => Record::new(meta, bins),
        };

        match self.namespace.apply_write(digest, record) {
            Ok(true) => self.ack(from, rw_id, WriteOutcome::Applied),
            Ok(false) => self.ack(from, rw_id, WriteOutcome::Stale),
            Err(NodeError::OutOfSpace) => {
                tracing::warn!(?rw_id, "rejecting replicated write, local storage is over budget");
                self.ack(from, rw_id, WriteOutcome::OutOfSpace)
            }
            Err(NodeError::Forbidden) => {
                tracing::warn!(?rw_id, "rejecting replicated write, set has been truncated past this record's LUT");
                self.ack(from, rw_id, WriteOutcome::Forbidden)
            }
            Err(e) => Err(e),
        }
    }

    fn ack(&self, to: NodeId, rw_id: crate::replicate::message::RwId, outcome: WriteOutcome) -> NodeResult<()> {
        let msg = RwMessage::WriteAck { rw_id, outcome };
        let bytes = msg
            .to_bytes()
            .map_err(|e| NodeError::Fabric(anyhow::anyhow!(e)))?;
        self.fabric
            .try_send(FabricMessage { to, bytes: Arc::from(bytes.into_boxed_slice()) })
            .map_err(|(_, e)| NodeError::Fabric(anyhow::anyhow!("fabric send failed: {e:?}")))
    }
}
