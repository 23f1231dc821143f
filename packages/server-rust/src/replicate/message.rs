//! Wire messages for the `RW` (replicated write) protocol.
//!
//! Structurally parallel to [`crate::migrate::message`]: a pickle-encoded
//! bin payload travels opaque inside [`RwMessage::Write`], with the outer
//! envelope carried through `rmp-serde`.

use partdb_core::{ClusterKey, Digest, NodeId, RecordMeta};
use serde::{Deserialize, Serialize};

/// Client-assigned identifier for one replicated write, unique among this
/// coordinator's in-flight writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RwId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RwMessage {
    /// One record to apply on a replica, sent by the write's coordinator.
    Write {
        rw_id: RwId,
        cluster_key: ClusterKey,
        coordinator: NodeId,
        digest: Digest,
        meta: RecordMeta,
        pickle: Vec<u8>,
    },
    /// A replica's response: whether it applied the write, or the reason
    /// it didn't.
    WriteAck {
        rw_id: RwId,
        outcome: WriteOutcome,
    },
}

/// Why a replica did or didn't apply a replicated write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOutcome {
    /// Applied -- this replica's copy now reflects the write.
    Applied,
    /// Lost the merge race against a newer write already present; not an
    /// error, the coordinator still counts this replica as caught up.
    Stale,
    /// The replica's cluster key did not match; the coordinator should
    /// treat this replica as unreachable for this write's epoch.
    Fenced,
    /// The replica is over its storage budget.
    OutOfSpace,
    /// The write's set has been truncated past its last-update-time
    /// (spec.md §4.D "Truncation").
    Forbidden,
}

impl RwMessage {
    #[must_use]
    pub fn rw_id(&self) -> RwId {
        match self {
            RwMessage::Write { rw_id, .. } | RwMessage::WriteAck { rw_id, .. } => *rw_id,
        }
    }

    /// # Errors
    ///
    /// Propagates any `rmp-serde` encoding failure.
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    /// # Errors
    ///
    /// Propagates any `rmp-serde` decoding failure.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_message_roundtrips() {
        let msg = RwMessage::Write {
            rw_id: RwId(1),
            cluster_key: ClusterKey(2),
            coordinator: NodeId(1),
            digest: Digest::compute("ns", b"k"),
            meta: RecordMeta { generation: 1, void_time: 0, last_update_time: 5, set_id: 0 },
            pickle: vec![0, 0, 1],
        };
        let bytes = msg.to_bytes().unwrap();
        let decoded = RwMessage::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.rw_id(), RwId(1));
    }

    #[test]
    fn ack_outcome_roundtrips() {
        let msg = RwMessage::WriteAck { rw_id: RwId(3), outcome: WriteOutcome::Stale };
        let bytes = msg.to_bytes().unwrap();
        let decoded = RwMessage::from_bytes(&bytes).unwrap();
        match decoded {
            RwMessage::WriteAck { outcome, .. } => assert_eq!(outcome, WriteOutcome::Stale),
            RwMessage::Write { .. } => panic!("wrong variant"),
        }
    }
}
