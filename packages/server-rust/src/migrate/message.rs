//! Wire messages for the `MIGRATE` protocol.
//!
//! Encoded with `rmp-serde` (the teacher's convention for outer envelopes,
//! `rmp_serde::to_vec_named`/`from_slice`), with each record's bins
//! pre-encoded through [`crate::pickle::PickleCodec`] into an opaque byte
//! string carried in [`MigrateMessage::Insert`] -- the pickle format is a
//! purpose-built binary layout, not something `rmp-serde` understands
//! natively.

use partdb_core::{ClusterKey, Digest, EmigId, InsertId, NodeId, PartitionId, RecordMeta};
use serde::{Deserialize, Serialize};

/// How a destination responded to a `Start` (spec.md §4.C/§4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartAckResult {
    /// Accepted; the source may begin streaming `Insert`s.
    Ok,
    /// This `(source, emig_id)` already ran to completion; the source
    /// should proceed straight to treating the session as done rather
    /// than resending `Start`.
    AlreadyDone,
    /// Rejected -- the partition is not ownable here right now.
    Fail,
    /// Transient: try again shortly (e.g. under load). Distinct from
    /// `Fail` so the source keeps retrying `Start` instead of aborting.
    Eagain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MigrateMessage {
    /// Opens a migration session for one partition.
    Start {
        emig_id: EmigId,
        partition: PartitionId,
        cluster_key: ClusterKey,
        source: NodeId,
    },
    /// Accepts or rejects a `Start`. A duplicate `Start` for an
    /// already-known `emig_id` is answered idempotently without resetting
    /// session state (spec.md §4.D, scenario S6).
    StartAck { emig_id: EmigId, result: StartAckResult },
    /// One record, with its bins pre-encoded as a pickle.
    Insert {
        emig_id: EmigId,
        insert_id: InsertId,
        digest: Digest,
        meta: RecordMeta,
        pickle: Vec<u8>,
    },
    InsertAck { emig_id: EmigId, insert_id: InsertId },
    /// Marks the end of the record stream for this session.
    Done { emig_id: EmigId },
    DoneAck { emig_id: EmigId },
    /// Aborts a session, e.g. on cluster-key fencing (spec.md §9).
    Cancel { emig_id: EmigId },
}

impl MigrateMessage {
    #[must_use]
    pub fn emig_id(&self) -> EmigId {
        match self {
            MigrateMessage::Start { emig_id, .. }
            | MigrateMessage::StartAck { emig_id, .. }
            | MigrateMessage::Insert { emig_id, .. }
            | MigrateMessage::InsertAck { emig_id, .. }
            | MigrateMessage::Done { emig_id }
            | MigrateMessage::DoneAck { emig_id }
            | MigrateMessage::Cancel { emig_id } => *emig_id,
        }
    }

    /// Serializes this message with the outer envelope codec.
    ///
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
    fn start_message_roundtrips() {
        let msg = MigrateMessage::Start {
            emig_id: EmigId(1),
            partition: PartitionId(7),
            cluster_key: ClusterKey(3),
            source: NodeId(1),
        };
        let bytes = msg.to_bytes().unwrap();
        let decoded = MigrateMessage::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.emig_id(), EmigId(1));
    }

    #[test]
    fn insert_message_carries_opaque_pickle_bytes() {
        let meta = RecordMeta {
            generation: 1,
            void_time: 0,
            last_update_time: 10,
            set_id: 0,
        };
        let msg = MigrateMessage::Insert {
            emig_id: EmigId(2),
            insert_id: InsertId(0),
            digest: Digest::compute("ns", b"k"),
            meta,
            pickle: vec![0, 0, 1],
        };
        let bytes = msg.to_bytes().unwrap();
        let decoded = MigrateMessage::from_bytes(&bytes).unwrap();
        match decoded {
            MigrateMessage::Insert { pickle, .. } => assert_eq!(pickle, vec![0, 0, 1]),
            _ => panic!("wrong variant"),
        }
    }
}
