//! The node-wide error taxonomy.
//!
//! Every fallible operation in the migration and replicated-write paths
//! returns [`NodeError`] (or a `Result` alias of it) so callers at the
//! fabric boundary can map a single enum onto wire-level ack/nack codes
//! instead of threading several ad hoc error types through the stack.

use partdb_core::{ClusterKey, PartitionId};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("cluster key mismatch: message carried {message}, node is at {local}")]
    ClusterKeyMismatch { message: ClusterKey, local: ClusterKey },

    #[error("no destination node configured for partition {0}")]
    NoNode(PartitionId),

    #[error("queue full for partition {0}")]
    QueueFull(PartitionId),

    #[error("namespace is out of configured storage space")]
    OutOfSpace,

    #[error("operation forbidden in current reservation state")]
    Forbidden,

    #[error("record not found")]
    NotFound,

    #[error("malformed pickle: {0}")]
    PickleMalformed(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("duplicate acknowledgement for insert id {0}")]
    DuplicateAck(u32),

    #[error(transparent)]
    Fabric(#[from] anyhow::Error),
}

pub type NodeResult<T> = Result<T, NodeError>;
