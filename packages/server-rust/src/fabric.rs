//! The fabric abstraction: everything migration and replication need from
//! the inter-node transport, and nothing else. Fabric transport internals
//! (connection establishment, framing, retries at the socket level) are
//! out of scope here; this module only defines the seam the rest of the
//! crate programs against, grounded in the teacher's `ConnectionHandle`
//! send-with-backpressure contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use partdb_core::NodeId;

/// Why a send to a peer node failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The send timed out while the outbound queue stayed full.
    Timeout,
    /// The destination is not currently reachable.
    Disconnected,
    /// The outbound queue is full (non-blocking send only).
    Full,
}

/// A single outbound message addressed to one peer node.
///
/// `bytes` is an already-serialized wire message (the outer MIGRATE/RW
/// envelope, rmp-serde encoded with an embedded pickle payload). Ownership
/// passes to the fabric on a successful send -- see the `try_send`
/// ownership note below.
#[derive(Debug, Clone)]
pub struct FabricMessage {
    pub to: NodeId,
    pub bytes: Arc<[u8]>,
}

/// Inter-node message transport.
///
/// Implementations own connection lifecycle, reconnects, and framing;
/// this trait only exposes send/receive. `try_send` takes ownership of
/// the message on success (it has been handed to the transport) and
/// returns it back to the caller on failure, so a caller can retry
/// without re-serializing.
#[async_trait]
pub trait Fabric: Send + Sync + 'static {
    /// Attempts to enqueue `msg` without blocking.
    ///
    /// # Errors
    ///
    /// Returns the original `msg` alongside `SendError::Full` if the
    /// outbound queue for `msg.to` is full, or `SendError::Disconnected`
    /// if there is no route to that node.
    fn try_send(&self, msg: FabricMessage) -> Result<(), (FabricMessage, SendError)>;

    /// Sends `msg`, waiting up to `timeout` for queue space.
    async fn send_timeout(&self, msg: FabricMessage, timeout: Duration) -> Result<(), SendError>;

    /// Returns `true` if this node currently believes it has a route to `node`.
    fn is_reachable(&self, node: NodeId) -> bool;
}

#[cfg(test)]
pub mod test_support {
    use super::{Fabric, FabricMessage, SendError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use partdb_core::NodeId;
    use std::collections::HashSet;
    use std::time::Duration;

    /// An in-memory fabric double that records sent messages, for exercising
    /// migration/replication logic without real sockets.
    #[derive(Default)]
    pub struct RecordingFabric {
        pub sent: Mutex<Vec<FabricMessage>>,
        pub unreachable: Mutex<HashSet<NodeId>>,
    }

    #[async_trait]
    impl Fabric for RecordingFabric {
        fn try_send(&self, msg: FabricMessage) -> Result<(), (FabricMessage, SendError)> {
            if self.unreachable.lock().contains(&msg.to) {
                return Err((msg, SendError::Disconnected));
            }
            self.sent.lock().push(msg);
            Ok(())
        }

        async fn send_timeout(&self, msg: FabricMessage, _timeout: Duration) -> Result<(), SendError> {
            self.try_send(msg).map_err(|(_, e)| e)
        }

        fn is_reachable(&self, node: NodeId) -> bool {
            !self.unreachable.lock().contains(&node)
        }
    }
}
