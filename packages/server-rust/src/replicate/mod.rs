//! Synchronous replicated writes: fan a write out to every replica and
//! wait for all of them to acknowledge before the client sees success.

pub mod message;
pub mod receiver;
pub mod request;
pub mod writer;

pub use message::{RwId, RwMessage, WriteOutcome};
pub use receiver::ReplicaReceiver;
pub use request::{PendingWrite, PendingWriteTable};
pub use writer::ReplicatedWriter;
