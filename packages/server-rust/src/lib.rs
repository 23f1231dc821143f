//! partdb node: partition migration and synchronous replicated writes
//! between shards of a replicated key-value store.
//!
//! Two largely independent protocols live here:
//!
//! - [`migrate`]: moves a partition's records from one node to another
//!   (emigration on the sending side, immigration on the receiving side).
//! - [`replicate`]: a partition's master fans a write out to its replicas
//!   and waits for every one of them to acknowledge before the write is
//!   considered durable.
//!
//! Both talk through the same [`fabric::Fabric`] transport seam and the
//! same [`storage::Namespace`] merge-policy wrapper, and both are fenced
//! by the same [`reservation::check_fence`] cluster-key check.

pub mod config;
pub mod error;
pub mod fabric;
pub mod metrics;
pub mod migrate;
pub mod pickle;
pub mod replicate;
pub mod reservation;
pub mod storage;

pub use config::NodeConfig;
pub use error::{NodeError, NodeResult};
pub use fabric::{Fabric, FabricMessage, SendError};
pub use migrate::{spawn_workers, Emigrator, EmigrationQueue, Immigrator, MigrateMessage, MigrationJob, StartAckResult};
pub use pickle::{Pickle, PickleCodec};
pub use replicate::{ReplicaReceiver, ReplicatedWriter, RwId, RwMessage, WriteOutcome};
pub use reservation::{check_fence, PartitionRegistry, PartitionState, Reservation};
pub use storage::{HashMapStorage, Namespace, StorageEngine};
