//! Partition migration: emigration (sending) and immigration (receiving).

pub mod emigrator;
pub mod immigrator;
pub mod message;
pub mod queue;
pub mod session;

pub use emigrator::{spawn_workers, Emigrator, MigrationJob};
pub use immigrator::Immigrator;
pub use message::{MigrateMessage, StartAckResult};
pub use queue::EmigrationQueue;
pub use session::{EmigrationSession, ImmigrationSession, PendingInsert};
