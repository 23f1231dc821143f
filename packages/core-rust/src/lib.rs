//! partdb-core -- digests, epochs, clock, and the record/value model shared
//! by the migration and replication flows.
//!
//! - **Digest** ([`digest`]): content-addressed record key
//! - **Clock** ([`clock`]): monotonic millisecond timestamps for the LUT tiebreaker
//! - **Cluster key** ([`cluster_key`]): fencing epoch checked on every inbound message
//! - **Ids** ([`ids`]): node/partition/session identifiers and partition routing
//! - **Value** ([`value`]): bin value type and its wire particle-type tag
//! - **Record** ([`record`]): bins plus version metadata
//! - **Merge** ([`merge`]): the ordering rule migration and replication both apply

pub mod cluster_key;
pub mod clock;
pub mod digest;
pub mod ids;
pub mod merge;
pub mod record;
pub mod value;

pub use cluster_key::{ClusterKey, ClusterKeyProvider};
pub use clock::{ClockSource, MonotonicClock, SystemClock};
pub use digest::Digest;
pub use ids::{partition_of, EmigId, IdSequence, InsertId, NodeId, PartitionId};
pub use merge::{decide as merge_decide, MergeOutcome};
pub use record::{Bins, Record, RecordMeta};
pub use value::{ParticleType, Value};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }

    #[test]
    fn reexports_accessible() {
        let d = Digest::compute("ns", b"k");
        let _ = partition_of(&d, 4096);
        let _ = ClusterKey::INITIAL;
        let _clock = SystemClock;
        let _ = Value::Nil;
        let meta = RecordMeta {
            generation: 0,
            void_time: 0,
            last_update_time: 0,
            set_id: 0,
        };
        assert_eq!(merge_decide(None, meta), MergeOutcome::Apply);
    }

    #[test]
    fn end_to_end_digest_to_partition_is_stable() {
        let seq = IdSequence::new();
        let emig = seq.next_emig_id();
        let d1 = Digest::compute("users", b"alice");
        let d2 = Digest::compute("users", b"alice");
        assert_eq!(partition_of(&d1, 4096), partition_of(&d2, 4096));
        let _ = emig;
    }
}
