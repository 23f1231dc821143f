//! Node tunables.
//!
//! A plain struct with `Default`, mirroring the teacher's `ServerConfig`
//! convention. Loading these values from a file or environment is outside
//! this crate's scope; callers construct a [`NodeConfig`] directly (e.g.
//! from a config crate elsewhere in the deployment) and pass it in.

use std::time::Duration;

use partdb_core::NodeId;

/// `tracing-subscriber` output format, following the teacher's own
/// pretty-for-a-terminal/json-for-a-log-shipper split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    /// Number of partitions namespace-wide. Spec default is 4096.
    pub partition_count: u32,
    /// Worker tasks draining the emigration record queue per session.
    pub n_migrate_threads: usize,
    /// Records sent per `MIGRATE` insert batch before yielding.
    pub migrate_batch_size: usize,
    /// Delay before retrying a throttled emigration send.
    pub migrate_throttle_delay: Duration,
    /// How long a replicated write waits for all acks before failing.
    pub replica_write_timeout: Duration,
    /// Base delay for replicated-write retransmit backoff; actual delay is
    /// jittered by up to this amount to avoid synchronized retry storms.
    pub replica_retransmit_backoff: Duration,
    /// Retransmit attempts before a replicated write gives up.
    pub replica_max_attempts: u32,
    /// Bound on the outbound fabric queue per destination node.
    pub outbound_queue_capacity: usize,
    /// Namespace storage budget in bytes; writes past this return `OutOfSpace`.
    pub storage_max_cost_bytes: u64,
    /// How long a completed immigration session is kept around (for
    /// duplicate-DONE detection and observability) before the reaper
    /// evicts it. Zero means evict on the next reaper tick after DONE
    /// (spec.md §6 `migrate_rx_lifetime_ms`).
    pub migrate_rx_lifetime: Duration,
    /// Interval between immigration-reaper sweeps (spec.md §4.D "a
    /// background loop scans sessions every second").
    pub migrate_reaper_interval: Duration,
    /// Bound on the process-wide emigration priority queue
    /// ([`crate::migrate::EmigrationQueue`]); `start_session` callers back
    /// off rather than growing it unbounded under a rebalance storm.
    pub emigration_queue_capacity: usize,
    /// Shard count for the replicated-write coordinator's pending-request
    /// table, following spec.md §5's "all hashes used for cross-thread
    /// lookup are lock-striped".
    pub rw_request_shard_count: usize,
    /// `tracing-subscriber` output format for whoever installs this
    /// node's subscriber.
    pub log_format: LogFormat,
    /// Gates the `metrics` crate counters/gauges this crate records.
    pub metrics_enabled: bool,
    /// How long [`crate::reservation::PartitionRegistry::end_migration`]
    /// waits for outstanding reservations against a partition to drain
    /// before giving up (spec.md §3 invariant 2).
    pub partition_drain_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId(0),
            partition_count: 4096,
            n_migrate_threads: 4,
            migrate_batch_size: 64,
            migrate_throttle_delay: Duration::from_millis(50),
            replica_write_timeout: Duration::from_secs(5),
            replica_retransmit_backoff: Duration::from_millis(100),
            replica_max_attempts: 3,
            outbound_queue_capacity: 256,
            storage_max_cost_bytes: 1 << 30,
            migrate_rx_lifetime: Duration::from_secs(60),
            migrate_reaper_interval: Duration::from_secs(1),
            emigration_queue_capacity: 256,
            rw_request_shard_count: 16,
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            partition_drain_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = NodeConfig::default();
        assert!(cfg.n_migrate_threads > 0);
        assert!(cfg.partition_count > 0);
        assert!(cfg.replica_max_attempts > 0);
        assert!(cfg.emigration_queue_capacity > 0);
        assert!(cfg.rw_request_shard_count > 0);
        assert_eq!(cfg.log_format, LogFormat::Pretty);
        assert!(cfg.metrics_enabled);
        assert!(cfg.partition_drain_timeout > Duration::ZERO);
    }
}
