//! Counters and gauges for migration and replicated-write traffic.
//!
//! The teacher's own middleware instruments operations with `tracing`
//! spans and left counters as a noted future enhancement; this crate has
//! no request-response middleware stack to hang spans off of, so these
//! are recorded directly at the call sites in `migrate`/`replicate` via
//! the `metrics` crate's global recorder. Wiring up an actual exporter
//! (Prometheus, statsd, ...) is left to the binary that installs a
//! recorder; this module only defines *what* gets recorded.

use std::sync::atomic::{AtomicBool, Ordering};

use partdb_core::PartitionId;

use crate::config::NodeConfig;

static ENABLED: AtomicBool = AtomicBool::new(true);

/// Gates every counter/gauge in this module on `NodeConfig::metrics_enabled`.
/// Called once by whoever constructs the node's runtime.
pub fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
}

/// Applies `config.metrics_enabled` to the gate. Called from the
/// migration/replication components' constructors so a node built with
/// `metrics_enabled: false` doesn't pay for counter recording.
pub fn init_from_config(config: &NodeConfig) {
    set_enabled(config.metrics_enabled);
}

fn enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

pub fn migrate_insert_sent(partition: PartitionId) {
    if !enabled() {
        return;
    }
    metrics::counter!("partdb_migrate_inserts_sent_total", "partition" => partition.0.to_string())
        .increment(1);
}

pub fn migrate_insert_acked(partition: PartitionId) {
    if !enabled() {
        return;
    }
    metrics::counter!("partdb_migrate_inserts_acked_total", "partition" => partition.0.to_string())
        .increment(1);
}

pub fn migrate_insert_retransmitted(partition: PartitionId) {
    if !enabled() {
        return;
    }
    metrics::counter!("partdb_migrate_retransmits_total", "partition" => partition.0.to_string())
        .increment(1);
}

pub fn migrate_session_started() {
    if !enabled() {
        return;
    }
    metrics::counter!("partdb_migrate_sessions_started_total").increment(1);
}

pub fn migrate_session_completed() {
    if !enabled() {
        return;
    }
    metrics::counter!("partdb_migrate_sessions_completed_total").increment(1);
}

pub fn migrate_session_cancelled() {
    if !enabled() {
        return;
    }
    metrics::counter!("partdb_migrate_sessions_cancelled_total").increment(1);
}

pub fn migrate_done_observed(partition: PartitionId) {
    if !enabled() {
        return;
    }
    metrics::counter!("partdb_migrate_done_observed_total", "partition" => partition.0.to_string())
        .increment(1);
}

pub fn migrate_session_reaped() {
    if !enabled() {
        return;
    }
    metrics::counter!("partdb_migrate_sessions_reaped_total").increment(1);
}

pub fn migrate_pickle_rejected() {
    if !enabled() {
        return;
    }
    metrics::counter!("partdb_migrate_pickle_rejected_total").increment(1);
}

pub fn replicated_write_attempted() {
    if !enabled() {
        return;
    }
    metrics::counter!("partdb_replicated_writes_attempted_total").increment(1);
}

pub fn replicated_write_succeeded() {
    if !enabled() {
        return;
    }
    metrics::counter!("partdb_replicated_writes_succeeded_total").increment(1);
}

pub fn replicated_write_timed_out() {
    if !enabled() {
        return;
    }
    metrics::counter!("partdb_replicated_writes_timed_out_total").increment(1);
}

pub fn storage_cost_bytes(bytes: u64) {
    if !enabled() {
        return;
    }
    metrics::gauge!("partdb_storage_cost_bytes").set(bytes as f64);
}
