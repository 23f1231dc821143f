//! The per-namespace storage wrapper.
//!
//! Sits above a raw [`StorageEngine`] and is the only thing the migration
//! and replication code talks to: it applies the shared merge policy
//! (spec.md §4.D/§4.E) on every write and enforces the namespace's storage
//! cost budget before accepting new data.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use partdb_core::{merge_decide, Digest, MergeOutcome, Record, RecordMeta};

use crate::error::{NodeError, NodeResult};
use crate::storage::engine::StorageEngine;

pub struct Namespace {
    storage: Arc<dyn StorageEngine>,
    max_cost_bytes: u64,
    cost: AtomicU64,
    /// Per-set truncate-before cutoff: a write whose last-update-time is
    /// at or before the recorded cutoff for its set is rejected with
    /// `Forbidden` rather than applied (spec.md §4.D "Truncation").
    truncate_points: DashMap<u16, u64>,
}

impl Namespace {
    #[must_use]
    pub fn new(storage: Arc<dyn StorageEngine>, max_cost_bytes: u64) -> Self {
        let cost = storage.estimated_cost();
        Self {
            storage,
            max_cost_bytes,
            cost: AtomicU64::new(cost),
            truncate_points: DashMap::new(),
        }
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<dyn StorageEngine> {
        &self.storage
    }

    #[must_use]
    pub fn existing_meta(&self, digest: &Digest) -> Option<RecordMeta> {
        self.storage.get(digest).map(|r| r.meta)
    }

    /// Records that every record in `set_id` with a last-update-time at
    /// or before `before_lut` is considered truncated: subsequent writes
    /// and migration/replication inserts for that set with an
    /// older-or-equal LUT are rejected rather than applied. A later call
    /// for the same set overwrites the cutoff (truncate-before-LUT is not
    /// cumulative across the set's history).
    pub fn set_truncate_point(&self, set_id: u16, before_lut: u64) {
        self.truncate_points.insert(set_id, before_lut);
    }

    fn is_truncated(&self, meta: &RecordMeta) -> bool {
        self.truncate_points
            .get(&meta.set_id)
            .is_some_and(|cutoff| meta.last_update_time <= *cutoff)
    }

    /// Cheap pre-check against the truncate point and storage budget using
    /// a pickle's on-wire footprint (`crate::pickle::footprint`), before
    /// paying for a full decode. Mirrors [`Namespace::apply_write`]'s
    /// merge-then-budget logic against `meta` alone.
    ///
    /// Returns `Ok(true)` if a full decode should go on to call
    /// `apply_write`, `Ok(false)` if the merge would reject the write
    /// anyway (the caller can ack stale without decoding).
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Forbidden`] or [`NodeError::OutOfSpace`] for
    /// the same reasons `apply_write` would once fully decoded.
    pub fn precheck_write(&self, digest: &Digest, meta: &RecordMeta, footprint: u64) -> NodeResult<bool> {
        if self.is_truncated(meta) {
            return Err(NodeError::Forbidden);
        }

        let existing = self.storage.get(digest);
        let existing_meta = existing.as_ref().map(|r| r.meta);
        if merge_decide(existing_meta, *meta) == MergeOutcome::Reject {
            return Ok(false);
        }

        let existing_cost = existing.as_ref().map_or(0, Record::cost);
        let projected = self
            .cost
            .load(Ordering::Relaxed)
            .saturating_sub(existing_cost)
            .saturating_add(footprint);

        if footprint > 0 && projected > self.max_cost_bytes {
            return Err(NodeError::OutOfSpace);
        }
        Ok(true)
    }

    /// Applies `incoming` if it is newer than what's stored, enforcing the
    /// storage cost budget. Returns `Ok(true)` if applied, `Ok(false)` if
    /// the write lost the merge race (not an error: the caller still acks).
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Forbidden`] if `incoming`'s set has been
    /// truncated past its last-update-time, or [`NodeError::OutOfSpace`]
    /// if applying it would push the namespace over its configured cost
    /// budget.
    pub fn apply_write(&self, digest: Digest, incoming: Record) -> NodeResult<bool> {
        if self.is_truncated(&incoming.meta) {
            return Err(NodeError::Forbidden);
        }

        let existing = self.storage.get(&digest);
        let existing_meta = existing.as_ref().map(|r| r.meta);

        if merge_decide(existing_meta, incoming.meta) == MergeOutcome::Reject {
            return Ok(false);
        }

        let existing_cost = existing.as_ref().map_or(0, Record::cost);
        let incoming_cost = incoming.cost();
        let projected = self
            .cost
            .load(Ordering::Relaxed)
            .saturating_sub(existing_cost)
            .saturating_add(incoming_cost);

        if !incoming.is_tombstone() && projected > self.max_cost_bytes {
            return Err(NodeError::OutOfSpace);
        }

        if incoming.is_tombstone() {
            self.storage.remove(&digest);
            self.cost.fetch_sub(existing_cost, Ordering::Relaxed);
        } else {
            self.storage.put(digest, incoming);
            self.cost.store(projected, Ordering::Relaxed);
        }
        crate::metrics::storage_cost_bytes(self.cost.load(Ordering::Relaxed));
        Ok(true)
    }

    #[must_use]
    pub fn cost_bytes(&self) -> u64 {
        self.cost.load(Ordering::Relaxed)
    }
}
