//! Partition reservations: the state machine and in-flight-operation
//! tracking that gate every migration transition.
//!
//! A [`PartitionRegistry`] holds one slot per partition this node has
//! touched: an `ArcSwap<PartitionState>` for the migration state machine
//! and an `AtomicU64` refcount of outstanding [`Reservation`] guards.
//! `reserve` is infallible -- it always hands back a guard, and callers
//! check [`Reservation::state`] before using the tree (spec.md §4.A:
//! "`Sync` and `Zombie` are readable sources for emigration; `Absent`/
//! `Undef` are invalid"). Reservations nest; release happens exactly once
//! per guard, on `Drop`, the same pattern the teacher's
//! `ShutdownController`/`InFlightGuard` use for request draining.
//!
//! A migration transition away from the current state blocks until every
//! outstanding reservation against the partition has released (spec.md
//! §3 invariant 2, §4.A "Rebalance waits until every reservation against
//! a departing partition is released") -- `end_migration` spin-waits for
//! the refcount to drain before flipping the state back to `Stable`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use partdb_core::{ClusterKey, NodeId, PartitionId};

use crate::error::{NodeError, NodeResult};

/// What a partition is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    /// Not involved in any migration; normal reads/writes proceed.
    Stable,
    /// Emigrating to `dest`: reads/writes still served locally, but
    /// outbound `MIGRATE` traffic is in flight to `dest`.
    Emigrating { dest: NodeId },
    /// Immigrating from `source`: inbound `MIGRATE` records are being
    /// applied; the partition is not yet eligible for client writes that
    /// this node would need to serve as primary.
    Immigrating { source: NodeId },
}

struct PartitionSlot {
    partition: PartitionId,
    state: ArcSwap<PartitionState>,
    refcount: AtomicU64,
}

/// Per-partition reservation table, one slot created lazily per
/// partition a caller has touched.
pub struct PartitionRegistry {
    slots: DashMap<PartitionId, Arc<PartitionSlot>>,
}

impl PartitionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { slots: DashMap::new() }
    }

    fn slot_for(&self, partition: PartitionId) -> Arc<PartitionSlot> {
        self.slots
            .entry(partition)
            .or_insert_with(|| {
                Arc::new(PartitionSlot {
                    partition,
                    state: ArcSwap::from_pointee(PartitionState::Stable),
                    refcount: AtomicU64::new(0),
                })
            })
            .clone()
    }

    /// Reserves `partition`. Always succeeds; the caller must check
    /// [`Reservation::state`] before treating the tree as usable.
    #[must_use]
    pub fn reserve(&self, partition: PartitionId) -> Reservation {
        let slot = self.slot_for(partition);
        slot.refcount.fetch_add(1, Ordering::Relaxed);
        Reservation { slot }
    }

    #[must_use]
    pub fn state(&self, partition: PartitionId) -> PartitionState {
        **self.slot_for(partition).state.load()
    }

    #[must_use]
    pub fn in_flight_count(&self, partition: PartitionId) -> u64 {
        self.slot_for(partition).refcount.load(Ordering::Relaxed)
    }

    /// Transitions `partition` into a migration state. Fails with
    /// `Forbidden` if it isn't currently `Stable` -- only one migration
    /// session per partition at a time.
    pub fn begin_migration(&self, partition: PartitionId, state: PartitionState) -> NodeResult<()> {
        if matches!(state, PartitionState::Stable) {
            return Err(NodeError::Forbidden);
        }
        let slot = self.slot_for(partition);
        let mut forbidden = false;
        slot.state.rcu(|current| {
            forbidden = !matches!(**current, PartitionState::Stable);
            if forbidden {
                Arc::clone(current)
            } else {
                Arc::new(state)
            }
        });
        if forbidden {
            return Err(NodeError::Forbidden);
        }
        Ok(())
    }

    /// Waits up to `timeout` for every outstanding reservation against
    /// `partition` to drain, then returns it to `Stable`. Returns `false`
    /// if the wait times out, leaving the partition in its migration
    /// state rather than tearing down work still in flight.
    pub fn end_migration(&self, partition: PartitionId, timeout: Duration) -> bool {
        let slot = self.slot_for(partition);
        let deadline = Instant::now() + timeout;
        loop {
            if slot.refcount.load(Ordering::Relaxed) == 0 {
                slot.state.store(Arc::new(PartitionState::Stable));
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Default for PartitionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for one outstanding use of a partition's tree -- held for
/// the duration of a record apply so a migration transition can't
/// complete out from under it. Dropping it releases the reservation
/// exactly once.
pub struct Reservation {
    slot: Arc<PartitionSlot>,
}

impl Reservation {
    #[must_use]
    pub fn partition(&self) -> PartitionId {
        self.slot.partition
    }

    #[must_use]
    pub fn state(&self) -> PartitionState {
        **self.slot.state.load()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.slot.refcount.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Checks an inbound message's cluster key against the node's current
/// epoch; mismatches soft-cancel the caller's in-flight transition.
pub fn check_fence(local: ClusterKey, message: ClusterKey) -> NodeResult<()> {
    if local == message {
        Ok(())
    } else {
        Err(NodeError::ClusterKeyMismatch { message, local })
    }
}
