//! Clock source for the last-update-time tiebreaker.
//!
//! Record generations are tiebroken by last-update-time (LUT), a 64-bit
//! millisecond epoch from "a monotonic cluster-wide source" (spec.md §3).
//! This module provides the abstraction ([`ClockSource`]) and a
//! process-local monotonic wrapper ([`MonotonicClock`]) that never returns a
//! value smaller than the last one it handed out, even across system clock
//! adjustments. Cluster-wide monotonicity (e.g. via NTP discipline or a
//! dedicated time service) is outside this crate's scope; this wrapper only
//! guarantees the single-process invariant the merge policy depends on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Abstraction over "the current time in milliseconds since the Unix epoch".
///
/// Allows deterministic testing by substituting a virtual clock for
/// [`SystemClock`].
pub trait ClockSource: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Clock source backed by the real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the Unix epoch")
            .as_millis() as u64
    }
}

/// Wraps any [`ClockSource`] to guarantee the sequence of values it returns
/// never decreases, even if the underlying clock is stepped backwards.
///
/// Used to stamp `last_update_time` on locally originated writes: two writes
/// issued back-to-back on the same node must never tie (or worse, invert)
/// just because the wall clock didn't tick between them.
pub struct MonotonicClock<C> {
    inner: C,
    last: AtomicU64,
}

impl<C: ClockSource> MonotonicClock<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            last: AtomicU64::new(0),
        }
    }

    /// Returns a timestamp `>= ` every value previously returned by this
    /// instance.
    pub fn now_millis(&self) -> u64 {
        let observed = self.inner.now_millis();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = if observed > prev { observed } else { prev + 1 };
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}
