//! The record: a digest-keyed set of bins plus the metadata the merge
//! policy and migration/replication flows compare against.

use std::collections::BTreeMap;

use crate::value::Value;

/// Ordered bins, keyed by name. `BTreeMap` gives a deterministic iteration
/// order for the pickle codec (spec.md §4.B writes bins in a fixed order).
pub type Bins = BTreeMap<String, Value>;

/// Version/freshness metadata carried alongside a record's bins.
///
/// Two records for the same digest are compared by `(last_update_time,
/// generation)` — see [`crate::merge`] for the ordering rule. Kept
/// separate from [`Record`] so migration/replication messages that only
/// need to compare freshness (without moving the bin payload) can pass
/// this alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RecordMeta {
    /// Bumped on every successful write; wraps at `u16::MAX` (spec.md §3).
    pub generation: u16,
    /// Unix seconds after which this record expires; 0 means no expiry.
    pub void_time: u32,
    /// Monotonic write timestamp in milliseconds, the merge tiebreaker
    /// when two writes land on the same generation.
    pub last_update_time: u64,
    /// Namespace-local set identifier.
    pub set_id: u16,
}

impl RecordMeta {
    #[must_use]
    pub fn bump_generation(self, last_update_time: u64) -> Self {
        let next = self.generation.wrapping_add(1);
        Self {
            generation: if next == 0 { 1 } else { next },
            last_update_time,
            ..self
        }
    }
}

/// A full record: its bins plus metadata.
///
/// `stored_key` is `Some` only when the namespace is configured to retain
/// the original key bytes alongside the digest (spec.md §3); most records
/// carry only the digest and this is `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub meta: RecordMeta,
    pub bins: Bins,
    pub stored_key: Option<Vec<u8>>,
}

impl Record {
    #[must_use]
    pub fn new(meta: RecordMeta, bins: Bins) -> Self {
        Self {
            meta,
            bins,
            stored_key: None,
        }
    }

    #[must_use]
    pub fn with_stored_key(mut self, key: Vec<u8>) -> Self {
        self.stored_key = Some(key);
        self
    }

    /// A "drop pickle" tombstone: zero bins with no meaning other than
    /// "delete this digest" (spec.md §4.B). Carries the meta of the
    /// delete operation so the merge policy can still compare it against
    /// what's currently stored.
    #[must_use]
    pub fn tombstone(meta: RecordMeta) -> Self {
        Self {
            meta,
            bins: Bins::new(),
            stored_key: None,
        }
    }

    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.bins.is_empty()
    }

    /// Estimated heap footprint of bins plus stored key, used for
    /// storage-full accounting (spec.md §7 `OutOfSpace`).
    #[must_use]
    pub fn cost(&self) -> u64 {
        let bins_cost: u64 = self
            .bins
            .iter()
            .map(|(name, v)| name.len() as u64 + v.estimated_cost())
            .sum();
        let key_cost = self.stored_key.as_ref().map_or(0, |k| k.len() as u64);
        bins_cost + key_cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(generation: u16, lut: u64) -> RecordMeta {
        RecordMeta {
            generation,
            void_time: 0,
            last_update_time: lut,
            set_id: 1,
        }
    }

    #[test]
    fn bump_generation_wraps_at_max() {
        let m = meta(u16::MAX, 10).bump_generation(11);
        assert_eq!(m.generation, 1);
        assert_eq!(m.last_update_time, 11);
    }

    #[test]
    fn tombstone_has_no_bins() {
        let r = Record::tombstone(meta(1, 10));
        assert!(r.is_tombstone());
        assert_eq!(r.cost(), 0);
    }

    #[test]
    fn cost_accounts_for_bin_names_and_stored_key() {
        let mut bins = Bins::new();
        bins.insert("name".to_string(), Value::String("abc".to_string()));
        let r = Record::new(meta(1, 10), bins).with_stored_key(vec![1, 2, 3]);
        // "name" (4) + "abc" (3) + stored key (3)
        assert_eq!(r.cost(), 10);
    }

    #[test]
    fn non_empty_bins_is_not_tombstone() {
        let mut bins = Bins::new();
        bins.insert("a".to_string(), Value::Nil);
        let r = Record::new(meta(1, 10), bins);
        assert!(!r.is_tombstone());
    }
}
