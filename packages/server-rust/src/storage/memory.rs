//! In-memory [`StorageEngine`] implementation backed by [`DashMap`].
//!
//! Lock-free concurrent access, suitable for the migration/replication
//! paths where many partition workers and the replicated-write receiver
//! touch the same map concurrently.

use dashmap::DashMap;
use partdb_core::{Digest, Record};

use super::engine::{FetchResult, IterationCursor, StorageEngine};

pub struct HashMapStorage {
    entries: DashMap<Digest, Record>,
}

impl HashMapStorage {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl Default for HashMapStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_cursor_offset(cursor: &IterationCursor) -> usize {
    if cursor.state.is_empty() {
        0
    } else {
        let mut buf = [0u8; 8];
        let len = cursor.state.len().min(8);
        buf[..len].copy_from_slice(&cursor.state[..len]);
        u64::from_le_bytes(buf) as usize
    }
}

fn encode_cursor_offset(offset: usize) -> Vec<u8> {
    (offset as u64).to_le_bytes().to_vec()
}

impl StorageEngine for HashMapStorage {
    fn put(&self, digest: Digest, record: Record) -> Option<Record> {
        self.entries.insert(digest, record)
    }

    fn get(&self, digest: &Digest) -> Option<Record> {
        self.entries.get(digest).map(|r| r.clone())
    }

    fn remove(&self, digest: &Digest) -> Option<Record> {
        self.entries.remove(digest).map(|(_, r)| r)
    }

    fn contains_key(&self, digest: &Digest) -> bool {
        self.entries.contains_key(digest)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn clear(&self) {
        self.entries.clear();
    }

    fn estimated_cost(&self) -> u64 {
        self.entries.iter().map(|r| r.value().cost()).sum()
    }

    fn snapshot_iter(&self) -> Vec<(Digest, Record)> {
        self.entries
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    fn fetch_entries(&self, cursor: &IterationCursor, size: usize) -> FetchResult<(Digest, Record)> {
        let snapshot = self.snapshot_iter();
        let total = snapshot.len();
        let offset = decode_cursor_offset(cursor);

        let items: Vec<(Digest, Record)> = snapshot.into_iter().skip(offset).take(size).collect();

        let new_offset = offset + items.len();
        let finished = new_offset >= total;

        FetchResult {
            items,
            next_cursor: IterationCursor {
                state: encode_cursor_offset(new_offset),
                finished,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use partdb_core::RecordMeta;
    use std::collections::BTreeMap;

    fn make_record(cost_bytes: usize) -> Record {
        let mut bins = BTreeMap::new();
        if cost_bytes > 0 {
            bins.insert(
                "v".to_string(),
                partdb_core::Value::Bytes(vec![0u8; cost_bytes]),
            );
        }
        Record::new(
            RecordMeta {
                generation: 1,
                void_time: 0,
                last_update_time: 0,
                set_id: 0,
            },
            bins,
        )
    }

    #[test]
    fn put_get_remove_round_trip() {
        let storage = HashMapStorage::new();
        let d = Digest::compute("ns", b"k1");
        assert!(storage.put(d, make_record(100)).is_none());

        let fetched = storage.get(&d);
        assert!(fetched.is_some());

        let removed = storage.remove(&d);
        assert!(removed.is_some());
        assert!(storage.get(&d).is_none());
    }

    #[test]
    fn len_and_is_empty() {
        let storage = HashMapStorage::new();
        assert!(storage.is_empty());

        storage.put(Digest::compute("ns", b"a"), make_record(1));
        storage.put(Digest::compute("ns", b"b"), make_record(2));
        assert_eq!(storage.len(), 2);
    }

    #[test]
    fn fetch_entries_with_cursor_pagination() {
        let storage = HashMapStorage::new();
        for i in 0..5 {
            storage.put(Digest::compute("ns", &[i]), make_record(i as usize));
        }

        let cursor = IterationCursor::start();
        let result = storage.fetch_entries(&cursor, 2);
        assert_eq!(result.items.len(), 2);
        assert!(!result.next_cursor.finished);

        let result2 = storage.fetch_entries(&result.next_cursor, 2);
        assert_eq!(result2.items.len(), 2);

        let result3 = storage.fetch_entries(&result2.next_cursor, 2);
        assert_eq!(result3.items.len(), 1);
        assert!(result3.next_cursor.finished);
    }

    #[test]
    fn estimated_cost_sums_all_records() {
        let storage = HashMapStorage::new();
        storage.put(Digest::compute("ns", b"a"), make_record(100));
        storage.put(Digest::compute("ns", b"b"), make_record(200));
        assert_eq!(storage.estimated_cost(), 302); // 100 + 200 bytes, plus 1-byte bin name each
    }

    #[test]
    fn entries_in_partition_filters_by_digest() {
        let storage = HashMapStorage::new();
        for i in 0..50u8 {
            storage.put(Digest::compute("ns", &[i]), make_record(0));
        }
        let all = storage.snapshot_iter();
        let pid = partdb_core::partition_of(&all[0].0, 16);
        let filtered = storage.entries_in_partition(16, pid);
        assert!(filtered.iter().all(|(d, _)| partdb_core::partition_of(d, 16) == pid));
        assert!(!filtered.is_empty());
    }
}
