//! Page id to frame hash index.
//!
//! Each bucket has its own reader/writer lock. A bucket keeps a few entries
//! inline and chains overflow segments when it fills up, so a bad hash spread
//! degrades to short linear scans instead of failed inserts.

use parking_lot::RwLock;
use storage::PageId;

/// Seed mixed into every key before bucketing.
const HASH_SEED: u64 = 0x35D0_B891;
/// Entries stored in the first segment of every bucket.
const INLINE_ENTRIES: usize = 4;
/// First overflow segment is this many times the inline size.
const FIRST_OVERFLOW_FACTOR: usize = 16;
/// Each further overflow segment grows by this factor.
const OVERFLOW_GROWTH: usize = 4;

struct Segment<V> {
    capacity: usize,
    entries: Vec<(PageId, V)>,
}

impl<V> Segment<V> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::with_capacity(capacity),
        }
    }

    fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }
}

struct Bucket<V> {
    segments: Vec<Segment<V>>,
}

impl<V: Copy> Bucket<V> {
    fn new() -> Self {
        Self {
            segments: vec![Segment::with_capacity(INLINE_ENTRIES)],
        }
    }

    fn position(&self, key: PageId) -> Option<(usize, usize)> {
        self.segments.iter().enumerate().find_map(|(s, seg)| {
            seg.entries
                .iter()
                .position(|(k, _)| *k == key)
                .map(|e| (s, e))
        })
    }

    fn push(&mut self, key: PageId, value: V) {
        if let Some(seg) = self.segments.iter_mut().find(|seg| !seg.is_full()) {
            seg.entries.push((key, value));
            return;
        }
        let last = self.segments.last().map_or(INLINE_ENTRIES, |s| s.capacity);
        let capacity = if self.segments.len() == 1 {
            last * FIRST_OVERFLOW_FACTOR
        } else {
            last * OVERFLOW_GROWTH
        };
        let mut seg = Segment::with_capacity(capacity);
        seg.entries.push((key, value));
        self.segments.push(seg);
    }

    /// Removes the entry at `(s, e)`, moving the bucket's last entry into
    /// the hole so segments stay densely packed front to back.
    fn remove_at(&mut self, s: usize, e: usize) {
        let last_seg = self
            .segments
            .iter()
            .rposition(|seg| !seg.entries.is_empty())
            .unwrap_or(0);
        if let Some(moved) = self.segments[last_seg].entries.pop() {
            if (s, e) != (last_seg, self.segments[last_seg].entries.len()) {
                self.segments[s].entries[e] = moved;
            }
        }
        // drop trailing overflow segments that became empty
        while self.segments.len() > 1
            && self.segments.last().is_some_and(|seg| seg.entries.is_empty())
        {
            self.segments.pop();
        }
    }

    fn len(&self) -> usize {
        self.segments.iter().map(|s| s.entries.len()).sum()
    }
}

/// Concurrent map from page id to a small copyable value.
pub struct HashIndex<V> {
    buckets: Box<[RwLock<Bucket<V>>]>,
}

impl<V: Copy> HashIndex<V> {
    /// Creates an index with a fixed number of buckets (at least one).
    pub fn new(bucket_count: usize) -> Self {
        let buckets = (0..bucket_count.max(1))
            .map(|_| RwLock::new(Bucket::new()))
            .collect();
        Self { buckets }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket(&self, key: PageId) -> &RwLock<Bucket<V>> {
        let idx = hash_page_id(key) as usize % self.buckets.len();
        &self.buckets[idx]
    }

    pub fn lookup(&self, key: PageId) -> Option<V> {
        let bucket = self.bucket(key).read();
        bucket
            .position(key)
            .map(|(s, e)| bucket.segments[s].entries[e].1)
    }

    /// Inserts `key` unless it is already present. Returns whether it was
    /// inserted.
    pub fn insert_if_not_exists(&self, key: PageId, value: V) -> bool {
        let mut bucket = self.bucket(key).write();
        if bucket.position(key).is_some() {
            return false;
        }
        bucket.push(key, value);
        true
    }

    /// Replaces the value of an existing key. Returns false if absent.
    pub fn update(&self, key: PageId, value: V) -> bool {
        let mut bucket = self.bucket(key).write();
        match bucket.position(key) {
            Some((s, e)) => {
                bucket.segments[s].entries[e].1 = value;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, key: PageId) -> bool {
        let mut bucket = self.bucket(key).write();
        match bucket.position(key) {
            Some((s, e)) => {
                bucket.remove_at(s, e);
                true
            }
            None => false,
        }
    }

    /// Number of entries. Buckets are read one at a time, so the result is
    /// only exact when no writer is active.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Seeded 64-bit finalizer (murmur3 fmix64) folded to 32 bits.
fn hash_page_id(key: PageId) -> u32 {
    let mut x = key ^ HASH_SEED.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    x ^= x >> 33;
    x = x.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
    x ^= x >> 33;
    x = x.wrapping_mul(0xC4CE_B9FE_1A85_EC53);
    x ^= x >> 33;
    (x ^ (x >> 32)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use std::collections::HashMap;

    #[test]
    fn test_basic_operations() {
        let index = HashIndex::new(8);
        assert!(index.insert_if_not_exists(42, 7u32));
        assert_eq!(index.lookup(42), Some(7));
        assert!(!index.insert_if_not_exists(42, 9));
        assert_eq!(index.lookup(42), Some(7));
        assert!(index.update(42, 9));
        assert_eq!(index.lookup(42), Some(9));
        assert!(index.remove(42));
        assert_eq!(index.lookup(42), None);
        assert!(!index.remove(42));
        assert!(!index.update(42, 1));
    }

    #[test]
    fn test_single_bucket_grows_overflow_segments() {
        let index = HashIndex::new(1);
        for key in 1..=200u64 {
            assert!(index.insert_if_not_exists(key, key * 10));
        }
        {
            let bucket = index.buckets[0].read();
            let caps: Vec<usize> = bucket.segments.iter().map(|s| s.capacity).collect();
            assert_eq!(caps, vec![4, 64, 256]);
        }
        for key in 1..=200u64 {
            assert_eq!(index.lookup(key), Some(key * 10));
        }
        // remove from the inline segment; a tail entry fills the hole
        for key in 1..=150u64 {
            assert!(index.remove(key));
        }
        for key in 151..=200u64 {
            assert_eq!(index.lookup(key), Some(key * 10));
        }
        assert_eq!(index.len(), 50);
        let bucket = index.buckets[0].read();
        assert_eq!(bucket.segments.len(), 2);
        assert_eq!(bucket.segments[0].entries.len(), 4);
    }

    #[test]
    fn test_matches_model_under_random_ops() {
        let mut rng = StdRng::seed_from_u64(7);
        let index = HashIndex::new(3);
        let mut model = HashMap::new();
        for _ in 0..5000 {
            let key = rng.gen_range(1..300u64);
            match rng.gen_range(0..4) {
                0 => {
                    let inserted = index.insert_if_not_exists(key, key);
                    assert_eq!(inserted, !model.contains_key(&key));
                    model.entry(key).or_insert(key);
                }
                1 => {
                    let v = rng.r#gen::<u64>();
                    assert_eq!(index.update(key, v), model.contains_key(&key));
                    if let Some(slot) = model.get_mut(&key) {
                        *slot = v;
                    }
                }
                2 => assert_eq!(index.remove(key), model.remove(&key).is_some()),
                _ => assert_eq!(index.lookup(key), model.get(&key).copied()),
            }
        }
        assert_eq!(index.len(), model.len());
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(hash_page_id(5), hash_page_id(5));
        assert_ne!(hash_page_id(5), hash_page_id(6));
    }
}
