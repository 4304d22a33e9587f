use std::sync::Arc;
use std::thread;

use bufpool::HashIndex;

#[test]
fn test_insert_lookup_update_remove() {
    let index: HashIndex<usize> = HashIndex::new(16);
    assert!(index.is_empty());
    assert!(index.insert_if_not_exists(42, 7));
    assert_eq!(index.lookup(42), Some(7));
    assert!(!index.insert_if_not_exists(42, 9));
    assert_eq!(index.lookup(42), Some(7));

    assert!(index.update(42, 9));
    assert_eq!(index.lookup(42), Some(9));
    assert!(!index.update(43, 1));

    assert!(index.remove(42));
    assert_eq!(index.lookup(42), None);
    assert!(!index.remove(42));
    assert!(index.is_empty());
}

#[test]
fn test_concurrent_disjoint_inserts() {
    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 500;
    // few buckets so threads share overflow segments
    let index: Arc<HashIndex<u64>> = Arc::new(HashIndex::new(4));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let index = Arc::clone(&index);
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let key = t * PER_THREAD + i + 1;
                    assert!(index.insert_if_not_exists(key, key * 2));
                }
                for i in (0..PER_THREAD).step_by(2) {
                    assert!(index.remove(t * PER_THREAD + i + 1));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(index.len() as u64, THREADS * PER_THREAD / 2);
    for key in 1..=THREADS * PER_THREAD {
        let expected = ((key - 1) % 2 == 1).then_some(key * 2);
        assert_eq!(index.lookup(key), expected, "key {key}");
    }
}
