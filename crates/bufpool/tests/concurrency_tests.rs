mod common;

use std::sync::Arc;
use std::thread;

use bufpool::LatchMode;
use common::{ALL_POLICIES, fixture, options};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const FRAMES: usize = 8;
const PAGES: usize = 20;
const THREADS: u64 = 4;
const READS_PER_THREAD: usize = 400;

#[test]
fn test_concurrent_readers_see_written_contents() {
    for policy in ALL_POLICIES {
        let fx = Arc::new(fixture(FRAMES, options(policy)));
        let pages = fx.alloc_pages(PAGES);
        for pid in &pages {
            let mut guard = fx.bpm.fix(*pid, LatchMode::Exclusive).unwrap();
            guard.update(0, &pid.to_le_bytes()).unwrap();
        }

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let fx = Arc::clone(&fx);
                let pages = pages.clone();
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(t);
                    for _ in 0..READS_PER_THREAD {
                        let pid = pages[rng.gen_range(0..pages.len())];
                        let guard = fx.bpm.fix(pid, LatchMode::Shared).unwrap();
                        assert_eq!(guard.page_id(), pid);
                        assert_eq!(guard.read(0, 8), Some(&pid.to_le_bytes()[..]));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let stats = fx.evictioner().stats();
        assert!(stats.evicted >= (PAGES - FRAMES) as u64, "{policy}: {stats:?}");
        assert!(fx.bpm.pool().hashtable().len() <= FRAMES);
    }
}

#[test]
fn test_concurrent_writers_on_disjoint_pages() {
    for policy in ALL_POLICIES {
        let fx = Arc::new(fixture(FRAMES, options(policy)));
        let pages = fx.alloc_pages(PAGES);

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let fx = Arc::clone(&fx);
                let mine: Vec<_> = pages
                    .iter()
                    .copied()
                    .filter(|pid| pid % THREADS == t)
                    .collect();
                thread::spawn(move || {
                    for round in 0u64..10 {
                        for pid in &mine {
                            let mut guard = fx.bpm.fix(*pid, LatchMode::Exclusive).unwrap();
                            guard.update(0, &(pid * 100 + round).to_le_bytes()).unwrap();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        for pid in &pages {
            let guard = fx.bpm.fix(*pid, LatchMode::Shared).unwrap();
            assert_eq!(guard.read(0, 8), Some(&(pid * 100 + 9).to_le_bytes()[..]));
        }
    }
}
