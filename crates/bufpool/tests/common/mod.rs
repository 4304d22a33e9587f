#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use bufpool::{BufferOptions, BufferPool, BufferPoolManager, EvictPolicy, PageEvictioner};
use storage::{MemoryVolume, PageId, Volume};
use tempfile::TempDir;
use wal::LogManager;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct Fixture {
    pub dir: TempDir,
    pub volume: Arc<MemoryVolume>,
    pub log: LogManager,
    pub bpm: BufferPoolManager,
}

impl Fixture {
    pub fn log_path(&self) -> PathBuf {
        self.dir.path().join("bufpool.log")
    }

    /// Allocates `n` raw pages on the volume.
    pub fn alloc_pages(&self, n: usize) -> Vec<PageId> {
        (0..n).map(|_| self.volume.allocate_page().unwrap()).collect()
    }

    pub fn evictioner(&self) -> &Arc<dyn PageEvictioner> {
        self.bpm.evictioner()
    }
}

fn parts(frames: usize, options: BufferOptions) -> (TempDir, Arc<MemoryVolume>, LogManager, Arc<BufferPool>) {
    init_logging();
    let dir = TempDir::new().unwrap();
    let log = LogManager::open(dir.path().join("bufpool.log")).unwrap();
    let volume = Arc::new(MemoryVolume::new());
    let pool = Arc::new(BufferPool::new(frames, volume.clone(), log.clone(), options));
    (dir, volume, log, pool)
}

pub fn fixture(frames: usize, options: BufferOptions) -> Fixture {
    let (dir, volume, log, pool) = parts(frames, options);
    Fixture {
        dir,
        volume,
        log,
        bpm: BufferPoolManager::with_pool(pool),
    }
}

/// Builds a fixture around an evictioner the test keeps a typed handle to.
pub fn fixture_with<E, F>(frames: usize, options: BufferOptions, make: F) -> (Fixture, Arc<E>)
where
    E: PageEvictioner + 'static,
    F: FnOnce(Arc<BufferPool>) -> E,
{
    let (dir, volume, log, pool) = parts(frames, options);
    let evictioner = Arc::new(make(Arc::clone(&pool)));
    let bpm = BufferPoolManager::with_evictioner(pool, evictioner.clone());
    (
        Fixture {
            dir,
            volume,
            log,
            bpm,
        },
        evictioner,
    )
}

pub fn options(policy: EvictPolicy) -> BufferOptions {
    BufferOptions {
        evict_policy: policy,
        ..BufferOptions::default()
    }
}

pub const ALL_POLICIES: [EvictPolicy; 3] = [EvictPolicy::Random, EvictPolicy::Gclock, EvictPolicy::Car];
