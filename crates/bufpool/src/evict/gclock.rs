use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use log::trace;
use parking_lot::Mutex;

use super::{EvictionCore, PageEvictioner, Victim};
use crate::error::BufferResult;
use crate::frame::FrameIndex;
use crate::pool::BufferPool;

/// Counter value of frames that must never be evicted. Never decremented.
const BLOCKED: u16 = u16::MAX;

/// Generalized CLOCK. Every reference sets the frame's counter to `k`; the
/// hand decrements counters as it sweeps and evicts the first frame it
/// finds at zero.
pub struct GClockEvictioner {
    core: EvictionCore,
    k: u16,
    counts: Box<[AtomicU16]>,
    hand: Mutex<usize>,
}

impl GClockEvictioner {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        let k = pool.options().effective_gclock_k().min(BLOCKED - 1);
        let counts = (0..pool.block_count()).map(|_| AtomicU16::new(0)).collect();
        Self {
            core: EvictionCore::new(pool),
            k,
            counts,
            hand: Mutex::new(0),
        }
    }

    pub fn k(&self) -> u16 {
        self.k
    }

    /// Current counter of `idx`.
    pub fn count(&self, idx: FrameIndex) -> u16 {
        self.counts
            .get(idx.as_usize())
            .map_or(0, |c| c.load(Ordering::Acquire))
    }

    fn set(&self, idx: FrameIndex, value: u16) {
        if let Some(c) = self.counts.get(idx.as_usize()) {
            c.store(value, Ordering::Release);
        }
    }

    /// Refreshes the counter unless the frame is blocked.
    fn touch(&self, idx: FrameIndex) {
        if let Some(c) = self.counts.get(idx.as_usize()) {
            let _ = c.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                (v != BLOCKED).then_some(self.k)
            });
        }
    }
}

impl PageEvictioner for GClockEvictioner {
    fn core(&self) -> &EvictionCore {
        &self.core
    }

    fn hit_ref(&self, idx: FrameIndex) {
        self.touch(idx);
    }

    fn unfix_ref(&self, idx: FrameIndex) {
        self.touch(idx);
    }

    fn used_ref(&self, idx: FrameIndex) {
        self.touch(idx);
    }

    fn miss_ref(&self, idx: FrameIndex, _page_id: storage::PageId) {
        self.set(idx, 0);
    }

    fn block_ref(&self, idx: FrameIndex) {
        self.set(idx, BLOCKED);
    }

    fn unbuffered(&self, idx: FrameIndex) {
        self.set(idx, 0);
    }

    fn pick_victim(&self) -> BufferResult<Option<Victim>> {
        let pool = self.core.pool();
        let block_count = pool.block_count();
        if pool.capacity() == 0 {
            return Ok(None);
        }
        // enough steps to bring every counter from k down to zero and back
        // around once more
        let max_steps = (self.k as u64 + 2) * pool.capacity() as u64;
        let mut attempts = 0u64;
        let mut hand = self.hand.lock();
        for _ in 0..max_steps {
            if self.core.should_exit() {
                break;
            }
            *hand += 1;
            if *hand >= block_count {
                *hand = 1;
            }
            let idx = FrameIndex::new(*hand);
            let counter = &self.counts[*hand];
            let value = counter.load(Ordering::Acquire);
            if value == BLOCKED || !pool.get_cb(idx).is_used() {
                continue;
            }
            if value > 0 {
                // a concurrent reference may have refreshed it; either way
                // the frame gets another round
                let _ = counter.compare_exchange(
                    value,
                    value - 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                continue;
            }
            let dirty_ok = self.core.dirty_eligible(attempts);
            if let Some(victim) = self.core.try_claim(idx, dirty_ok) {
                trace!("gclock: picked frame {idx}");
                return Ok(Some(victim));
            }
            attempts += 1;
            self.core.note_failed_attempt(attempts)?;
        }
        Ok(None)
    }
}
