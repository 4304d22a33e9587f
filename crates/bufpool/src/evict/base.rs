use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{EvictionCore, PageEvictioner, Victim};
use crate::error::BufferResult;
use crate::frame::FrameIndex;
use crate::pool::BufferPool;

/// Policy-free evictioner: sweeps the frame array (or samples it at random
/// with `sm_evict_random`) and takes the first frame that can be latched
/// and evicted.
pub struct BaseEvictioner {
    core: EvictionCore,
    cursor: Mutex<usize>,
    rng: Mutex<StdRng>,
}

impl BaseEvictioner {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            core: EvictionCore::new(pool),
            cursor: Mutex::new(0),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    fn next_candidate(&self) -> FrameIndex {
        let block_count = self.core.pool().block_count();
        if self.core.options().evict_random {
            return FrameIndex::new(self.rng.lock().gen_range(1..block_count));
        }
        let mut cursor = self.cursor.lock();
        *cursor += 1;
        if *cursor >= block_count {
            *cursor = 1;
        }
        FrameIndex::new(*cursor)
    }
}

impl PageEvictioner for BaseEvictioner {
    fn core(&self) -> &EvictionCore {
        &self.core
    }

    fn pick_victim(&self) -> BufferResult<Option<Victim>> {
        let pool = self.core.pool();
        if pool.capacity() == 0 {
            return Ok(None);
        }
        let max_attempts = 2 * pool.capacity() as u64;
        let mut attempts = 0u64;
        while attempts < max_attempts && !self.core.should_exit() {
            let idx = self.next_candidate();
            let dirty_ok = self.core.dirty_eligible(attempts);
            if let Some(victim) = self.core.try_claim(idx, dirty_ok) {
                trace!("evictioner: picked frame {idx} after {attempts} attempts");
                return Ok(Some(victim));
            }
            attempts += 1;
            self.core.note_failed_attempt(attempts)?;
        }
        Ok(None)
    }
}
