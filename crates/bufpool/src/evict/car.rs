//! CLOCK with Adaptive Replacement.
//!
//! Resident frames live on two clocks: T1 for pages referenced once since
//! they were loaded and T2 for pages referenced again. Ghost queues B1 and
//! B2 remember the ids of pages recently evicted from each clock, and a hit
//! on a ghost shifts the target size `p` of T1 towards whichever side would
//! have kept the page.

use std::collections::HashMap;
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;
use storage::PageId;

use super::{EvictionCore, PageEvictioner, Victim};
use crate::collections::{ClockId, DirectAccessQueue, MultiClock};
use crate::error::BufferResult;
use crate::frame::FrameIndex;
use crate::pool::BufferPool;

const T1: ClockId = 0;
const T2: ClockId = 1;

/// Per-frame reference state.
///
/// A fix that finds its page resident only arms `hit_pending`; the
/// reference bit is set when that fix ends. The fix that loads a page never
/// sets the bit, so pages touched once by a scan stay unreferenced.
#[derive(Debug, Clone, Copy, Default)]
struct RefBits {
    referenced: bool,
    hit_pending: bool,
}

struct CarState {
    clocks: MultiClock<RefBits>,
    b1: DirectAccessQueue<PageId>,
    b2: DirectAccessQueue<PageId>,
    p: usize,
    /// Victims handed out but not yet evicted, with the clock they left and
    /// their page id, so a refused eviction can put each back where it was.
    in_flight: HashMap<FrameIndex, (ClockId, PageId)>,
}

impl CarState {
    fn ghosts(&mut self, clock: ClockId) -> &mut DirectAccessQueue<PageId> {
        if clock == T1 { &mut self.b1 } else { &mut self.b2 }
    }

    fn push_ghost(&mut self, clock: ClockId, page_id: PageId, capacity: usize) {
        while self.b1.len() + self.b2.len() >= capacity.max(1) {
            let popped = if clock == T1 {
                self.b1.pop().or_else(|| self.b2.pop())
            } else {
                self.b2.pop().or_else(|| self.b1.pop())
            };
            if popped.is_none() {
                break;
            }
        }
        self.ghosts(clock).push(page_id);
    }

    /// Puts a victim that stayed resident back on the clock it was taken
    /// from and forgets its ghost.
    fn restore(&mut self, idx: FrameIndex, clock: ClockId, page_id: PageId) {
        self.ghosts(clock).remove(&page_id);
        if self.clocks.add_tail(clock, idx) {
            self.clocks.set(idx, RefBits::default());
        }
    }

    /// Takes back victims whose latch was released without an eviction
    /// going through `evict_one`.
    fn reclaim_abandoned(&mut self, pool: &BufferPool) {
        let abandoned: Vec<_> = self
            .in_flight
            .keys()
            .copied()
            .filter(|idx| !pool.frame(*idx).latch.is_latched())
            .collect();
        for idx in abandoned {
            let Some((clock, page_id)) = self.in_flight.remove(&idx) else {
                continue;
            };
            let cb = pool.get_cb(idx);
            if cb.is_used() && cb.page_id() == page_id {
                self.restore(idx, clock, page_id);
            }
        }
    }
}

pub struct CarEvictioner {
    core: EvictionCore,
    capacity: usize,
    state: Mutex<CarState>,
}

impl CarEvictioner {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        let capacity = pool.capacity();
        let state = CarState {
            clocks: MultiClock::new(pool.block_count(), 2),
            b1: DirectAccessQueue::with_capacity(capacity),
            b2: DirectAccessQueue::with_capacity(capacity),
            p: 0,
            in_flight: HashMap::new(),
        };
        Self {
            core: EvictionCore::new(pool),
            capacity,
            state: Mutex::new(state),
        }
    }

    /// Target size of T1.
    pub fn target_t1(&self) -> usize {
        self.state.lock().p
    }

    pub fn t1_len(&self) -> usize {
        self.state.lock().clocks.size_of(T1)
    }

    pub fn t2_len(&self) -> usize {
        self.state.lock().clocks.size_of(T2)
    }

    pub fn b1_len(&self) -> usize {
        self.state.lock().b1.len()
    }

    pub fn b2_len(&self) -> usize {
        self.state.lock().b2.len()
    }

    pub fn in_t2(&self, idx: FrameIndex) -> bool {
        self.state.lock().clocks.owner(idx) == Some(T2)
    }

    pub fn is_referenced(&self, idx: FrameIndex) -> bool {
        self.state
            .lock()
            .clocks
            .get(idx)
            .is_some_and(|bits| bits.referenced)
    }

    fn arm_hit(&self, idx: FrameIndex) {
        let mut state = self.state.lock();
        if let Some(bits) = state.clocks.get(idx).copied() {
            state.clocks.set(
                idx,
                RefBits {
                    hit_pending: true,
                    ..bits
                },
            );
        }
    }
}

impl PageEvictioner for CarEvictioner {
    fn core(&self) -> &EvictionCore {
        &self.core
    }

    fn hit_ref(&self, idx: FrameIndex) {
        self.arm_hit(idx);
    }

    fn used_ref(&self, idx: FrameIndex) {
        self.arm_hit(idx);
    }

    fn unfix_ref(&self, idx: FrameIndex) {
        let mut state = self.state.lock();
        if let Some(bits) = state.clocks.get(idx).copied() {
            if bits.hit_pending {
                state.clocks.set(
                    idx,
                    RefBits {
                        referenced: true,
                        hit_pending: false,
                    },
                );
            }
        }
    }

    fn miss_ref(&self, idx: FrameIndex, page_id: PageId) {
        let capacity = self.capacity;
        let mut state = self.state.lock();
        state.clocks.remove(idx);
        let (b1, b2) = (state.b1.len(), state.b2.len());
        if state.b1.remove(&page_id) {
            state.p = (state.p + (b2 / b1).max(1)).min(capacity);
            state.clocks.add_tail(T2, idx);
            trace!("car: B1 hit on page {page_id}, p = {}", state.p);
        } else if state.b2.remove(&page_id) {
            state.p = state.p.saturating_sub((b1 / b2).max(1));
            state.clocks.add_tail(T2, idx);
            trace!("car: B2 hit on page {page_id}, p = {}", state.p);
        } else {
            state.clocks.add_tail(T1, idx);
        }
        state.clocks.set(idx, RefBits::default());
    }

    fn block_ref(&self, idx: FrameIndex) {
        self.state.lock().clocks.remove(idx);
    }

    fn unbuffered(&self, idx: FrameIndex) {
        let mut state = self.state.lock();
        state.clocks.remove(idx);
        state.clocks.set(idx, RefBits::default());
    }

    fn pick_victim(&self) -> BufferResult<Option<Victim>> {
        let capacity = self.capacity;
        if capacity == 0 {
            return Ok(None);
        }
        let pool = self.core.pool();
        let mut state = self.state.lock();
        state.reclaim_abandoned(pool);
        let mut blocked_t1 = 0;
        let mut blocked_t2 = 0;
        let mut attempts = 0u64;
        let mut hand_movement = 0;

        for _ in 0..3 * capacity {
            if self.core.should_exit() {
                break;
            }
            let t1 = state.clocks.size_of(T1);
            let t2 = state.clocks.size_of(T2);
            let t1_open = t1 > 0 && blocked_t1 < t1;
            let t2_open = t2 > 0 && blocked_t2 < t2;
            if !t1_open && !t2_open {
                break;
            }
            // a full lap without a victim: give every frame another look
            hand_movement += 1;
            if hand_movement >= capacity {
                hand_movement = 0;
                blocked_t1 = 0;
                blocked_t2 = 0;
            }

            let clock = if t1_open && (t1 >= state.p.max(1) || !t2_open) { T1 } else { T2 };
            let Some(head) = state.clocks.get_head_index(clock) else {
                break;
            };
            let bits = state.clocks.get(head).copied().unwrap_or_default();
            if bits.referenced {
                state.clocks.set(
                    head,
                    RefBits {
                        referenced: false,
                        ..bits
                    },
                );
                if clock == T1 {
                    state.clocks.switch_head_to_tail(T1, T2);
                } else {
                    state.clocks.move_head(T2);
                }
                continue;
            }

            let dirty_ok = self.core.dirty_eligible(attempts);
            if let Some(victim) = self.core.try_claim(head, dirty_ok) {
                let page_id = pool.get_cb(head).page_id();
                state.clocks.remove_head(clock);
                state.push_ghost(clock, page_id, capacity);
                state.in_flight.insert(head, (clock, page_id));
                trace!("car: picked frame {head} (page {page_id}) from T{}", clock + 1);
                return Ok(Some(victim));
            }
            state.clocks.move_head(clock);
            if clock == T1 {
                blocked_t1 += 1;
            } else {
                blocked_t2 += 1;
            }
            attempts += 1;
            self.core.note_failed_attempt(attempts)?;
        }
        Ok(None)
    }

    fn evict_one(&self, victim: Victim) -> BufferResult<bool> {
        let idx = victim.index();
        let result = self.core.evict_one(victim);
        let mut state = self.state.lock();
        if let Some((clock, page_id)) = state.in_flight.remove(&idx) {
            if !matches!(result, Ok(true)) {
                state.restore(idx, clock, page_id);
            }
        }
        result
    }
}
