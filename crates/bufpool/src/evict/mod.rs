//! Page eviction.
//!
//! An evictioner picks victim frames according to its replacement policy
//! and frees them until the free list reaches a small watermark. The
//! sequence that actually frees a frame (unswizzle, write back, drop from
//! the index) is shared by every policy and lives in [`EvictionCore`].

mod base;
mod car;
mod gclock;
mod worker;

pub use base::BaseEvictioner;
pub use car::CarEvictioner;
pub use gclock::GClockEvictioner;
pub use worker::EvictionWorker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, info, trace, warn};
use wal::LogRecord;

use crate::error::{BufferError, BufferResult};
use crate::frame::{ChildPointer, FrameIndex};
use crate::latch::ExclusiveLatch;
use crate::options::{BufferOptions, EvictPolicy};
use crate::pool::BufferPool;

/// Share of the pool that `do_work` tries to keep free.
const EVICT_BATCH_RATIO: f64 = 0.01;
/// Failed picks per frame before eviction is declared stuck.
const STUCK_ATTEMPTS_PER_FRAME: u64 = 1000;

/// A frame chosen for eviction, held under its exclusive latch.
pub struct Victim {
    idx: FrameIndex,
    latch: ExclusiveLatch,
}

impl Victim {
    pub fn index(&self) -> FrameIndex {
        self.idx
    }

    pub fn latch(&self) -> &ExclusiveLatch {
        &self.latch
    }
}

/// Counters describing what the evictioner has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionStats {
    pub evicted: u64,
    pub flushed: u64,
    pub rejected: u64,
    pub unswizzled: u64,
    pub emlsn_updates: u64,
    pub failed_picks: u64,
}

#[derive(Default)]
struct StatCounters {
    evicted: AtomicU64,
    flushed: AtomicU64,
    rejected: AtomicU64,
    unswizzled: AtomicU64,
    emlsn_updates: AtomicU64,
    failed_picks: AtomicU64,
}

/// State and mechanics shared by every replacement policy.
pub struct EvictionCore {
    pool: Arc<BufferPool>,
    should_exit: AtomicBool,
    /// Consecutive failed candidate checks across calls; reset by any
    /// successful eviction.
    failed_attempts: AtomicU64,
    stats: StatCounters,
}

impl EvictionCore {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            should_exit: AtomicBool::new(false),
            failed_attempts: AtomicU64::new(0),
            stats: StatCounters::default(),
        }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn options(&self) -> &BufferOptions {
        self.pool.options()
    }

    pub fn should_exit(&self) -> bool {
        self.should_exit.load(Ordering::Acquire)
    }

    pub fn set_should_exit(&self, exit: bool) {
        self.should_exit.store(exit, Ordering::Release);
    }

    /// Free frames `do_work` aims for.
    pub fn free_target(&self) -> usize {
        (EVICT_BATCH_RATIO * self.pool.capacity() as f64) as usize + 1
    }

    pub fn stats(&self) -> EvictionStats {
        let s = &self.stats;
        EvictionStats {
            evicted: s.evicted.load(Ordering::Relaxed),
            flushed: s.flushed.load(Ordering::Relaxed),
            rejected: s.rejected.load(Ordering::Relaxed),
            unswizzled: s.unswizzled.load(Ordering::Relaxed),
            emlsn_updates: s.emlsn_updates.load(Ordering::Relaxed),
            failed_picks: s.failed_picks.load(Ordering::Relaxed),
        }
    }

    /// Whether dirty frames may be picked after `attempts` failed checks in
    /// the current pick.
    pub fn dirty_eligible(&self, attempts: u64) -> bool {
        let clean_only = self.options().effective_clean_only_attempts() as u64;
        clean_only == 0 || attempts >= clean_only
    }

    /// Books a rejected candidate. Wakes the cleaner once `attempts` reaches
    /// the configured threshold and fails once eviction looks wedged.
    pub fn note_failed_attempt(&self, attempts: u64) -> BufferResult<()> {
        self.stats.failed_picks.fetch_add(1, Ordering::Relaxed);
        let wakeup_at = self.options().wakeup_cleaner_attempts as u64;
        if wakeup_at > 0 && attempts == wakeup_at {
            warn!("evictioner: {attempts} failed attempts, waking page cleaner");
            self.pool.wakeup_cleaner();
        }
        let failed = self.failed_attempts.fetch_add(1, Ordering::AcqRel) + 1;
        let limit = STUCK_ATTEMPTS_PER_FRAME * self.pool.block_count() as u64;
        if failed >= limit {
            warn!("evictioner: no victim after {failed} attempts");
            return Err(BufferError::EvictionStuck { attempts: failed });
        }
        Ok(())
    }

    fn note_success(&self) {
        self.failed_attempts.store(0, Ordering::Release);
    }

    /// Latches `idx` if it may be evicted right now.
    ///
    /// A candidate must hold a page, must not be latched by anyone
    /// (including the caller), must not be a metadata page or a B-tree
    /// root, must not be pinned, and must not have swizzled children. Dirty
    /// frames pass only when `dirty_ok`.
    pub fn try_claim(&self, idx: FrameIndex, dirty_ok: bool) -> Option<Victim> {
        let frame = self.pool.frame(idx);
        let cb = &frame.cb;
        if !cb.is_used() || frame.latch.held_by_me() {
            return None;
        }
        let latch = frame.latch.try_latch_ex()?;
        if !cb.is_used()
            || cb.pin_count() != 0
            || cb.is_pinned_for_restore()
            || latch.is_metadata()
            || latch.is_btree_root()
            || latch.has_swizzled_children()
            || (cb.is_dirty() && !dirty_ok)
        {
            return None;
        }
        Some(Victim { idx, latch })
    }

    /// Detaches the victim from its parent. Swizzled pointers are undone
    /// and, when enabled, the parent's end-mark LSN for the victim is
    /// brought up to the victim's page LSN. Returns false if the victim
    /// cannot leave the pool yet.
    pub fn unswizzle_and_update_emlsn(&self, victim: &mut Victim) -> BufferResult<bool> {
        let pool = &self.pool;
        let opts = pool.options();
        let cb = pool.get_cb(victim.idx);
        let page_id = cb.page_id();
        let parent = pool.hashtable().lookup(page_id).and_then(|link| link.parent);
        let Some(parent_idx) = parent else {
            return Ok(!opts.swizzle && !cb.is_swizzled());
        };

        let parent_frame = pool.frame(parent_idx);
        if parent_frame.latch.held_by_me() {
            return Ok(false);
        }
        let Some(mut parent_latch) = parent_frame.latch.try_latch_ex() else {
            trace!("evictioner: parent of page {page_id} is latched");
            return Ok(false);
        };

        let swizzled = cb.is_swizzled();
        let pointer = if swizzled {
            ChildPointer::Swizzled(victim.idx)
        } else {
            ChildPointer::OnDisk(page_id)
        };
        let Some(slot) = pool.find_page_id_slot(&parent_latch, pointer) else {
            // A swizzled child always sits in its recorded parent. An
            // unswizzled one may outlive it; nothing points at its frame.
            return Ok(!swizzled);
        };

        if swizzled && pool.unswizzle(&mut parent_latch, slot) {
            self.stats.unswizzled.fetch_add(1, Ordering::Relaxed);
        }
        if opts.maintain_emlsn {
            let child_lsn = victim.latch.lsn();
            if child_lsn > parent_latch.emlsn(slot).unwrap_or(0) {
                pool.update_child_emlsn(parent_idx, &mut parent_latch, slot, child_lsn)?;
                self.stats.emlsn_updates.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(true)
    }

    /// Frees the frame of a claimed victim. Returns false if the victim had
    /// to be given up; the frame is then untouched and unlatched.
    pub fn evict_one(&self, mut victim: Victim) -> BufferResult<bool> {
        let pool = &self.pool;
        let opts = pool.options();
        let idx = victim.idx;
        let cb = pool.get_cb(idx);
        let page_id = cb.page_id();

        if !self.unswizzle_and_update_emlsn(&mut victim)? {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }
        if !cb.try_begin_eviction() {
            // pinned after the claim
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }

        let dirty = cb.is_dirty();
        if dirty || pool.is_media_failure() {
            let rec_lsn = if cb.rec_lsn() != 0 { cb.rec_lsn() } else { cb.page_lsn() };
            pool.dirty_pages().add_dirty_page(page_id, rec_lsn);
        }
        if dirty && !opts.write_elision && !opts.no_db {
            if let Err(e) = pool.write_page(page_id, victim.latch.image()) {
                cb.cancel_eviction();
                return Err(e);
            }
            cb.mark_clean();
            self.stats.flushed.fetch_add(1, Ordering::Relaxed);
        }
        if opts.log_page_evictions {
            if let Err(e) = pool.log().append(LogRecord::evict_page(page_id, dirty)) {
                cb.cancel_eviction();
                return Err(e.into());
            }
            info!("evicted page {page_id} from frame {idx} (dirty: {dirty})");
        }

        if !pool.hashtable().remove(page_id) {
            return Err(BufferError::InconsistentMapping(page_id));
        }
        cb.clear();
        victim.latch.clear_swizzles();
        drop(victim);

        self.note_success();
        self.stats.evicted.fetch_add(1, Ordering::Relaxed);
        trace!("evictioner: page {page_id} left frame {idx}");
        Ok(true)
    }
}

/// A replacement policy.
///
/// The reference hooks are called by the buffer pool manager as pages are
/// fixed and released; policies that do not track references keep the
/// default no-ops.
pub trait PageEvictioner: Send + Sync {
    fn core(&self) -> &EvictionCore;

    /// Chooses the next victim and returns it exclusively latched, or
    /// `None` when no frame is currently evictable.
    fn pick_victim(&self) -> BufferResult<Option<Victim>>;

    /// A fix found the page already buffered.
    fn hit_ref(&self, _idx: FrameIndex) {}

    /// A fix ended.
    fn unfix_ref(&self, _idx: FrameIndex) {}

    /// A page was loaded into `idx` from the volume.
    fn miss_ref(&self, _idx: FrameIndex, _page_id: storage::PageId) {}

    /// The frame was reached through a swizzled pointer.
    fn used_ref(&self, _idx: FrameIndex) {}

    /// The frame became dirty.
    fn dirty_ref(&self, _idx: FrameIndex) {}

    /// The frame must not be evicted for the rest of its residency.
    fn block_ref(&self, _idx: FrameIndex) {}

    /// A parent pointer to the frame was swizzled.
    fn swizzle_ref(&self, _idx: FrameIndex) {}

    /// The frame was freed by something other than the evictioner.
    fn unbuffered(&self, _idx: FrameIndex) {}

    fn evict_one(&self, victim: Victim) -> BufferResult<bool> {
        self.core().evict_one(victim)
    }

    /// Evicts until the free list reaches the watermark, no victim is
    /// left, or the evictioner is asked to stop. Returns how many frames
    /// were freed.
    fn do_work(&self) -> BufferResult<usize> {
        let core = self.core();
        let pool = core.pool();
        let target = core.free_target();
        let mut evicted = 0;
        let mut refused = 0;
        while pool.free_count() < target && !core.should_exit() {
            let Some(victim) = self.pick_victim()? else {
                break;
            };
            let idx = victim.index();
            if self.evict_one(victim)? {
                pool.add_free_block(idx);
                evicted += 1;
                refused = 0;
            } else {
                refused += 1;
                core.note_failed_attempt(refused as u64)?;
                if refused >= pool.block_count() {
                    break;
                }
            }
        }
        if evicted > 0 {
            debug!("evictioner: freed {evicted} frames");
        }
        Ok(evicted)
    }

    fn stats(&self) -> EvictionStats {
        self.core().stats()
    }

    fn stop(&self) {
        self.core().set_should_exit(true);
    }
}

/// Builds the evictioner selected by `sm_evict_policy`.
pub fn create_evictioner(pool: Arc<BufferPool>) -> Arc<dyn PageEvictioner> {
    match pool.options().evict_policy {
        EvictPolicy::Random => Arc::new(BaseEvictioner::new(pool)),
        EvictPolicy::Gclock => Arc::new(GClockEvictioner::new(pool)),
        EvictPolicy::Car => Arc::new(CarEvictioner::new(pool)),
    }
}
