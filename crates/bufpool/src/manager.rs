//! Fix/unfix protocol on top of the buffer pool.

use std::sync::Arc;
use std::thread;

use log::{debug, trace, warn};
use parking_lot::RwLock;
use storage::{MAX_CHILDREN, PageId, PageImage, PageTag, Volume};
use wal::{LogManager, LogRecord, Lsn};

use crate::error::{BufferError, BufferResult};
use crate::evict::{EvictionWorker, PageEvictioner, create_evictioner};
use crate::frame::{ChildPointer, FrameIndex, FramePage};
use crate::latch::{ExclusiveLatch, LatchMode, SharedLatch};
use crate::options::BufferOptions;
use crate::pool::{BufferPool, FrameLink};

/// Eviction rounds without a freed frame before a fix gives up.
const MAX_IDLE_ROUNDS: usize = 8;

pub struct BufferPoolManager {
    pool: Arc<BufferPool>,
    evictioner: Arc<dyn PageEvictioner>,
    worker: RwLock<Option<Arc<EvictionWorker>>>,
}

impl BufferPoolManager {
    pub fn new(
        frames: usize,
        volume: Arc<dyn Volume>,
        log: LogManager,
        options: BufferOptions,
    ) -> Self {
        Self::with_pool(Arc::new(BufferPool::new(frames, volume, log, options)))
    }

    /// Uses the evictioner named by the pool's `sm_evict_policy`.
    pub fn with_pool(pool: Arc<BufferPool>) -> Self {
        let evictioner = create_evictioner(Arc::clone(&pool));
        Self::with_evictioner(pool, evictioner)
    }

    pub fn with_evictioner(pool: Arc<BufferPool>, evictioner: Arc<dyn PageEvictioner>) -> Self {
        Self {
            pool,
            evictioner,
            worker: RwLock::new(None),
        }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn evictioner(&self) -> &Arc<dyn PageEvictioner> {
        &self.evictioner
    }

    /// Starts the background eviction worker if it is not running yet.
    pub fn start_eviction_worker(&self) -> BufferResult<()> {
        let mut worker = self.worker.write();
        if worker.is_none() {
            let interval = self.pool.options().eviction_interval();
            *worker = Some(Arc::new(EvictionWorker::start(
                Arc::clone(&self.evictioner),
                interval,
            )?));
        }
        Ok(())
    }

    pub fn stop_eviction_worker(&self) {
        if let Some(worker) = self.worker.write().take() {
            worker.stop();
        }
    }

    /// Runs one eviction round, on the worker if one is running.
    pub fn wakeup_evictioner(&self, wait: bool) -> BufferResult<()> {
        let worker = self.worker.read().clone();
        match worker {
            Some(worker) => worker.wakeup(wait),
            None => {
                self.evictioner.do_work()?;
            }
        }
        Ok(())
    }

    pub fn is_cached(&self, page_id: PageId) -> bool {
        self.pool.lookup(page_id).is_some()
    }

    /// Fixes a page by id.
    pub fn fix(&self, page_id: PageId, mode: LatchMode) -> BufferResult<PageGuard<'_>> {
        self.fix_page(page_id, None, mode)
    }

    /// Fixes the child in `slot` of a fixed parent. A swizzled pointer is
    /// followed without touching the hash index; otherwise the child is
    /// looked up by id and, if swizzling is enabled and the parent is held
    /// exclusively, the pointer is swizzled.
    pub fn fix_child(
        &self,
        parent: &mut PageGuard<'_>,
        slot: usize,
        mode: LatchMode,
    ) -> BufferResult<PageGuard<'_>> {
        let invalid = BufferError::InvalidSlot {
            page: parent.page_id(),
            slot,
        };
        let (pointer, child_pid) = {
            let page = parent.page();
            match (page.child_pointer(slot), page.child(slot)) {
                (Some(pointer), Some(pid)) => (pointer, pid),
                _ => return Err(invalid),
            }
        };

        if let ChildPointer::Swizzled(idx) = pointer {
            let cb = self.pool.get_cb(idx);
            if cb.try_pin() {
                if cb.is_used() && cb.page_id() == child_pid {
                    let latch = self.latch_frame(idx, mode);
                    self.evictioner.used_ref(idx);
                    return Ok(PageGuard::new(self, idx, child_pid, latch));
                }
                cb.unpin();
            }
            warn!("stale swizzled pointer to page {child_pid} in slot {slot}");
        }

        let child = self.fix_page(child_pid, Some(parent.frame_index()), mode)?;
        if self.pool.options().swizzle && matches!(pointer, ChildPointer::OnDisk(_)) {
            self.try_swizzle(parent, slot, &child);
        }
        Ok(child)
    }

    /// Allocates and fixes a new page that is its own root: a B-tree root
    /// or a metadata page. Such pages are never evicted.
    pub fn new_root(&self, tag: PageTag) -> BufferResult<PageGuard<'_>> {
        let page_id = self.pool.volume().allocate_page()?;
        self.install_new(PageImage::formatted(page_id, tag, page_id), None)
    }

    /// Allocates a B-tree page below `parent`, which must be held
    /// exclusively, and fixes it exclusively.
    pub fn new_child(&self, parent: &mut PageGuard<'_>) -> BufferResult<PageGuard<'_>> {
        if parent.mode() != LatchMode::Exclusive {
            return Err(BufferError::NotLatchedExclusive);
        }
        let parent_pid = parent.page_id();
        if parent.page().child_count() >= MAX_CHILDREN {
            return Err(BufferError::InvalidSlot {
                page: parent_pid,
                slot: MAX_CHILDREN,
            });
        }
        let page_id = self.pool.volume().allocate_page()?;
        let root = parent.page().root();
        let prev_lsn = parent.page().lsn();
        let slot = parent
            .page_mut()?
            .push_child(page_id)
            .ok_or(BufferError::InvalidSlot {
                page: parent_pid,
                slot: MAX_CHILDREN,
            })?;
        let record = LogRecord::page_update(
            parent_pid,
            slot as u32,
            Vec::new(),
            page_id.to_le_bytes().to_vec(),
        )
        .with_page_prev_lsn(Some(prev_lsn).filter(|l| *l != 0));
        let lsn = self.pool.log().append(record)?;
        parent.set_dirty(lsn)?;

        let image = PageImage::formatted(page_id, PageTag::BTree, root);
        let child = self.install_new(image, Some(parent.frame_index()))?;
        if self.pool.options().swizzle {
            self.try_swizzle(parent, slot, &child);
        }
        Ok(child)
    }

    /// Drops an unpinned page from the pool without writing it back.
    /// Returns false if the page is not cached or cannot be dropped now.
    pub fn discard_page(&self, page_id: PageId) -> BufferResult<bool> {
        let Some(link) = self.pool.hashtable().lookup(page_id) else {
            return Ok(false);
        };
        let idx = link.frame;
        let frame = self.pool.frame(idx);
        if frame.latch.held_by_me() {
            return Ok(false);
        }
        let mut latch = frame.latch.latch_ex();
        let cb = &frame.cb;
        if !cb.is_used()
            || cb.page_id() != page_id
            || cb.is_swizzled()
            || latch.has_swizzled_children()
            || !cb.try_begin_eviction()
        {
            return Ok(false);
        }
        if !self.pool.hashtable().remove(page_id) {
            return Err(BufferError::InconsistentMapping(page_id));
        }
        self.pool.dirty_pages().remove_dirty_page(page_id);
        cb.clear();
        latch.clear_swizzles();
        drop(latch);
        self.evictioner.unbuffered(idx);
        self.pool.add_free_block(idx);
        debug!("discarded page {page_id} from frame {idx}");
        Ok(true)
    }

    /// Marks the cached page as needed by an ongoing restore, which keeps
    /// it from being evicted.
    pub fn set_pinned_for_restore(&self, page_id: PageId, pinned: bool) -> bool {
        match self.pool.lookup(page_id) {
            Some(idx) => {
                self.pool.get_cb(idx).set_pinned_for_restore(pinned);
                true
            }
            None => false,
        }
    }

    /// Writes every dirty page back and syncs the volume. Returns the number
    /// of pages written.
    pub fn flush_all(&self) -> BufferResult<usize> {
        let mut written = 0;
        for idx in self.pool.frame_indices() {
            let frame = self.pool.frame(idx);
            if !frame.cb.is_used() || !frame.cb.is_dirty() || frame.latch.held_by_me() {
                continue;
            }
            let latch = frame.latch.latch_sh();
            if !frame.cb.is_used() || !frame.cb.is_dirty() {
                continue;
            }
            self.pool.write_page(frame.cb.page_id(), latch.image())?;
            frame.cb.mark_clean();
            written += 1;
        }
        if !self.pool.options().no_db {
            self.pool.volume().sync()?;
        }
        Ok(written)
    }

    fn fix_page(
        &self,
        page_id: PageId,
        parent: Option<FrameIndex>,
        mode: LatchMode,
    ) -> BufferResult<PageGuard<'_>> {
        loop {
            if let Some(link) = self.pool.hashtable().lookup(page_id) {
                let idx = link.frame;
                let cb = self.pool.get_cb(idx);
                if !cb.try_pin() {
                    // being evicted; the index entry is about to go away
                    thread::yield_now();
                    continue;
                }
                let latch = self.latch_frame(idx, mode);
                if !cb.is_used() || cb.page_id() != page_id {
                    drop(latch);
                    cb.unpin();
                    continue;
                }
                if parent.is_some() && link.parent != parent && !cb.is_swizzled() {
                    self.pool
                        .hashtable()
                        .update(page_id, FrameLink { frame: idx, parent });
                }
                self.evictioner.hit_ref(idx);
                return Ok(PageGuard::new(self, idx, page_id, latch));
            }

            let idx = self.grab_free_frame()?;
            let Some(latch) = self.load_page(idx, page_id, parent)? else {
                // another thread loaded the page first
                continue;
            };
            self.evictioner.miss_ref(idx, page_id);
            if latch.is_btree_root() || latch.is_metadata() {
                self.evictioner.block_ref(idx);
            }
            trace!("page {page_id} loaded into frame {idx}");
            let latch = match mode {
                LatchMode::Exclusive => FrameLatch::Exclusive(latch),
                LatchMode::Shared => FrameLatch::Shared(latch.downgrade()),
            };
            return Ok(PageGuard::new(self, idx, page_id, latch));
        }
    }

    fn latch_frame(&self, idx: FrameIndex, mode: LatchMode) -> FrameLatch {
        let latch = &self.pool.frame(idx).latch;
        match mode {
            LatchMode::Shared => FrameLatch::Shared(latch.latch_sh()),
            LatchMode::Exclusive => FrameLatch::Exclusive(latch.latch_ex()),
        }
    }

    /// Reads `page_id` into the free frame `idx` and publishes it in the
    /// hash index. Returns `None` (and frees the frame) if the page showed
    /// up in the index meanwhile.
    fn load_page(
        &self,
        idx: FrameIndex,
        page_id: PageId,
        parent: Option<FrameIndex>,
    ) -> BufferResult<Option<ExclusiveLatch>> {
        let frame = self.pool.frame(idx);
        let mut latch = frame.latch.latch_ex();
        if let Err(e) = self
            .pool
            .volume()
            .read_page(page_id, latch.image_mut().data_mut())
        {
            drop(latch);
            self.pool.add_free_block(idx);
            return Err(e.into());
        }
        latch.clear_swizzles();
        frame.cb.load(page_id, latch.lsn());
        let link = FrameLink { frame: idx, parent };
        if !self.pool.hashtable().insert_if_not_exists(page_id, link) {
            frame.cb.clear();
            drop(latch);
            self.pool.add_free_block(idx);
            return Ok(None);
        }
        Ok(Some(latch))
    }

    /// Puts a freshly formatted page into a free frame, dirty and fixed
    /// exclusively.
    fn install_new(
        &self,
        mut image: PageImage,
        parent: Option<FrameIndex>,
    ) -> BufferResult<PageGuard<'_>> {
        let page_id = image.page_id();
        let record = LogRecord::page_update(page_id, 0, Vec::new(), Vec::new());
        let lsn = self.pool.log().append(record)?;
        image.set_lsn(lsn);

        let idx = self.grab_free_frame()?;
        let frame = self.pool.frame(idx);
        let mut latch = frame.latch.latch_ex();
        latch.install(image);
        frame.cb.load(page_id, lsn);
        frame.cb.mark_dirty(lsn);
        let link = FrameLink { frame: idx, parent };
        if !self.pool.hashtable().insert_if_not_exists(page_id, link) {
            frame.cb.clear();
            drop(latch);
            self.pool.add_free_block(idx);
            return Err(BufferError::InconsistentMapping(page_id));
        }
        self.evictioner.miss_ref(idx, page_id);
        if latch.is_btree_root() || latch.is_metadata() {
            self.evictioner.block_ref(idx);
        }
        self.evictioner.dirty_ref(idx);
        Ok(PageGuard::new(
            self,
            idx,
            page_id,
            FrameLatch::Exclusive(latch),
        ))
    }

    fn try_swizzle(&self, parent: &mut PageGuard<'_>, slot: usize, child: &PageGuard<'_>) {
        let child_cb = self.pool.get_cb(child.frame_index());
        if child_cb.is_swizzled() || child.page().is_btree_root() {
            return;
        }
        let Ok(page) = parent.page_mut() else {
            return;
        };
        if page.swizzle(slot, child.frame_index()) {
            child_cb.set_swizzled(true);
            self.evictioner.swizzle_ref(child.frame_index());
            trace!("swizzled slot {slot} to frame {}", child.frame_index());
        }
    }

    /// Returns a free frame, evicting if the free list is empty.
    fn grab_free_frame(&self) -> BufferResult<FrameIndex> {
        let mut idle_rounds = 0;
        loop {
            if let Some(idx) = self.pool.grab_free_block() {
                return Ok(idx);
            }
            let worker = self.worker.read().clone();
            let progressed = match worker {
                Some(worker) => {
                    // the first frame the worker frees wakes us up
                    worker.wakeup(false);
                    self.pool.wait_for_free(self.pool.options().eviction_interval())
                }
                None => self.evictioner.do_work()? > 0,
            };
            if !progressed && self.pool.free_count() == 0 {
                idle_rounds += 1;
                if idle_rounds >= MAX_IDLE_ROUNDS {
                    warn!("no frame could be freed after {idle_rounds} eviction rounds");
                    return Err(BufferError::BufferFull);
                }
                thread::yield_now();
            }
        }
    }
}

impl Drop for BufferPoolManager {
    fn drop(&mut self) {
        self.stop_eviction_worker();
    }
}

enum FrameLatch {
    Shared(SharedLatch),
    Exclusive(ExclusiveLatch),
}

/// A fixed page. Dropping the guard releases the latch and the pin.
pub struct PageGuard<'a> {
    manager: &'a BufferPoolManager,
    idx: FrameIndex,
    page_id: PageId,
    latch: FrameLatch,
}

impl<'a> PageGuard<'a> {
    fn new(
        manager: &'a BufferPoolManager,
        idx: FrameIndex,
        page_id: PageId,
        latch: FrameLatch,
    ) -> Self {
        Self {
            manager,
            idx,
            page_id,
            latch,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn frame_index(&self) -> FrameIndex {
        self.idx
    }

    pub fn mode(&self) -> LatchMode {
        match self.latch {
            FrameLatch::Shared(_) => LatchMode::Shared,
            FrameLatch::Exclusive(_) => LatchMode::Exclusive,
        }
    }

    pub fn page(&self) -> &FramePage {
        match &self.latch {
            FrameLatch::Shared(l) => &**l,
            FrameLatch::Exclusive(l) => &**l,
        }
    }

    /// Raw access to an exclusively latched page. Changes made here are not
    /// logged; pair them with [`PageGuard::set_dirty`].
    pub fn page_mut(&mut self) -> BufferResult<&mut FramePage> {
        match &mut self.latch {
            FrameLatch::Exclusive(l) => Ok(&mut **l),
            FrameLatch::Shared(_) => Err(BufferError::NotLatchedExclusive),
        }
    }

    /// Stamps `lsn` on the page and marks the frame dirty.
    pub fn set_dirty(&mut self, lsn: Lsn) -> BufferResult<()> {
        self.page_mut()?.set_lsn(lsn);
        let cb = self.manager.pool.get_cb(self.idx);
        if cb.mark_dirty(lsn) {
            self.manager.evictioner.dirty_ref(self.idx);
        }
        Ok(())
    }

    /// Logs and applies a payload update. Returns the LSN of the update.
    pub fn update(&mut self, offset: usize, bytes: &[u8]) -> BufferResult<Lsn> {
        let page_id = self.page_id;
        let (before, prev_lsn) = {
            let page = self.page_mut()?;
            let Some(before) = page.read_bytes(offset, bytes.len()) else {
                return Err(BufferError::PayloadOutOfRange {
                    page: page_id,
                    offset,
                    len: bytes.len(),
                });
            };
            (before.to_vec(), Some(page.lsn()).filter(|l| *l != 0))
        };
        let record = LogRecord::page_update(page_id, offset as u32, before, bytes.to_vec())
            .with_page_prev_lsn(prev_lsn);
        let lsn = self.manager.pool.log().append(record)?;
        self.page_mut()?.write_bytes(offset, bytes);
        self.set_dirty(lsn)?;
        Ok(lsn)
    }

    pub fn read(&self, offset: usize, len: usize) -> Option<&[u8]> {
        self.page().read_bytes(offset, len)
    }
}

impl Drop for PageGuard<'_> {
    // The latch field is released after this runs. Unpinning first is safe:
    // the evictor cannot claim the frame while it is latched.
    fn drop(&mut self) {
        self.manager.pool.get_cb(self.idx).unpin();
        self.manager.evictioner.unfix_ref(self.idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::MemoryVolume;
    use tempfile::TempDir;

    fn manager(frames: usize, options: BufferOptions) -> (TempDir, Arc<MemoryVolume>, BufferPoolManager) {
        let dir = tempfile::tempdir().unwrap();
        let log = LogManager::open(dir.path().join("bp.log")).unwrap();
        let volume = Arc::new(MemoryVolume::new());
        let bpm = BufferPoolManager::new(frames, volume.clone(), log, options);
        (dir, volume, bpm)
    }

    #[test]
    fn test_fix_hit_and_miss() {
        let (_dir, volume, bpm) = manager(4, BufferOptions::default());
        let pid = volume.allocate_page().unwrap();
        let idx = {
            let guard = bpm.fix(pid, LatchMode::Shared).unwrap();
            assert_eq!(bpm.pool().get_cb(guard.frame_index()).pin_count(), 1);
            guard.frame_index()
        };
        assert_eq!(bpm.pool().get_cb(idx).pin_count(), 0);
        let again = bpm.fix(pid, LatchMode::Shared).unwrap();
        assert_eq!(again.frame_index(), idx);
        let second = bpm.fix(pid, LatchMode::Shared).unwrap();
        assert_eq!(bpm.pool().get_cb(idx).pin_count(), 2);
        drop(second);
        drop(again);
        assert!(bpm.is_cached(pid));
    }

    #[test]
    fn test_update_requires_exclusive_latch() {
        let (_dir, volume, bpm) = manager(4, BufferOptions::default());
        let pid = volume.allocate_page().unwrap();
        let mut shared = bpm.fix(pid, LatchMode::Shared).unwrap();
        assert!(matches!(
            shared.update(0, b"x"),
            Err(BufferError::NotLatchedExclusive)
        ));
        drop(shared);

        let mut guard = bpm.fix(pid, LatchMode::Exclusive).unwrap();
        let lsn = guard.update(10, b"hello").unwrap();
        assert_eq!(guard.read(10, 5), Some(&b"hello"[..]));
        assert_eq!(guard.page().lsn(), lsn);
        let cb = bpm.pool().get_cb(guard.frame_index());
        assert!(cb.is_dirty());
        assert_eq!(cb.rec_lsn(), lsn);
        assert!(matches!(
            guard.update(storage::PAGE_SIZE, b"x"),
            Err(BufferError::PayloadOutOfRange { .. })
        ));
    }

    #[test]
    fn test_new_child_links_parent() {
        let (_dir, _volume, bpm) = manager(4, BufferOptions::default());
        let mut root = bpm.new_root(PageTag::BTree).unwrap();
        assert!(root.page().is_btree_root());
        let child = bpm.new_child(&mut root).unwrap();
        let child_pid = child.page_id();
        assert_eq!(root.page().child(0), Some(child_pid));
        assert_eq!(child.page().root(), root.page_id());
        let link = bpm.pool().hashtable().lookup(child_pid).unwrap();
        assert_eq!(link.parent, Some(root.frame_index()));
        assert!(bpm.pool().get_cb(root.frame_index()).is_dirty());
    }

    #[test]
    fn test_discard_page_frees_frame() {
        let (_dir, volume, bpm) = manager(2, BufferOptions::default());
        let pid = volume.allocate_page().unwrap();
        let guard = bpm.fix(pid, LatchMode::Exclusive).unwrap();
        let free_before = bpm.pool().free_count();
        drop(guard);
        assert!(bpm.discard_page(pid).unwrap());
        assert!(!bpm.is_cached(pid));
        assert_eq!(bpm.pool().free_count(), free_before + 1);
        assert!(!bpm.discard_page(pid).unwrap());
    }

    #[test]
    fn test_flush_all_writes_dirty_pages() {
        let (_dir, volume, bpm) = manager(4, BufferOptions::default());
        let pid = volume.allocate_page().unwrap();
        {
            let mut guard = bpm.fix(pid, LatchMode::Exclusive).unwrap();
            guard.update(0, &[1, 2, 3]).unwrap();
        }
        assert_eq!(bpm.flush_all().unwrap(), 1);
        assert_eq!(volume.writes(), vec![pid]);
        assert_eq!(volume.sync_count(), 1);
        assert_eq!(bpm.flush_all().unwrap(), 0);
    }
}
