//! Frame array, page index and free list shared by the foreground fix path
//! and the evictioner.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, trace};
use parking_lot::{Condvar, Mutex, RwLock};
use storage::{PageId, PageImage, Volume};
use wal::{LogManager, LogRecord, Lsn};

use crate::error::BufferResult;
use crate::frame::{ChildPointer, ControlBlock, Frame, FrameIndex, FramePage};
use crate::hashtable::HashIndex;
use crate::options::BufferOptions;
use crate::recovery::{DirtyPageRegistry, DirtyPageTable};

/// Hash index buckets per usable frame.
const BUCKETS_PER_FRAME: usize = 2;

/// Something that writes dirty pages back in the background.
pub trait PageCleaner: Send + Sync {
    fn wakeup(&self);
}

/// Hash index value: where a page lives and which frame holds its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLink {
    pub frame: FrameIndex,
    pub parent: Option<FrameIndex>,
}

pub struct BufferPool {
    frames: Box<[Frame]>,
    hashtable: HashIndex<FrameLink>,
    free: Mutex<Vec<FrameIndex>>,
    free_cond: Condvar,
    volume: Arc<dyn Volume>,
    log: LogManager,
    dirty_pages: Arc<dyn DirtyPageTable>,
    cleaner: RwLock<Option<Arc<dyn PageCleaner>>>,
    media_failure: AtomicBool,
    options: BufferOptions,
}

impl BufferPool {
    /// Creates a pool with `frames` usable frames. Frame 0 is reserved, so
    /// `block_count()` is `frames + 1`.
    pub fn new(
        frames: usize,
        volume: Arc<dyn Volume>,
        log: LogManager,
        options: BufferOptions,
    ) -> Self {
        let block_count = frames + 1;
        let frames_vec: Box<[Frame]> = (0..block_count).map(|_| Frame::new()).collect();
        // popped from the back, so frame 1 is handed out first
        let free = (1..block_count).rev().map(FrameIndex::new).collect();
        debug!(
            "buffer pool: {} frames, policy {}",
            block_count - 1,
            options.evict_policy
        );
        Self {
            frames: frames_vec,
            hashtable: HashIndex::new((block_count - 1).max(1) * BUCKETS_PER_FRAME),
            free: Mutex::new(free),
            free_cond: Condvar::new(),
            volume,
            log,
            dirty_pages: Arc::new(DirtyPageRegistry::new()),
            cleaner: RwLock::new(None),
            media_failure: AtomicBool::new(false),
            options,
        }
    }

    pub fn with_dirty_page_table(mut self, table: Arc<dyn DirtyPageTable>) -> Self {
        self.dirty_pages = table;
        self
    }

    /// Number of frames including the reserved frame 0.
    pub fn block_count(&self) -> usize {
        self.frames.len()
    }

    /// Number of frames that can hold pages.
    pub fn capacity(&self) -> usize {
        self.frames.len() - 1
    }

    /// Indices of all usable frames.
    pub fn frame_indices(&self) -> impl Iterator<Item = FrameIndex> {
        (1..self.frames.len()).map(FrameIndex::new)
    }

    pub fn frame(&self, idx: FrameIndex) -> &Frame {
        &self.frames[idx.as_usize()]
    }

    pub fn get_cb(&self, idx: FrameIndex) -> &ControlBlock {
        &self.frame(idx).cb
    }

    pub fn hashtable(&self) -> &HashIndex<FrameLink> {
        &self.hashtable
    }

    pub fn volume(&self) -> &Arc<dyn Volume> {
        &self.volume
    }

    pub fn log(&self) -> &LogManager {
        &self.log
    }

    pub fn options(&self) -> &BufferOptions {
        &self.options
    }

    pub fn dirty_pages(&self) -> &Arc<dyn DirtyPageTable> {
        &self.dirty_pages
    }

    /// Frame currently holding `page_id`, if any.
    pub fn lookup(&self, page_id: PageId) -> Option<FrameIndex> {
        self.hashtable.lookup(page_id).map(|link| link.frame)
    }

    /// Returns a frame to the free list and wakes one waiter.
    pub fn add_free_block(&self, idx: FrameIndex) {
        let mut free = self.free.lock();
        free.push(idx);
        trace!("frame {} freed ({} free)", idx, free.len());
        self.free_cond.notify_one();
    }

    pub fn grab_free_block(&self) -> Option<FrameIndex> {
        self.free.lock().pop()
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Waits up to `timeout` for a free frame to show up.
    pub fn wait_for_free(&self, timeout: Duration) -> bool {
        let mut free = self.free.lock();
        if free.is_empty() {
            self.free_cond.wait_for(&mut free, timeout);
        }
        !free.is_empty()
    }

    pub fn find_page_id_slot(&self, parent: &FramePage, pointer: ChildPointer) -> Option<usize> {
        parent.find_page_id_slot(pointer)
    }

    /// Restores the on-disk pointer in `slot` of a latched parent and clears
    /// the child's swizzled flag.
    pub fn unswizzle(&self, parent: &mut FramePage, slot: usize) -> bool {
        let Some(ChildPointer::Swizzled(child)) = parent.child_pointer(slot) else {
            return false;
        };
        parent.unswizzle(slot);
        self.get_cb(child).set_swizzled(false);
        true
    }

    /// Logs and applies a new end-mark LSN for `slot` of a latched parent.
    /// The parent becomes dirty at the LSN of the new record.
    pub fn update_child_emlsn(
        &self,
        parent_idx: FrameIndex,
        parent: &mut FramePage,
        slot: usize,
        emlsn: Lsn,
    ) -> BufferResult<()> {
        let Some(child) = parent.child(slot) else {
            return Ok(());
        };
        let parent_pid = parent.page_id();
        let record = LogRecord::update_emlsn(parent_pid, slot as u16, child, emlsn)
            .with_page_prev_lsn(Some(parent.lsn()).filter(|lsn| *lsn != 0));
        let lsn = self.log.append(record)?;
        parent.set_emlsn(slot, emlsn);
        parent.set_lsn(lsn);
        self.get_cb(parent_idx).mark_dirty(lsn);
        trace!("page {parent_pid} slot {slot}: emlsn of {child} now {emlsn}");
        Ok(())
    }

    /// Writes a page image back, forcing the log up to the page LSN first
    /// and logging a clean marker afterwards.
    pub fn write_page(&self, page_id: PageId, image: &PageImage) -> BufferResult<()> {
        if self.options.no_db {
            return Ok(());
        }
        let page_lsn = image.lsn();
        if page_lsn != 0 {
            self.log.flush(page_lsn)?;
        }
        self.volume.write_page(page_id, image.data())?;
        self.log.append(LogRecord::page_write(page_id, page_lsn))?;
        Ok(())
    }

    pub fn set_cleaner(&self, cleaner: Arc<dyn PageCleaner>) {
        *self.cleaner.write() = Some(cleaner);
    }

    pub fn wakeup_cleaner(&self) {
        if let Some(cleaner) = self.cleaner.read().as_ref() {
            cleaner.wakeup();
        }
    }

    pub fn is_media_failure(&self) -> bool {
        self.media_failure.load(Ordering::Acquire)
    }

    pub fn set_media_failure(&self, failed: bool) {
        self.media_failure.store(failed, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::{MemoryVolume, PageTag};
    use tempfile::tempdir;

    fn pool(frames: usize, options: BufferOptions) -> (tempfile::TempDir, Arc<MemoryVolume>, BufferPool) {
        let dir = tempdir().unwrap();
        let log = LogManager::open(dir.path().join("pool.log")).unwrap();
        let volume = Arc::new(MemoryVolume::new());
        let pool = BufferPool::new(frames, volume.clone(), log, options);
        (dir, volume, pool)
    }

    #[test]
    fn test_free_list_reserves_frame_zero() {
        let (_dir, _volume, pool) = pool(3, BufferOptions::default());
        assert_eq!(pool.block_count(), 4);
        assert_eq!(pool.capacity(), 3);
        let grabbed: Vec<_> = std::iter::from_fn(|| pool.grab_free_block()).collect();
        assert_eq!(
            grabbed,
            vec![FrameIndex::new(1), FrameIndex::new(2), FrameIndex::new(3)]
        );
        assert!(!pool.wait_for_free(Duration::from_millis(1)));
        pool.add_free_block(FrameIndex::new(2));
        assert!(pool.wait_for_free(Duration::from_millis(1)));
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_write_page_flushes_log_first() {
        let (_dir, volume, pool) = pool(2, BufferOptions::default());
        let pid = volume.allocate_page().unwrap();
        let lsn = pool
            .log()
            .append(LogRecord::page_update(pid, 0, vec![0], vec![1]))
            .unwrap();
        let mut image = PageImage::formatted(pid, PageTag::BTree, pid);
        image.set_lsn(lsn);
        assert!(pool.log().flushed_lsn() <= lsn);
        pool.write_page(pid, &image).unwrap();
        assert!(pool.log().flushed_lsn() > lsn);
        assert_eq!(volume.writes(), vec![pid]);
    }

    #[test]
    fn test_no_db_skips_volume() {
        let options = BufferOptions {
            no_db: true,
            ..BufferOptions::default()
        };
        let (_dir, volume, pool) = pool(2, options);
        let pid = volume.allocate_page().unwrap();
        pool.write_page(pid, &PageImage::formatted(pid, PageTag::BTree, pid))
            .unwrap();
        assert!(volume.writes().is_empty());
    }

    #[test]
    fn test_update_child_emlsn_dirties_parent() {
        let (_dir, _volume, pool) = pool(2, BufferOptions::default());
        let parent_idx = FrameIndex::new(1);
        pool.get_cb(parent_idx).load(5, 0);
        let mut page = FramePage::new();
        page.install(PageImage::formatted(5, PageTag::BTree, 5));
        let slot = page.push_child(6).unwrap();
        pool.update_child_emlsn(parent_idx, &mut page, slot, 77).unwrap();
        assert_eq!(page.emlsn(slot), Some(77));
        assert!(page.lsn() > 0);
        let cb = pool.get_cb(parent_idx);
        assert!(cb.is_dirty());
        assert_eq!(cb.page_lsn(), page.lsn());
    }
}
