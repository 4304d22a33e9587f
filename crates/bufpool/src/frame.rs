use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

use storage::{MAX_CHILDREN, PageId, PageImage};
use wal::Lsn;

use crate::latch::Latch;

/// Index of a frame in the buffer pool. Frame 0 is reserved and never
/// holds a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameIndex(usize);

impl FrameIndex {
    pub const RESERVED: FrameIndex = FrameIndex(0);

    pub const fn new(idx: usize) -> Self {
        Self(idx)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for FrameIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a parent's child slot points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildPointer {
    OnDisk(PageId),
    Swizzled(FrameIndex),
}

/// Latched content of a frame: the page image plus the in-memory swizzle
/// overlay for its child slots. The image itself always carries on-disk
/// page ids, so it can be written back without unswizzling first.
pub struct FramePage {
    image: PageImage,
    swizzled: Box<[Option<FrameIndex>]>,
}

impl FramePage {
    pub fn new() -> Self {
        Self {
            image: PageImage::new(),
            swizzled: vec![None; MAX_CHILDREN].into_boxed_slice(),
        }
    }

    pub fn image(&self) -> &PageImage {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut PageImage {
        &mut self.image
    }

    /// Replaces the image and drops every swizzled pointer.
    pub fn install(&mut self, image: PageImage) {
        self.image = image;
        self.clear_swizzles();
    }

    pub fn clear_swizzles(&mut self) {
        self.swizzled.iter_mut().for_each(|s| *s = None);
    }

    pub fn child_pointer(&self, slot: usize) -> Option<ChildPointer> {
        let pid = self.image.child(slot)?;
        Some(match self.swizzled[slot] {
            Some(idx) => ChildPointer::Swizzled(idx),
            None => ChildPointer::OnDisk(pid),
        })
    }

    /// Slot holding `pointer`, comparing frame indices for swizzled pointers
    /// and page ids for unswizzled ones.
    pub fn find_page_id_slot(&self, pointer: ChildPointer) -> Option<usize> {
        (0..self.image.child_count()).find(|&slot| self.child_pointer(slot) == Some(pointer))
    }

    pub fn swizzle(&mut self, slot: usize, frame: FrameIndex) -> bool {
        if slot >= self.image.child_count() {
            return false;
        }
        self.swizzled[slot] = Some(frame);
        true
    }

    /// Restores the on-disk pointer of `slot`. Returns false if it was not
    /// swizzled.
    pub fn unswizzle(&mut self, slot: usize) -> bool {
        match self.swizzled.get_mut(slot) {
            Some(s @ Some(_)) => {
                *s = None;
                true
            }
            _ => false,
        }
    }

    pub fn has_swizzled_children(&self) -> bool {
        self.swizzled.iter().any(Option::is_some)
    }
}

impl Default for FramePage {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for FramePage {
    type Target = PageImage;

    fn deref(&self) -> &PageImage {
        &self.image
    }
}

impl DerefMut for FramePage {
    fn deref_mut(&mut self) -> &mut PageImage {
        &mut self.image
    }
}

/// Per-frame metadata readable without the frame latch.
///
/// `pin_count` is -1 while the frame is free or being evicted; pinning only
/// succeeds from a non-negative count.
pub struct ControlBlock {
    page_id: AtomicU64,
    used: AtomicBool,
    pin_count: AtomicI32,
    dirty: AtomicBool,
    page_lsn: AtomicU64,
    rec_lsn: AtomicU64,
    swizzled: AtomicBool,
    pinned_for_restore: AtomicBool,
}

impl ControlBlock {
    pub fn new() -> Self {
        Self {
            page_id: AtomicU64::new(0),
            used: AtomicBool::new(false),
            pin_count: AtomicI32::new(-1),
            dirty: AtomicBool::new(false),
            page_lsn: AtomicU64::new(0),
            rec_lsn: AtomicU64::new(0),
            swizzled: AtomicBool::new(false),
            pinned_for_restore: AtomicBool::new(false),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id.load(Ordering::Acquire)
    }

    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::Acquire)
    }

    pub fn pin_count(&self) -> i32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Increments the pin count unless the frame is being evicted.
    pub fn try_pin(&self) -> bool {
        self.pin_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pins| {
                (pins >= 0).then_some(pins + 1)
            })
            .is_ok()
    }

    pub fn unpin(&self) {
        self.pin_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Moves an unpinned frame to the evicting state (pin 0 to -1).
    pub fn try_begin_eviction(&self) -> bool {
        self.pin_count
            .compare_exchange(0, -1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Gives a frame back to its page after an aborted eviction.
    pub fn cancel_eviction(&self) {
        let _ = self
            .pin_count
            .compare_exchange(-1, 0, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Marks the frame dirty at `lsn`. Returns true on a clean-to-dirty
    /// transition.
    pub fn mark_dirty(&self, lsn: Lsn) -> bool {
        self.set_page_lsn(lsn);
        let was_dirty = self.dirty.swap(true, Ordering::AcqRel);
        if !was_dirty {
            self.rec_lsn.store(lsn, Ordering::Release);
        }
        !was_dirty
    }

    pub fn mark_clean(&self) {
        self.dirty.store(false, Ordering::Release);
        self.rec_lsn.store(0, Ordering::Release);
    }

    pub fn page_lsn(&self) -> Lsn {
        self.page_lsn.load(Ordering::Acquire)
    }

    pub fn set_page_lsn(&self, lsn: Lsn) {
        self.page_lsn.fetch_max(lsn, Ordering::AcqRel);
    }

    /// LSN of the update that first dirtied the frame.
    pub fn rec_lsn(&self) -> Lsn {
        self.rec_lsn.load(Ordering::Acquire)
    }

    pub fn is_swizzled(&self) -> bool {
        self.swizzled.load(Ordering::Acquire)
    }

    pub fn set_swizzled(&self, swizzled: bool) {
        self.swizzled.store(swizzled, Ordering::Release);
    }

    pub fn is_pinned_for_restore(&self) -> bool {
        self.pinned_for_restore.load(Ordering::Acquire)
    }

    pub fn set_pinned_for_restore(&self, pinned: bool) {
        self.pinned_for_restore.store(pinned, Ordering::Release);
    }

    /// Publishes a freshly loaded page with one pin held by the loader.
    pub(crate) fn load(&self, page_id: PageId, page_lsn: Lsn) {
        self.page_id.store(page_id, Ordering::Release);
        self.page_lsn.store(page_lsn, Ordering::Release);
        self.rec_lsn.store(0, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
        self.swizzled.store(false, Ordering::Release);
        self.pinned_for_restore.store(false, Ordering::Release);
        self.pin_count.store(1, Ordering::Release);
        self.used.store(true, Ordering::Release);
    }

    /// Resets the block for the free list. The pin count stays at -1.
    pub(crate) fn clear(&self) {
        self.used.store(false, Ordering::Release);
        self.pin_count.store(-1, Ordering::Release);
        self.page_id.store(0, Ordering::Release);
        self.page_lsn.store(0, Ordering::Release);
        self.mark_clean();
        self.swizzled.store(false, Ordering::Release);
        self.pinned_for_restore.store(false, Ordering::Release);
    }
}

impl Default for ControlBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlBlock")
            .field("page_id", &self.page_id())
            .field("used", &self.is_used())
            .field("pin_count", &self.pin_count())
            .field("dirty", &self.is_dirty())
            .field("page_lsn", &self.page_lsn())
            .field("swizzled", &self.is_swizzled())
            .finish()
    }
}

/// A buffer frame: control block plus latched page.
pub struct Frame {
    pub cb: ControlBlock,
    pub latch: Latch,
}

impl Frame {
    pub fn new() -> Self {
        Self {
            cb: ControlBlock::new(),
            latch: Latch::new(FramePage::new()),
        }
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::PageTag;

    #[test]
    fn test_pin_refused_while_evicting() {
        let cb = ControlBlock::new();
        assert!(!cb.try_pin());
        cb.load(7, 0);
        assert_eq!(cb.pin_count(), 1);
        assert!(!cb.try_begin_eviction());
        cb.unpin();
        assert!(cb.try_begin_eviction());
        assert!(!cb.try_pin());
        assert_eq!(cb.pin_count(), -1);
    }

    #[test]
    fn test_dirty_transition_records_rec_lsn() {
        let cb = ControlBlock::new();
        cb.load(3, 10);
        assert!(cb.mark_dirty(20));
        assert!(!cb.mark_dirty(30));
        assert_eq!(cb.rec_lsn(), 20);
        assert_eq!(cb.page_lsn(), 30);
        cb.mark_clean();
        assert!(!cb.is_dirty());
    }

    #[test]
    fn test_swizzle_overlay() {
        let mut page = FramePage::new();
        page.install(PageImage::formatted(1, PageTag::BTree, 1));
        let slot = page.push_child(9).unwrap();
        assert_eq!(page.child_pointer(slot), Some(ChildPointer::OnDisk(9)));
        assert!(page.swizzle(slot, FrameIndex::new(4)));
        assert_eq!(
            page.find_page_id_slot(ChildPointer::Swizzled(FrameIndex::new(4))),
            Some(slot)
        );
        assert_eq!(page.find_page_id_slot(ChildPointer::OnDisk(9)), None);
        // the image keeps the on-disk id
        assert_eq!(page.child(slot), Some(9));
        assert!(page.has_swizzled_children());
        assert!(page.unswizzle(slot));
        assert!(!page.unswizzle(slot));
        assert_eq!(page.find_page_id_slot(ChildPointer::OnDisk(9)), Some(slot));
        assert!(!page.swizzle(5, FrameIndex::new(2)));
    }
}
