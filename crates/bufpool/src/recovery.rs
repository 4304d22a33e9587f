use std::collections::HashMap;

use parking_lot::Mutex;
use storage::PageId;
use wal::Lsn;

/// Receives pages that leave the buffer pool while restart or media
/// recovery still needs to know about them.
pub trait DirtyPageTable: Send + Sync {
    /// Records `page_id` as dirty since `rec_lsn`. Keeps the oldest LSN if
    /// the page is already registered.
    fn add_dirty_page(&self, page_id: PageId, rec_lsn: Lsn);

    fn remove_dirty_page(&self, page_id: PageId) -> bool;

    fn rec_lsn(&self, page_id: PageId) -> Option<Lsn>;
}

/// In-memory dirty page table.
#[derive(Default)]
pub struct DirtyPageRegistry {
    pages: Mutex<HashMap<PageId, Lsn>>,
}

impl DirtyPageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Smallest recovery LSN over all registered pages.
    pub fn min_rec_lsn(&self) -> Option<Lsn> {
        self.pages.lock().values().copied().min()
    }

    /// Registered pages ordered by page id.
    pub fn snapshot(&self) -> Vec<(PageId, Lsn)> {
        let mut pages: Vec<_> = self.pages.lock().iter().map(|(p, l)| (*p, *l)).collect();
        pages.sort_unstable();
        pages
    }
}

impl DirtyPageTable for DirtyPageRegistry {
    fn add_dirty_page(&self, page_id: PageId, rec_lsn: Lsn) {
        let mut pages = self.pages.lock();
        let entry = pages.entry(page_id).or_insert(rec_lsn);
        *entry = (*entry).min(rec_lsn);
    }

    fn remove_dirty_page(&self, page_id: PageId) -> bool {
        self.pages.lock().remove(&page_id).is_some()
    }

    fn rec_lsn(&self, page_id: PageId) -> Option<Lsn> {
        self.pages.lock().get(&page_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_oldest_rec_lsn() {
        let table = DirtyPageRegistry::new();
        table.add_dirty_page(4, 100);
        table.add_dirty_page(4, 80);
        table.add_dirty_page(4, 120);
        table.add_dirty_page(2, 90);
        assert_eq!(table.rec_lsn(4), Some(80));
        assert_eq!(table.min_rec_lsn(), Some(80));
        assert_eq!(table.snapshot(), vec![(2, 90), (4, 80)]);
        assert!(table.remove_dirty_page(4));
        assert!(!table.remove_dirty_page(4));
        assert_eq!(table.len(), 1);
    }
}
