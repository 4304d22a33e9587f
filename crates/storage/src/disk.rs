//! Volumes: where page images live when they are not buffered.
//!
//! Invariants of the file-backed volume:
//! - Page 0 is a reserved header storing next_page_id as u64 (format: bytes 0..8)
//! - Page ids are never reused, so 0 doubles as the null page id
//! - On open, header is loaded (created if absent)

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Error, ErrorKind, Result};
use std::os::unix::fs::FileExt;
use std::path::Path;

use parking_lot::Mutex;

pub type PageId = u64;
pub const PAGE_SIZE: usize = 4096;
pub const HEADER_SIZE: usize = PAGE_SIZE; // header occupies page 0

/// The volume collaborator of the buffer pool.
pub trait Volume: Send + Sync {
    /// Reads the image of `page_id` into `buf`.
    fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()>;

    /// Writes `buf` as the image of `page_id`.
    fn write_page(&self, page_id: PageId, buf: &[u8; PAGE_SIZE]) -> Result<()>;

    /// Allocates a fresh, zeroed page.
    fn allocate_page(&self) -> Result<PageId>;

    /// Forces written pages to stable storage.
    fn sync(&self) -> Result<()>;
}

struct Header {
    next_page_id: u64, // always points to next free (monotonic, persistent)
}

impl Header {
    fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..8].copy_from_slice(&self.next_page_id.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        let mut b = [0u8; 8];
        b.copy_from_slice(&buf[..8]);
        Self {
            next_page_id: u64::from_le_bytes(b),
        }
    }
}

/// File-backed volume.
pub struct DiskManager {
    file: File,
    header: Mutex<Header>, // synced on every allocation
}

impl DiskManager {
    /// Opens or creates the file; loads or initializes a valid header
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let header = Self::load_or_init_header(&file)?;
        Ok(DiskManager {
            file,
            header: Mutex::new(header),
        })
    }

    fn load_or_init_header(file: &File) -> Result<Header> {
        let meta = file.metadata()?;
        if meta.len() < HEADER_SIZE as u64 {
            let header = Header { next_page_id: 1 };
            file.write_at(&header.to_bytes(), 0)?;
            Ok(header)
        } else {
            let mut buf = [0u8; HEADER_SIZE];
            file.read_at(&mut buf, 0)?;
            Ok(Header::from_bytes(&buf))
        }
    }

    /// For tests: returns current next_page_id
    pub fn get_next_page_id(&self) -> PageId {
        self.header.lock().next_page_id
    }

    fn check_page_id(&self, page_id: PageId) -> Result<()> {
        if page_id == 0 || page_id >= self.get_next_page_id() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("page {} is not allocated", page_id),
            ));
        }
        Ok(())
    }
}

impl Volume for DiskManager {
    fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        self.check_page_id(page_id)?;
        self.file.read_exact_at(buf, page_id * PAGE_SIZE as u64)
    }

    fn write_page(&self, page_id: PageId, buf: &[u8; PAGE_SIZE]) -> Result<()> {
        self.check_page_id(page_id)?;
        self.file.write_all_at(buf, page_id * PAGE_SIZE as u64)
    }

    /// Extends the file with a zeroed page, then persists the header.
    fn allocate_page(&self) -> Result<PageId> {
        let mut header = self.header.lock();
        let page_id = header.next_page_id;
        let zero_buf = [0u8; PAGE_SIZE];
        self.file.write_all_at(&zero_buf, page_id * PAGE_SIZE as u64)?;
        header.next_page_id += 1;
        self.file.write_all_at(&header.to_bytes(), 0)?;
        self.file.sync_data()?;
        Ok(page_id)
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()
    }
}

type WriteHook = Box<dyn Fn(PageId, &[u8; PAGE_SIZE]) + Send + Sync>;

#[derive(Default)]
struct MemoryState {
    pages: HashMap<PageId, Box<[u8; PAGE_SIZE]>>,
    next_page_id: PageId,
    writes: Vec<PageId>,
    syncs: usize,
    fail_writes: bool,
}

/// In-memory volume that records every write. Used by tests and by
/// `sm_no_db` style setups.
pub struct MemoryVolume {
    state: Mutex<MemoryState>,
    write_hook: Mutex<Option<WriteHook>>,
}

impl MemoryVolume {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                next_page_id: 1,
                ..MemoryState::default()
            }),
            write_hook: Mutex::new(None),
        }
    }

    /// Installs a callback invoked before each write reaches the volume.
    pub fn set_write_hook<F>(&self, hook: F)
    where
        F: Fn(PageId, &[u8; PAGE_SIZE]) + Send + Sync + 'static,
    {
        *self.write_hook.lock() = Some(Box::new(hook));
    }

    /// Makes subsequent writes fail with an I/O error.
    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Page ids in the order they were written.
    pub fn writes(&self) -> Vec<PageId> {
        self.state.lock().writes.clone()
    }

    pub fn sync_count(&self) -> usize {
        self.state.lock().syncs
    }

    /// Returns a copy of the stored image of `page_id`.
    pub fn stored_image(&self, page_id: PageId) -> Option<Box<[u8; PAGE_SIZE]>> {
        self.state.lock().pages.get(&page_id).cloned()
    }
}

impl Default for MemoryVolume {
    fn default() -> Self {
        Self::new()
    }
}

impl Volume for MemoryVolume {
    fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        let state = self.state.lock();
        match state.pages.get(&page_id) {
            Some(image) => {
                buf.copy_from_slice(&image[..]);
                Ok(())
            }
            None => Err(Error::new(
                ErrorKind::NotFound,
                format!("page {} is not allocated", page_id),
            )),
        }
    }

    fn write_page(&self, page_id: PageId, buf: &[u8; PAGE_SIZE]) -> Result<()> {
        if let Some(hook) = self.write_hook.lock().as_ref() {
            hook(page_id, buf);
        }
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(Error::other(format!("injected write failure on page {}", page_id)));
        }
        let Some(image) = state.pages.get_mut(&page_id) else {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("page {} is not allocated", page_id),
            ));
        };
        image.copy_from_slice(buf);
        state.writes.push(page_id);
        Ok(())
    }

    fn allocate_page(&self) -> Result<PageId> {
        let mut state = self.state.lock();
        let page_id = state.next_page_id;
        state.next_page_id += 1;
        state.pages.insert(page_id, Box::new([0u8; PAGE_SIZE]));
        Ok(page_id)
    }

    fn sync(&self) -> Result<()> {
        self.state.lock().syncs += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_crash_recovery_data_integrity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.db");

        let page_id = {
            let dm = DiskManager::open(&path).expect("Failed to open volume");
            let page_id = dm.allocate_page().expect("Alloc failed");

            let mut data = [0u8; PAGE_SIZE];
            data[0..4].copy_from_slice(b"DEAD");
            data[PAGE_SIZE - 4..].copy_from_slice(b"BEEF");
            dm.write_page(page_id, &data).expect("Write failed");
            page_id
        };

        let dm = DiskManager::open(&path).expect("Failed to reopen volume");
        assert_eq!(dm.get_next_page_id(), 2, "Header state not persisted!");
        let mut buffer = [0u8; PAGE_SIZE];
        dm.read_page(page_id, &mut buffer).expect("Read failed");
        assert_eq!(&buffer[0..4], b"DEAD");
        assert_eq!(&buffer[PAGE_SIZE - 4..], b"BEEF");
    }

    #[test]
    fn test_unallocated_pages_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dm = DiskManager::open(dir.path().join("volume.db")).unwrap();
        let mut buf = [0u8; PAGE_SIZE];
        assert!(dm.read_page(0, &mut buf).is_err(), "header page is not a data page");
        assert!(dm.write_page(1, &buf).is_err());
        let p1 = dm.allocate_page().unwrap();
        assert!(dm.write_page(p1, &buf).is_ok());
    }

    #[test]
    fn test_monotonic_growth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.db");
        {
            let dm = DiskManager::open(&path).unwrap();
            for i in 1..=20 {
                assert_eq!(dm.allocate_page().unwrap(), i as u64);
            }
        }
        let dm = DiskManager::open(&path).unwrap();
        assert_eq!(dm.allocate_page().unwrap(), 21);
        let expected_size = (HEADER_SIZE + 21 * PAGE_SIZE) as u64;
        assert_eq!(fs::metadata(&path).unwrap().len(), expected_size);
    }

    #[test]
    fn test_memory_volume_records_writes() {
        let volume = MemoryVolume::new();
        let hooked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hooked);
        volume.set_write_hook(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let p1 = volume.allocate_page().unwrap();
        let p2 = volume.allocate_page().unwrap();
        let buf = [0xAB; PAGE_SIZE];
        volume.write_page(p2, &buf).unwrap();
        volume.write_page(p1, &buf).unwrap();
        assert_eq!(volume.writes(), vec![p2, p1]);
        assert_eq!(hooked.load(Ordering::SeqCst), 2);

        let mut read = [0u8; PAGE_SIZE];
        volume.read_page(p2, &mut read).unwrap();
        assert_eq!(read, buf);

        volume.fail_writes(true);
        assert!(volume.write_page(p1, &buf).is_err());
        assert_eq!(volume.writes().len(), 2);
    }
}
