//! Page image as it lives on a volume and inside a buffer frame.
//!
//! Layout (little endian):
//! - `[0..8)` page LSN
//! - `[8..16)` page id
//! - `[16..24)` root page id of the owning store
//! - `[24]` page tag
//! - `[26..28)` number of child slots
//! - `[32..32 + 16 * MAX_CHILDREN)` child slots, each a child page id followed
//!   by the end-mark LSN recorded for that child
//! - the remainder is opaque payload

use std::fmt;

use wal::Lsn;

use crate::{PAGE_SIZE, PageId};

pub const PAGE_LSN_SIZE: usize = 8;
pub const MAX_CHILDREN: usize = 64;

const PID_OFFSET: usize = 8;
const ROOT_OFFSET: usize = 16;
const TAG_OFFSET: usize = 24;
const CHILD_COUNT_OFFSET: usize = 26;
const CHILDREN_OFFSET: usize = 32;
const CHILD_SLOT_SIZE: usize = 16;
pub const PAYLOAD_OFFSET: usize = CHILDREN_OFFSET + MAX_CHILDREN * CHILD_SLOT_SIZE;

/// What kind of page an image holds. Only the distinctions the buffer pool
/// cares about are modelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTag {
    Unformatted,
    /// Extent/volume allocation page.
    Alloc,
    /// Store directory / metadata page.
    StoreMeta,
    BTree,
}

impl PageTag {
    fn to_byte(self) -> u8 {
        match self {
            PageTag::Unformatted => 0,
            PageTag::Alloc => 1,
            PageTag::StoreMeta => 2,
            PageTag::BTree => 3,
        }
    }

    fn from_byte(value: u8) -> Self {
        match value {
            1 => PageTag::Alloc,
            2 => PageTag::StoreMeta,
            3 => PageTag::BTree,
            _ => PageTag::Unformatted,
        }
    }
}

/// Fixed-size page image.
#[derive(Clone)]
pub struct PageImage {
    data: Box<[u8; PAGE_SIZE]>,
}

impl PageImage {
    /// Creates a zeroed, unformatted image.
    pub fn new() -> Self {
        Self {
            data: Box::new([0u8; PAGE_SIZE]),
        }
    }

    /// Creates an image carrying the given identity and no children.
    pub fn formatted(page_id: PageId, tag: PageTag, root: PageId) -> Self {
        let mut image = Self::new();
        image.format(page_id, tag, root);
        image
    }

    /// Resets the image and stamps a new identity on it.
    pub fn format(&mut self, page_id: PageId, tag: PageTag, root: PageId) {
        self.data.fill(0);
        self.write_u64(PID_OFFSET, page_id);
        self.write_u64(ROOT_OFFSET, root);
        self.data[TAG_OFFSET] = tag.to_byte();
    }

    pub fn page_id(&self) -> PageId {
        self.read_u64(PID_OFFSET)
    }

    pub fn root(&self) -> PageId {
        self.read_u64(ROOT_OFFSET)
    }

    pub fn tag(&self) -> PageTag {
        PageTag::from_byte(self.data[TAG_OFFSET])
    }

    /// True for the root page of a B-tree store.
    pub fn is_btree_root(&self) -> bool {
        self.tag() == PageTag::BTree && self.page_id() == self.root()
    }

    /// True for allocation and store metadata pages, which stay resident.
    pub fn is_metadata(&self) -> bool {
        matches!(self.tag(), PageTag::Alloc | PageTag::StoreMeta)
    }

    /// Returns the page LSN stored in the header.
    pub fn lsn(&self) -> Lsn {
        let mut bytes = [0u8; PAGE_LSN_SIZE];
        bytes.copy_from_slice(&self.data[..PAGE_LSN_SIZE]);
        u64::from_le_bytes(bytes)
    }

    /// Updates the page LSN in the header.
    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.data[..PAGE_LSN_SIZE].copy_from_slice(&lsn.to_le_bytes());
    }

    pub fn child_count(&self) -> usize {
        let mut bytes = [0u8; 2];
        bytes.copy_from_slice(&self.data[CHILD_COUNT_OFFSET..CHILD_COUNT_OFFSET + 2]);
        (u16::from_le_bytes(bytes) as usize).min(MAX_CHILDREN)
    }

    /// Appends a child pointer, returning its slot.
    pub fn push_child(&mut self, child: PageId) -> Option<usize> {
        let slot = self.child_count();
        if slot >= MAX_CHILDREN {
            return None;
        }
        self.write_u64(Self::child_offset(slot), child);
        self.write_u64(Self::child_offset(slot) + 8, 0);
        self.data[CHILD_COUNT_OFFSET..CHILD_COUNT_OFFSET + 2]
            .copy_from_slice(&((slot + 1) as u16).to_le_bytes());
        Some(slot)
    }

    pub fn child(&self, slot: usize) -> Option<PageId> {
        if slot >= self.child_count() {
            return None;
        }
        Some(self.read_u64(Self::child_offset(slot)))
    }

    /// Finds the slot holding the given child page id.
    pub fn find_child(&self, child: PageId) -> Option<usize> {
        (0..self.child_count()).find(|&slot| self.read_u64(Self::child_offset(slot)) == child)
    }

    /// End-mark LSN recorded for the child in `slot`.
    pub fn emlsn(&self, slot: usize) -> Option<Lsn> {
        if slot >= self.child_count() {
            return None;
        }
        Some(self.read_u64(Self::child_offset(slot) + 8))
    }

    pub fn set_emlsn(&mut self, slot: usize, lsn: Lsn) -> bool {
        if slot >= self.child_count() {
            return false;
        }
        self.write_u64(Self::child_offset(slot) + 8, lsn);
        true
    }

    /// Returns the entire page data.
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    /// Returns a mutable reference to the entire page data.
    pub fn data_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.data
    }

    /// Reads a slice of bytes from the payload area.
    pub fn read_bytes(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let start = PAYLOAD_OFFSET.checked_add(offset)?;
        if start.checked_add(len)? > PAGE_SIZE {
            return None;
        }
        Some(&self.data[start..start + len])
    }

    /// Writes bytes into the payload area at the given offset.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> bool {
        let start = PAYLOAD_OFFSET + offset;
        if start + bytes.len() > PAGE_SIZE {
            return false;
        }
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        true
    }

    fn child_offset(slot: usize) -> usize {
        CHILDREN_OFFSET + slot * CHILD_SLOT_SIZE
    }

    fn read_u64(&self, offset: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data[offset..offset + 8]);
        u64::from_le_bytes(bytes)
    }

    fn write_u64(&mut self, offset: usize, value: u64) {
        self.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }
}

impl Default for PageImage {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PageImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageImage")
            .field("page_id", &self.page_id())
            .field("tag", &self.tag())
            .field("root", &self.root())
            .field("lsn", &self.lsn())
            .field("children", &self.child_count())
            .finish()
    }
}
