// MODULE DECLARATIONS
mod disk;
mod page;

// PUBLIC API EXPORTS
pub use disk::{DiskManager, MemoryVolume, PAGE_SIZE, PageId, Volume};
pub use page::{MAX_CHILDREN, PAYLOAD_OFFSET, PageImage, PageTag};

/// Page id 0 is the volume header and never names a data page.
pub const NULL_PAGE_ID: PageId = 0;
