use storage::PageId;
use thiserror::Error;
use wal::WalError;

/// Errors returned by the buffer pool and its evictioners.
#[derive(Debug, Error)]
pub enum BufferError {
    /// The volume failed to read or write a page.
    #[error("volume error: {0}")]
    Io(#[from] std::io::Error),
    /// The log could not be appended to or flushed.
    #[error("log error: {0}")]
    Wal(#[from] WalError),
    /// No victim could be found for too long; the pool is wedged.
    #[error("eviction stuck after {attempts} failed attempts")]
    EvictionStuck { attempts: u64 },
    /// A page the evictor held latched had no hash index entry.
    #[error("page {0} is buffered but missing from the hash index")]
    InconsistentMapping(PageId),
    /// Every frame is pinned and eviction made no progress.
    #[error("no free frame available")]
    BufferFull,
    #[error("page {page} has no child slot {slot}")]
    InvalidSlot { page: PageId, slot: usize },
    #[error("page {page}: payload range {offset}+{len} out of bounds")]
    PayloadOutOfRange {
        page: PageId,
        offset: usize,
        len: usize,
    },
    #[error("operation requires an exclusive latch")]
    NotLatchedExclusive,
    #[error("invalid option: {0}")]
    InvalidOption(String),
}

/// Convenience alias for buffer pool results.
pub type BufferResult<T> = Result<T, BufferError>;
