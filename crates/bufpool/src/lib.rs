//! Buffer pool with pluggable page replacement.
//!
//! [`BufferPoolManager`] fixes pages into frames of a [`BufferPool`]. When
//! the free list runs dry a [`PageEvictioner`] picks victims, either inline
//! or from an [`EvictionWorker`] thread. Three policies are available:
//! a plain frame sweep, GCLOCK and CAR.

// MODULE DECLARATIONS
pub mod collections;
mod error;
pub mod evict;
mod frame;
mod hashtable;
mod latch;
mod manager;
mod options;
mod pool;
mod recovery;

// PUBLIC API EXPORTS
pub use error::{BufferError, BufferResult};
pub use evict::{
    BaseEvictioner, CarEvictioner, EvictionCore, EvictionStats, EvictionWorker,
    GClockEvictioner, PageEvictioner, Victim, create_evictioner,
};
pub use frame::{ChildPointer, ControlBlock, Frame, FrameIndex, FramePage};
pub use hashtable::HashIndex;
pub use latch::{ExclusiveLatch, Latch, LatchMode, SharedLatch};
pub use manager::{BufferPoolManager, PageGuard};
pub use options::{BufferOptions, EvictPolicy};
pub use pool::{BufferPool, FrameLink, PageCleaner};
pub use recovery::{DirtyPageRegistry, DirtyPageTable};
