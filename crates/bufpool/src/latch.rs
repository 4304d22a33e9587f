//! Per-frame reader/writer latch.
//!
//! Guards are `Arc`-backed so the evictor can hand a latched victim back to
//! its caller without borrowing the pool. The latch remembers which thread
//! holds it exclusively so a thread never tries to evict a frame it is
//! itself working on.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

use crate::frame::FramePage;

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

fn current_thread_token() -> u64 {
    THREAD_TOKEN.with(|t| *t)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    Shared,
    Exclusive,
}

pub struct Latch {
    page: Arc<RwLock<FramePage>>,
    owner: Arc<AtomicU64>,
}

impl Latch {
    pub fn new(page: FramePage) -> Self {
        Self {
            page: Arc::new(RwLock::new(page)),
            owner: Arc::new(AtomicU64::new(0)),
        }
    }

    fn exclusive(&self, guard: ArcRwLockWriteGuard<RawRwLock, FramePage>) -> ExclusiveLatch {
        self.owner.store(current_thread_token(), Ordering::Release);
        ExclusiveLatch {
            _owner: OwnerMark(Arc::clone(&self.owner)),
            guard,
        }
    }

    /// Blocks until the latch is held exclusively.
    pub fn latch_ex(&self) -> ExclusiveLatch {
        let guard = self.page.write_arc();
        self.exclusive(guard)
    }

    pub fn try_latch_ex(&self) -> Option<ExclusiveLatch> {
        let guard = self.page.try_write_arc()?;
        Some(self.exclusive(guard))
    }

    pub fn latch_sh(&self) -> SharedLatch {
        SharedLatch {
            guard: self.page.read_arc(),
        }
    }

    pub fn try_latch_sh(&self) -> Option<SharedLatch> {
        self.page.try_read_arc().map(|guard| SharedLatch { guard })
    }

    /// True if the calling thread holds this latch exclusively.
    pub fn held_by_me(&self) -> bool {
        self.owner.load(Ordering::Acquire) == current_thread_token()
    }

    pub fn is_latched(&self) -> bool {
        self.page.is_locked()
    }
}

/// Clears the owner mark. Declared before the guard in `ExclusiveLatch` so
/// the mark is gone before the lock is released.
struct OwnerMark(Arc<AtomicU64>);

impl Drop for OwnerMark {
    fn drop(&mut self) {
        self.0.store(0, Ordering::Release);
    }
}

pub struct ExclusiveLatch {
    _owner: OwnerMark,
    guard: ArcRwLockWriteGuard<RawRwLock, FramePage>,
}

impl ExclusiveLatch {
    /// Atomically turns the exclusive latch into a shared one.
    pub fn downgrade(self) -> SharedLatch {
        let ExclusiveLatch { _owner, guard } = self;
        drop(_owner);
        SharedLatch {
            guard: ArcRwLockWriteGuard::downgrade(guard),
        }
    }
}

impl Deref for ExclusiveLatch {
    type Target = FramePage;

    fn deref(&self) -> &FramePage {
        &self.guard
    }
}

impl DerefMut for ExclusiveLatch {
    fn deref_mut(&mut self) -> &mut FramePage {
        &mut self.guard
    }
}

pub struct SharedLatch {
    guard: ArcRwLockReadGuard<RawRwLock, FramePage>,
}

impl Deref for SharedLatch {
    type Target = FramePage;

    fn deref(&self) -> &FramePage {
        &self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_owner_tracking() {
        let latch = Latch::new(FramePage::new());
        assert!(!latch.held_by_me());
        let ex = latch.latch_ex();
        assert!(latch.held_by_me());
        assert!(latch.try_latch_ex().is_none());
        assert!(latch.try_latch_sh().is_none());

        let other = std::thread::scope(|s| s.spawn(|| latch.held_by_me()).join().unwrap());
        assert!(!other);

        let sh = ex.downgrade();
        assert!(!latch.held_by_me());
        assert!(latch.try_latch_sh().is_some());
        assert!(latch.try_latch_ex().is_none());
        drop(sh);
        assert!(!latch.is_latched());
        assert!(latch.try_latch_ex().is_some());
    }
}
