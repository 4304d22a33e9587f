use crate::frame::FrameIndex;

/// Identifies one clock of a [`MultiClock`].
pub type ClockId = usize;

#[derive(Debug, Clone)]
struct Entry<V> {
    before: Option<FrameIndex>,
    after: Option<FrameIndex>,
    owner: Option<ClockId>,
    value: V,
}

#[derive(Debug, Clone, Copy, Default)]
struct Clock {
    head: Option<FrameIndex>,
    size: usize,
}

/// A fixed domain of indices partitioned across several circular lists.
///
/// Every index belongs to at most one clock. The tail of a clock is the
/// element right before its head, so `add_tail` inserts there and
/// `move_head` advances the hand. Every operation is O(1).
#[derive(Debug, Clone)]
pub struct MultiClock<V> {
    entries: Vec<Entry<V>>,
    clocks: Vec<Clock>,
}

impl<V: Clone + Default> MultiClock<V> {
    /// Creates `clocks` empty clocks over indices `0..clocksize`.
    pub fn new(clocksize: usize, clocks: usize) -> Self {
        let entries = (0..clocksize)
            .map(|_| Entry {
                before: None,
                after: None,
                owner: None,
                value: V::default(),
            })
            .collect();
        Self {
            entries,
            clocks: vec![Clock::default(); clocks],
        }
    }

    pub fn clocksize(&self) -> usize {
        self.entries.len()
    }

    fn entry(&self, idx: FrameIndex) -> Option<&Entry<V>> {
        self.entries.get(idx.as_usize())
    }

    fn entry_mut(&mut self, idx: FrameIndex) -> Option<&mut Entry<V>> {
        self.entries.get_mut(idx.as_usize())
    }

    /// Value stored at `idx`; `None` when `idx` is outside the domain.
    pub fn get(&self, idx: FrameIndex) -> Option<&V> {
        self.entry(idx).map(|e| &e.value)
    }

    pub fn set(&mut self, idx: FrameIndex, value: V) -> bool {
        match self.entry_mut(idx) {
            Some(e) => {
                e.value = value;
                true
            }
            None => false,
        }
    }

    pub fn owner(&self, idx: FrameIndex) -> Option<ClockId> {
        self.entry(idx).and_then(|e| e.owner)
    }

    pub fn get_head_index(&self, clock: ClockId) -> Option<FrameIndex> {
        self.clocks.get(clock).and_then(|c| c.head)
    }

    pub fn get_head(&self, clock: ClockId) -> Option<&V> {
        self.get_head_index(clock).and_then(|idx| self.get(idx))
    }

    pub fn set_head(&mut self, clock: ClockId, value: V) -> bool {
        match self.get_head_index(clock) {
            Some(idx) => self.set(idx, value),
            None => false,
        }
    }

    pub fn size_of(&self, clock: ClockId) -> usize {
        self.clocks.get(clock).map_or(0, |c| c.size)
    }

    /// Advances the clock hand by one. False on an empty clock.
    pub fn move_head(&mut self, clock: ClockId) -> bool {
        let Some(head) = self.get_head_index(clock) else {
            return false;
        };
        let next = self.entry(head).and_then(|e| e.after);
        self.clocks[clock].head = next;
        true
    }

    fn is_free(&self, idx: FrameIndex) -> bool {
        self.entry(idx).is_some_and(|e| e.owner.is_none())
    }

    /// Links `idx` between `prev` and `next`, which must be adjacent.
    fn link(&mut self, clock: ClockId, prev: FrameIndex, idx: FrameIndex, next: FrameIndex) {
        self.entries[prev.as_usize()].after = Some(idx);
        self.entries[next.as_usize()].before = Some(idx);
        let entry = &mut self.entries[idx.as_usize()];
        entry.before = Some(prev);
        entry.after = Some(next);
        entry.owner = Some(clock);
        self.clocks[clock].size += 1;
    }

    /// Inserts `idx` as the tail of `clock`. Fails if `idx` is out of the
    /// domain or already belongs to a clock.
    pub fn add_tail(&mut self, clock: ClockId, idx: FrameIndex) -> bool {
        if clock >= self.clocks.len() || !self.is_free(idx) {
            return false;
        }
        match self.clocks[clock].head {
            Some(head) => {
                let Some(tail) = self.entries[head.as_usize()].before else {
                    return false;
                };
                self.link(clock, tail, idx, head);
            }
            None => {
                let entry = &mut self.entries[idx.as_usize()];
                entry.before = Some(idx);
                entry.after = Some(idx);
                entry.owner = Some(clock);
                self.clocks[clock].head = Some(idx);
                self.clocks[clock].size = 1;
            }
        }
        true
    }

    /// Inserts `idx` right before `at`, in `at`'s clock.
    pub fn add_before(&mut self, at: FrameIndex, idx: FrameIndex) -> bool {
        let Some(clock) = self.owner(at) else {
            return false;
        };
        if !self.is_free(idx) {
            return false;
        }
        let Some(prev) = self.entries[at.as_usize()].before else {
            return false;
        };
        self.link(clock, prev, idx, at);
        true
    }

    /// Inserts `idx` right after `at`, in `at`'s clock.
    pub fn add_after(&mut self, at: FrameIndex, idx: FrameIndex) -> bool {
        let Some(clock) = self.owner(at) else {
            return false;
        };
        if !self.is_free(idx) {
            return false;
        }
        let Some(next) = self.entries[at.as_usize()].after else {
            return false;
        };
        self.link(clock, at, idx, next);
        true
    }

    /// Unlinks `idx` from whatever clock holds it. The stored value is kept.
    pub fn remove(&mut self, idx: FrameIndex) -> bool {
        let Some(clock) = self.owner(idx) else {
            return false;
        };
        let (before, after) = {
            let e = &self.entries[idx.as_usize()];
            (e.before, e.after)
        };
        if self.clocks[clock].size == 1 {
            self.clocks[clock].head = None;
        } else if let (Some(before), Some(after)) = (before, after) {
            self.entries[before.as_usize()].after = Some(after);
            self.entries[after.as_usize()].before = Some(before);
            if self.clocks[clock].head == Some(idx) {
                self.clocks[clock].head = Some(after);
            }
        }
        let entry = &mut self.entries[idx.as_usize()];
        entry.before = None;
        entry.after = None;
        entry.owner = None;
        self.clocks[clock].size -= 1;
        true
    }

    pub fn remove_head(&mut self, clock: ClockId) -> Option<FrameIndex> {
        let head = self.get_head_index(clock)?;
        self.remove(head);
        Some(head)
    }

    /// Moves the head of `src` to the tail of `dst`, keeping its value.
    pub fn switch_head_to_tail(&mut self, src: ClockId, dst: ClockId) -> Option<FrameIndex> {
        if dst >= self.clocks.len() {
            return None;
        }
        let idx = self.remove_head(src)?;
        self.add_tail(dst, idx);
        Some(idx)
    }

    /// Indices of `clock` starting at its head.
    pub fn iter_clock(&self, clock: ClockId) -> impl Iterator<Item = FrameIndex> + '_ {
        let mut cursor = self.get_head_index(clock);
        let mut remaining = self.size_of(clock);
        std::iter::from_fn(move || {
            if remaining == 0 {
                return None;
            }
            let idx = cursor?;
            remaining -= 1;
            cursor = self.entry(idx).and_then(|e| e.after);
            Some(idx)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx(i: usize) -> FrameIndex {
        FrameIndex::new(i)
    }

    fn order(clock: &MultiClock<u32>, id: ClockId) -> Vec<usize> {
        clock.iter_clock(id).map(|i| i.as_usize()).collect()
    }

    #[test]
    fn test_add_tail_and_move_head() {
        let mut clock = MultiClock::<u32>::new(8, 2);
        assert!(clock.add_tail(0, idx(1)));
        assert!(clock.add_tail(0, idx(2)));
        assert!(clock.add_tail(0, idx(3)));
        assert!(!clock.add_tail(1, idx(2)));
        assert_eq!(order(&clock, 0), vec![1, 2, 3]);
        assert!(clock.move_head(0));
        assert_eq!(clock.get_head_index(0), Some(idx(2)));
        // the old head is now the tail
        assert_eq!(order(&clock, 0), vec![2, 3, 1]);
    }

    #[test]
    fn test_values_and_head_access() {
        let mut clock = MultiClock::<u32>::new(4, 1);
        assert!(clock.set(idx(2), 7));
        assert_eq!(clock.get(idx(2)), Some(&7));
        assert_eq!(clock.get(idx(9)), None);
        assert!(!clock.set(idx(9), 1));
        assert_eq!(clock.get_head(0), None);
        assert!(!clock.set_head(0, 1));
        clock.add_tail(0, idx(2));
        assert_eq!(clock.get_head(0), Some(&7));
        assert!(clock.set_head(0, 8));
        assert_eq!(clock.get(idx(2)), Some(&8));
    }

    #[test]
    fn test_add_before_and_after() {
        let mut clock = MultiClock::<u32>::new(8, 1);
        clock.add_tail(0, idx(1));
        clock.add_tail(0, idx(2));
        assert!(clock.add_after(idx(1), idx(5)));
        assert!(clock.add_before(idx(1), idx(6)));
        assert_eq!(order(&clock, 0), vec![1, 5, 2, 6]);
        assert!(!clock.add_after(idx(7), idx(3)));
        assert_eq!(clock.size_of(0), 4);
    }

    #[test]
    fn test_remove_and_switch() {
        let mut clock = MultiClock::<u32>::new(8, 2);
        for i in 1..=4 {
            clock.add_tail(0, idx(i));
        }
        assert!(clock.remove(idx(3)));
        assert!(!clock.remove(idx(3)));
        assert_eq!(order(&clock, 0), vec![1, 2, 4]);
        clock.set(idx(1), 42);
        assert_eq!(clock.switch_head_to_tail(0, 1), Some(idx(1)));
        assert_eq!(clock.owner(idx(1)), Some(1));
        assert_eq!(clock.get(idx(1)), Some(&42));
        assert_eq!(order(&clock, 0), vec![2, 4]);
        assert_eq!(order(&clock, 1), vec![1]);
        assert_eq!(clock.remove_head(0), Some(idx(2)));
        assert_eq!(clock.remove_head(0), Some(idx(4)));
        assert_eq!(clock.remove_head(0), None);
        assert_eq!(clock.size_of(0), 0);
        assert!(!clock.move_head(0));
    }
}
