use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone, Copy)]
struct Links<K> {
    prev: Option<K>,
    next: Option<K>,
}

/// FIFO queue of unique keys that can also drop any key in O(1).
///
/// Used for the CAR ghost lists, which are popped from the front when they
/// overflow and have arbitrary members removed on a ghost hit.
#[derive(Debug, Clone)]
pub struct DirectAccessQueue<K> {
    nodes: HashMap<K, Links<K>>,
    front: Option<K>,
    back: Option<K>,
}

impl<K: Copy + Eq + Hash> DirectAccessQueue<K> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: HashMap::with_capacity(capacity),
            front: None,
            back: None,
        }
    }

    /// Appends `key` at the back. Returns false if it is already queued.
    pub fn push(&mut self, key: K) -> bool {
        if self.nodes.contains_key(&key) {
            return false;
        }
        let links = Links {
            prev: self.back,
            next: None,
        };
        match self.back {
            Some(back) => {
                if let Some(node) = self.nodes.get_mut(&back) {
                    node.next = Some(key);
                }
            }
            None => self.front = Some(key),
        }
        self.back = Some(key);
        self.nodes.insert(key, links);
        true
    }

    /// Removes and returns the oldest key.
    pub fn pop(&mut self) -> Option<K> {
        let front = self.front?;
        self.remove(&front);
        Some(front)
    }

    /// Removes `key` wherever it sits in the queue.
    pub fn remove(&mut self, key: &K) -> bool {
        let Some(links) = self.nodes.remove(key) else {
            return false;
        };
        match links.prev {
            Some(prev) => {
                if let Some(node) = self.nodes.get_mut(&prev) {
                    node.next = links.next;
                }
            }
            None => self.front = links.next,
        }
        match links.next {
            Some(next) => {
                if let Some(node) = self.nodes.get_mut(&next) {
                    node.prev = links.prev;
                }
            }
            None => self.back = links.prev,
        }
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn front(&self) -> Option<K> {
        self.front
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Keys from front to back.
    pub fn iter(&self) -> impl Iterator<Item = K> + '_ {
        let mut cursor = self.front;
        std::iter::from_fn(move || {
            let key = cursor?;
            cursor = self.nodes.get(&key).and_then(|l| l.next);
            Some(key)
        })
    }
}

impl<K: Copy + Eq + Hash> Default for DirectAccessQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut q = DirectAccessQueue::new();
        assert!(q.push(1u64));
        assert!(q.push(2));
        assert!(q.push(3));
        assert!(!q.push(2));
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn test_remove_front_back_and_middle() {
        let mut q = DirectAccessQueue::new();
        for k in 1..=5u64 {
            q.push(k);
        }
        assert!(q.remove(&1));
        assert!(q.remove(&5));
        assert!(q.remove(&3));
        assert!(!q.remove(&3));
        assert_eq!(q.iter().collect::<Vec<_>>(), vec![2, 4]);
        assert_eq!(q.front(), Some(2));
        q.push(1);
        assert_eq!(q.iter().collect::<Vec<_>>(), vec![2, 4, 1]);
        assert!(q.remove(&2));
        assert!(q.remove(&4));
        assert!(q.remove(&1));
        assert_eq!(q.front(), None);
        assert!(q.push(9));
        assert_eq!(q.pop(), Some(9));
    }
}
