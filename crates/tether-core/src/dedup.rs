//! A bounded LRU hash-set: used both by the Tailer (event-log line
//! dedup, cap 10 000) and by the Router (cross-source message dedup).
//! Spec calls for this to be a dedicated value type rather than an
//! ad-hoc pair of collections, since both the set membership and the
//! eviction order need to stay in lockstep.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

pub struct LruHashSet<T> {
    cap: usize,
    set: HashSet<T>,
    order: VecDeque<T>,
}

impl<T> LruHashSet<T>
where
    T: Eq + Hash + Clone,
{
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            set: HashSet::with_capacity(cap.min(1024)),
            order: VecDeque::with_capacity(cap.min(1024)),
        }
    }

    /// Returns `true` if `key` was already present (i.e. a duplicate).
    /// Otherwise inserts it, evicting the oldest entry if over capacity.
    pub fn check_and_insert(&mut self, key: T) -> bool {
        if self.set.contains(&key) {
            return true;
        }
        self.set.insert(key.clone());
        self.order.push_back(key);
        if self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        false
    }

    pub fn contains(&self, key: &T) -> bool {
        self.set.contains(key)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_insert_is_not_a_duplicate() {
        let mut s = LruHashSet::new(10);
        assert!(!s.check_and_insert("a"));
        assert!(s.check_and_insert("a"));
    }

    #[test]
    fn eviction_at_cap_allows_reinsertion() {
        let mut s = LruHashSet::new(3);
        for k in ["a", "b", "c"] {
            assert!(!s.check_and_insert(k));
        }
        // pushes "a" out
        assert!(!s.check_and_insert("d"));
        assert!(!s.contains(&"a"));
        // re-inserting "a" is no longer a duplicate
        assert!(!s.check_and_insert("a"));
    }

    #[test]
    fn cap_of_ten_thousand_evicts_oldest_first() {
        let mut s = LruHashSet::new(10_000);
        for i in 0..10_001u32 {
            s.check_and_insert(i);
        }
        assert!(!s.contains(&0));
        assert!(s.contains(&10_000));
        assert_eq!(s.len(), 10_000);
        // oldest survivor (1) is still present and re-insertion is a duplicate
        assert!(s.check_and_insert(1));
    }
}
