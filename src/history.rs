//! Fixed-capacity FIFO history.
//!
//! Used for both per-scene image rounds (capacity 5) and per-project undo
//! snapshots (capacity 3). Appending past capacity evicts exactly one entry from
//! the front; callers that own resources behind an entry receive it back (or via
//! the eviction hook) so they can release them.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedHistory<T, const N: usize> {
    items: VecDeque<T>,
}

impl<T, const N: usize> Default for BoundedHistory<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> BoundedHistory<T, N> {
    pub const CAPACITY: usize = N;

    pub fn new() -> Self {
        Self {
            items: VecDeque::with_capacity(N + 1),
        }
    }

    /// Appends `item`, returning the oldest entry if the append pushed the
    /// history over capacity. At most one entry is evicted per call.
    pub fn push(&mut self, item: T) -> Option<T> {
        self.items.push_back(item);
        if self.items.len() > N {
            self.items.pop_front()
        } else {
            None
        }
    }

    /// Same as [`push`](Self::push) but hands the evicted entry to `on_evict`.
    pub fn push_with<F>(&mut self, item: T, on_evict: F)
    where
        F: FnOnce(T),
    {
        if let Some(evicted) = self.push(item) {
            on_evict(evicted);
        }
    }

    /// Removes and returns the most recent entry.
    pub fn pop_latest(&mut self) -> Option<T> {
        self.items.pop_back()
    }

    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    pub fn into_vec(self) -> Vec<T> {
        self.items.into()
    }
}

impl<T, const N: usize> From<Vec<T>> for BoundedHistory<T, N> {
    /// Keeps every entry as given; capacity is enforced on the next push.
    fn from(items: Vec<T>) -> Self {
        Self {
            items: items.into(),
        }
    }
}

impl<'a, T, const N: usize> IntoIterator for &'a BoundedHistory<T, N> {
    type Item = &'a T;
    type IntoIter = std::collections::vec_deque::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl<T: Serialize, const N: usize> Serialize for BoundedHistory<T, N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.items.iter())
    }
}

impl<'de, T: Deserialize<'de>, const N: usize> Deserialize<'de> for BoundedHistory<T, N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<T>::deserialize(deserializer).map(Self::from)
    }
}
