//! Utilities used in the protocol implementation.

use std::collections::BTreeMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rand::Rng;

/// A hash set where the iteration order of the values is independent of their
/// hash values, with utilities to randomly select elements.
#[derive(Debug, Clone)]
pub(crate) struct IndexSet<T> {
    inner: indexmap::IndexSet<T>,
}

impl<T> Default for IndexSet<T> {
    fn default() -> Self {
        Self {
            inner: Default::default(),
        }
    }
}

impl<T: Hash + Eq> IndexSet<T> {
    pub fn insert(&mut self, value: T) -> bool {
        self.inner.insert(value)
    }

    /// Remove an element from the set.
    ///
    /// NOTE: the value is removed by swapping it with the last element of the
    /// set and popping it off. **This modifies the order of elements.**
    pub fn remove(&mut self, value: &T) -> Option<T> {
        self.inner.swap_remove_full(value).map(|(_i, v)| v)
    }

    pub fn contains(&self, value: &T) -> bool {
        self.inner.contains(value)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.inner.iter()
    }
}

impl<T: Hash + Eq + Clone> IndexSet<T> {
    /// All elements in random order, shortened to the first `len` after
    /// shuffling.
    pub fn shuffled_and_capped<R: Rng + ?Sized>(&self, len: usize, rng: &mut R) -> Vec<T> {
        let mut items: Vec<_> = self.inner.iter().cloned().collect();
        items.shuffle(rng);
        items.truncate(len);
        items
    }

    /// Elements in random order while omitting those in `without`, shortened
    /// to the first `len`.
    pub fn shuffled_without_and_capped<R: Rng + ?Sized>(
        &self,
        without: &[&T],
        len: usize,
        rng: &mut R,
    ) -> Vec<T> {
        let mut items: Vec<_> = self
            .inner
            .iter()
            .filter(|x| !without.contains(x))
            .cloned()
            .collect();
        items.shuffle(rng);
        items.truncate(len);
        items
    }
}

impl<T: Hash + Eq> FromIterator<T> for IndexSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iterable: I) -> Self {
        IndexSet {
            inner: indexmap::IndexSet::from_iter(iterable),
        }
    }
}

/// A [`BTreeMap`] with [`Instant`] as key. Allows to process expired items.
#[derive(Debug)]
pub struct TimerMap<T>(BTreeMap<Instant, Vec<T>>);

impl<T> Default for TimerMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerMap<T> {
    /// Create a new, empty TimerMap.
    pub fn new() -> Self {
        Self(Default::default())
    }

    /// Insert a new entry at the specified instant.
    pub fn insert(&mut self, instant: Instant, item: T) {
        let entry = self.0.entry(instant).or_default();
        entry.push(item);
    }

    /// Remove and return all entries before and equal to `from`.
    pub fn drain_until(&mut self, from: &Instant) -> impl Iterator<Item = (Instant, T)> {
        let split_point = *from + Duration::from_nanos(1);
        let later_half = self.0.split_off(&split_point);
        let expired = std::mem::replace(&mut self.0, later_half);
        expired
            .into_iter()
            .flat_map(|(t, v)| v.into_iter().map(move |v| (t, v)))
    }

    /// The deadline of the earliest entry, if any.
    pub fn first(&self) -> Option<&Instant> {
        self.0.keys().next()
    }

    /// Whether no timers are queued.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_map_drains_in_order() {
        let mut map = TimerMap::new();
        let now = Instant::now();
        map.insert(now + Duration::from_millis(10), "b");
        map.insert(now, "a");
        map.insert(now + Duration::from_millis(20), "c");

        let drained: Vec<_> = map
            .drain_until(&(now + Duration::from_millis(10)))
            .map(|(_, v)| v)
            .collect();
        assert_eq!(drained, vec!["a", "b"]);
        assert_eq!(map.first(), Some(&(now + Duration::from_millis(20))));
    }

    #[test]
    fn shuffled_and_capped_respects_cap() {
        let set: IndexSet<u32> = (0..10).collect();
        let mut rng = rand::thread_rng();
        let picked = set.shuffled_and_capped(4, &mut rng);
        assert_eq!(picked.len(), 4);
        let picked = set.shuffled_and_capped(20, &mut rng);
        assert_eq!(picked.len(), 10);
    }
}
