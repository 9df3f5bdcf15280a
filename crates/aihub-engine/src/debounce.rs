//! Last-write-wins debouncing driven by the caller's clock.
//!
//! Nothing here sleeps or spawns: the UI loop pushes changes with the
//! current `Instant` and polls on its own tick.

use std::hash::Hash;
use std::time::{Duration, Instant};

use indexmap::IndexMap;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone)]
pub struct Debouncer<T> {
    delay: Duration,
    pending: Option<(T, Instant)>,
}

impl<T> Default for Debouncer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

impl<T> Debouncer<T> {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: None,
        }
    }

    /// Replaces any pending value and restarts the quiet period.
    pub fn push(&mut self, value: T, now: Instant) {
        self.pending = Some((value, now + self.delay));
    }

    /// The pending value once its quiet period has passed.
    pub fn poll(&mut self, now: Instant) -> Option<T> {
        match &self.pending {
            Some((_, due)) if *due <= now => self.pending.take().map(|(value, _)| value),
            _ => None,
        }
    }

    pub fn flush(&mut self) -> Option<T> {
        self.pending.take().map(|(value, _)| value)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

/// One [`Debouncer`] per key; used for per-field value writes.
#[derive(Debug, Clone)]
pub struct KeyedDebouncer<K, V> {
    delay: Duration,
    pending: IndexMap<K, Debouncer<V>>,
}

impl<K: Eq + Hash + Clone, V> Default for KeyedDebouncer<K, V> {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

impl<K: Eq + Hash + Clone, V> KeyedDebouncer<K, V> {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: IndexMap::new(),
        }
    }

    pub fn push(&mut self, key: K, value: V, now: Instant) {
        // re-inserting moves the key to the back so writes keep change order
        let mut timer = self
            .pending
            .shift_remove(&key)
            .unwrap_or_else(|| Debouncer::new(self.delay));
        timer.push(value, now);
        self.pending.insert(key, timer);
    }

    pub fn poll(&mut self, now: Instant) -> Vec<(K, V)> {
        let mut due = Vec::new();
        self.pending.retain(|key, timer| match timer.poll(now) {
            Some(value) => {
                due.push((key.clone(), value));
                false
            }
            None => true,
        });
        due
    }

    pub fn flush(&mut self) -> Vec<(K, V)> {
        self.pending
            .drain(..)
            .filter_map(|(key, mut timer)| timer.flush().map(|value| (key, value)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
