//! Bounded most-recent-first buffer of observed events.
//!
//! Display-only (the ticker): never the reconciliation source of
//! truth. Inserting beyond capacity evicts exactly the oldest entry.

use std::collections::{HashSet, VecDeque};

use crate::types::Event;

pub const DEFAULT_CAPACITY: usize = 150;

#[derive(Debug, Clone)]
pub struct EventBuffer {
    events: VecDeque<Event>,
    seen: HashSet<String>,
    capacity: usize,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            seen: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Insert at the front. Duplicates (same event id) are discarded.
    /// Returns true if the event was inserted.
    pub fn push(&mut self, event: Event) -> bool {
        if !self.seen.insert(event.id.clone()) {
            return false;
        }
        self.events.push_front(event);
        if self.events.len() > self.capacity {
            if let Some(evicted) = self.events.pop_back() {
                self.seen.remove(&evicted.id);
            }
        }
        true
    }

    /// Most-recent-first iteration.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    /// Owned copy for handing to the rendering layer.
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
