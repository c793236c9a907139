//! Working set of known events for one session.
//!
//! Keyed by event id and kept in arrival order. Incremental events are merged
//! (first copy wins), snapshots replace the whole set.

use indexmap::IndexMap;
use ragwatch_protocol::{EventId, ProcessEvent};

use crate::timeline::{SessionTimeline, aggregate};

#[derive(Debug, Clone, Default)]
pub struct EventSet {
    events: IndexMap<EventId, ProcessEvent>,
}

impl EventSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one incremental event. Returns `false` when the id was already known.
    pub fn insert(&mut self, event: ProcessEvent) -> bool {
        if self.events.contains_key(&event.event_id) {
            return false;
        }
        self.events.insert(event.event_id.clone(), event);
        true
    }

    /// Replace the whole set with a bulk snapshot. Duplicate ids inside the
    /// snapshot collapse to their first copy.
    pub fn replace<I>(&mut self, snapshot: I)
    where
        I: IntoIterator<Item = ProcessEvent>,
    {
        self.events.clear();
        for event in snapshot {
            self.insert(event);
        }
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn contains(&self, event_id: &EventId) -> bool {
        self.events.contains_key(event_id)
    }

    /// Events in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &ProcessEvent> {
        self.events.values()
    }

    pub fn timeline(&self) -> SessionTimeline {
        aggregate(self.events.values())
    }
}

impl FromIterator<ProcessEvent> for EventSet {
    fn from_iter<T: IntoIterator<Item = ProcessEvent>>(iter: T) -> Self {
        let mut set = Self::new();
        for event in iter {
            set.insert(event);
        }
        set
    }
}
