//! In-process event registry

use crate::error::{Error, Result};
use crate::event::Event;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Concurrent `name → Event` lookup with duplicate rejection
#[derive(Default)]
pub struct Registry {
    events: DashMap<String, Arc<Event>>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an event under its descriptor name
    ///
    /// Returns the shared handle on success; a second registration under the
    /// same name fails and leaves the registry unchanged.
    pub fn register(&self, event: Event) -> Result<Arc<Event>> {
        let name = event.name().to_string();
        match self.events.entry(name) {
            Entry::Occupied(occupied) => Err(Error::DuplicateEvent(occupied.key().clone())),
            Entry::Vacant(vacant) => {
                let event = Arc::new(event);
                vacant.insert(Arc::clone(&event));
                Ok(event)
            }
        }
    }

    /// Look up an event by name
    pub fn get(&self, name: &str) -> Option<Arc<Event>> {
        self.events.get(name).map(|e| Arc::clone(&e))
    }

    /// Visit every registered event
    pub fn each(&self, mut f: impl FnMut(&str, &Arc<Event>)) {
        for entry in self.events.iter() {
            f(entry.key(), entry.value());
        }
    }

    /// Names of all registered events
    pub fn names(&self) -> Vec<String> {
        self.events.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of registered events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True when no events are registered
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
