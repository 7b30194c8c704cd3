//! Events: a descriptor paired with its counter table

use crate::counters::{CounterTable, Snapshot};
use crate::desc::Desc;

/// A registered event accumulating labelled counts in memory
///
/// # Example
///
/// ```rust
/// use meterdb::desc::Desc;
/// use meterdb::event::Event;
/// use meterdb::types::Resolution;
///
/// let desc = Desc::counter("requests", vec!["method".into(), "status".into()],
///     vec![Resolution::hourly()]);
/// let event = Event::new(desc);
/// assert_eq!(event.add(1, &["GET", "200"]), 1);
/// assert_eq!(event.add(1, &["GET", "200"]), 2);
/// ```
#[derive(Debug)]
pub struct Event {
    desc: Desc,
    counters: CounterTable,
}

impl Event {
    /// Create an event from its descriptor
    pub fn new(desc: Desc) -> Self {
        let counters = CounterTable::new(desc.labels().len());
        Self { desc, counters }
    }

    /// Event descriptor
    pub fn desc(&self) -> &Desc {
        &self.desc
    }

    /// Canonical event name
    pub fn name(&self) -> &str {
        self.desc.name()
    }

    /// Add `delta` to the counter for `values`, returning the new count
    pub fn add(&self, delta: i64, values: &[&str]) -> i64 {
        self.counters.add(delta, values)
    }

    /// Current count for `values`
    pub fn get(&self, values: &[&str]) -> i64 {
        self.counters.get(values)
    }

    /// Number of counter entries
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// True when the event holds no counter entries
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Drain non-zero counters into `into`
    pub fn flush(&self, into: Snapshot) -> Snapshot {
        self.counters.flush(into)
    }

    /// Add a snapshot back (inverse of flush)
    pub fn merge(&self, snapshot: &Snapshot) {
        self.counters.merge(snapshot)
    }

    /// Reclaim zero-count entries
    pub fn pack(&self) {
        self.counters.pack()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::SnapshotEntry;
    use crate::types::Resolution;

    fn test_event() -> Event {
        Event::new(Desc::counter(
            "foo",
            vec!["bar".into(), "baz".into()],
            vec![Resolution::daily()],
        ))
    }

    #[test]
    fn test_add_flush_merge_cycle() {
        let event = test_event();
        event.add(1, &["BAR", "BAZ"]);
        event.add(1, &["BAR", "BAZ"]);
        assert_eq!(event.len(), 1);

        let snapshot = event.flush(Snapshot::new());
        assert_eq!(
            snapshot,
            vec![SnapshotEntry {
                values: vec!["BAR".into(), "BAZ".into()],
                count: 2,
            }]
        );
        assert_eq!(event.get(&["BAR", "BAZ"]), 0);

        event.merge(&snapshot);
        event.add(1, &["BAR", "BAZ"]);
        assert_eq!(event.get(&["BAR", "BAZ"]), 3);
    }

    #[test]
    fn test_pack_after_flush_empties_event() {
        let event = test_event();
        event.add(1, &["BAR", "BAZ"]);
        event.flush(Snapshot::new());
        event.pack();
        assert_eq!(event.len(), 0);
        assert!(event.is_empty());
    }
}
