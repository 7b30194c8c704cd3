//! Concurrent in-memory counter table
//!
//! Maps label-value tuples to 64-bit counters at high write rates. The
//! table is a slice of entries plus a `hash → entry indices` index; hash
//! collisions are resolved by value equality within the bucket list.
//!
//! Entry slots are stable: once created, an entry keeps its index for the
//! lifetime of the table, so a reader that located an entry under the shared
//! lock can bump its counter with a single atomic add. Only [`CounterTable::pack`]
//! renumbers slots, and it holds the exclusive lock while doing so.
//!
//! # Example
//!
//! ```rust
//! use meterdb::counters::CounterTable;
//!
//! let table = CounterTable::new(2);
//! assert_eq!(table.add(1, &["a", "b"]), 1);
//! assert_eq!(table.add(2, &["a", "b"]), 3);
//! // Missing trailing values are empty strings
//! assert_eq!(table.add(1, &["a"]), table.get(&["a", ""]));
//! ```

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::atomic::{AtomicI64, Ordering};

/// One flushed counter observation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Label values in declared order, padded to the table width
    pub values: Vec<String>,
    /// Counter value observed (and reset) by the flush
    pub count: i64,
}

/// Ordered sequence of flushed counters
///
/// Order is unspecified but stable for a given call.
pub type Snapshot = Vec<SnapshotEntry>;

#[derive(Debug)]
struct Entry {
    values: Vec<String>,
    count: AtomicI64,
}

#[derive(Default, Debug)]
struct Table {
    entries: Vec<Entry>,
    index: HashMap<u64, Vec<usize>>,
}

impl Table {
    fn find(&self, hash: u64, values: &[&str]) -> Option<usize> {
        self.index.get(&hash)?.iter().copied().find(|&i| {
            self.entries[i]
                .values
                .iter()
                .map(String::as_str)
                .eq(values.iter().copied())
        })
    }

    fn insert(&mut self, hash: u64, values: &[&str], count: i64) -> usize {
        let idx = self.entries.len();
        self.entries.push(Entry {
            values: values.iter().map(|v| v.to_string()).collect(),
            count: AtomicI64::new(count),
        });
        self.index.entry(hash).or_default().push(idx);
        idx
    }
}

/// Concurrent mapping from label-value tuples to signed 64-bit counters
#[derive(Debug)]
pub struct CounterTable {
    width: usize,
    inner: RwLock<Table>,
}

impl CounterTable {
    /// Create a table for tuples of `width` label values
    pub fn new(width: usize) -> Self {
        Self {
            width,
            inner: RwLock::new(Table::default()),
        }
    }

    /// Number of declared label positions
    pub fn width(&self) -> usize {
        self.width
    }

    /// Add `delta` to the counter for `values` and return the new count
    ///
    /// Values beyond the table width are ignored; missing trailing values
    /// are treated as empty strings. The fast path on an existing entry is
    /// one shared-lock acquisition and one atomic add.
    pub fn add(&self, delta: i64, values: &[&str]) -> i64 {
        let values = self.normalize(values);
        let hash = hash_values(&values);
        {
            let table = self.inner.read();
            if let Some(i) = table.find(hash, &values) {
                return table.entries[i].count.fetch_add(delta, Ordering::Relaxed) + delta;
            }
        }
        let mut table = self.inner.write();
        // Re-check: another writer may have created the entry
        if let Some(i) = table.find(hash, &values) {
            return table.entries[i].count.fetch_add(delta, Ordering::Relaxed) + delta;
        }
        table.insert(hash, &values, delta);
        delta
    }

    /// Current count for `values` without mutating the table
    pub fn get(&self, values: &[&str]) -> i64 {
        let values = self.normalize(values);
        let hash = hash_values(&values);
        let table = self.inner.read();
        match table.find(hash, &values) {
            Some(i) => table.entries[i].count.load(Ordering::Relaxed),
            None => 0,
        }
    }

    /// Number of entries, including entries whose counter is zero
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// True when the table holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically drain every non-zero counter into `into`
    ///
    /// Each entry is swapped with zero independently; the snapshot is a set
    /// of per-entry atomic observations, not a cross-entry consistent cut.
    pub fn flush(&self, mut into: Snapshot) -> Snapshot {
        let table = self.inner.read();
        for entry in &table.entries {
            let count = entry.count.swap(0, Ordering::Relaxed);
            if count != 0 {
                into.push(SnapshotEntry {
                    values: entry.values.clone(),
                    count,
                });
            }
        }
        into
    }

    /// Add a snapshot back into the table, creating entries as needed
    ///
    /// Inverse of [`CounterTable::flush`]: flush followed by merge leaves
    /// counters unchanged modulo concurrent adds.
    pub fn merge(&self, snapshot: &Snapshot) {
        for entry in snapshot {
            let values: Vec<&str> = entry.values.iter().map(String::as_str).collect();
            self.add(entry.count, &values);
        }
    }

    /// Rebuild the index, discarding zero-count entries and reclaiming slots
    ///
    /// Runs under the exclusive lock; no `add` may be in flight, and entry
    /// indices are renumbered.
    pub fn pack(&self) {
        let mut table = self.inner.write();
        let old = std::mem::take(&mut *table);
        for entry in old.entries {
            if entry.count.load(Ordering::Relaxed) != 0 {
                let idx = table.entries.len();
                let hash = {
                    let values: Vec<&str> = entry.values.iter().map(String::as_str).collect();
                    hash_values(&values)
                };
                table.index.entry(hash).or_default().push(idx);
                table.entries.push(entry);
            }
        }
    }

    fn normalize<'a>(&self, values: &[&'a str]) -> Vec<&'a str> {
        (0..self.width)
            .map(|i| values.get(i).copied().unwrap_or(""))
            .collect()
    }
}

/// Stable 64-bit hash over the length-prefixed value bytes
fn hash_values(values: &[&str]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for value in values {
        let bytes = value.as_bytes();
        let len = bytes.len().min(255);
        hasher.write_u8(len as u8);
        hasher.write(&bytes[..len]);
    }
    hasher.finish()
}
