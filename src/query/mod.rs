//! Declarative queries over gathered counters
//!
//! A [`QueryBuilder`] describes what to read (events, range, resolution,
//! filters, grouping); the planner turns it into one [`Query`] per event
//! and the [`QueryExecutor`] fans the planned queries out against the
//! store.
//!
//! # Example
//!
//! ```rust
//! use meterdb::query::QueryBuilder;
//! use chrono::Utc;
//!
//! let now = Utc::now();
//! let builder = QueryBuilder::new()
//!     .from_events(["requests"])
//!     .between(now, now)
//!     .at("hourly")
//!     .where_("method", ["GET", "POST"])
//!     .group_by(["status"]);
//! assert_eq!(builder.events, vec!["requests"]);
//! ```

pub mod executor;
pub mod planner;
pub mod result;

pub use executor::QueryExecutor;
pub use planner::permutations;
pub use result::{EventSeries, ResultAggregator, Results};

use crate::error::QueryError;
use crate::event::Event;
use crate::types::Resolution;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// Query execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryMode {
    /// Server-side pattern scan over bucket fields
    #[default]
    Scan,
    /// Exact point lookups pipelined per query
    Exact,
    /// Per-label value enumeration over whole buckets
    Values,
}

impl QueryMode {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryMode::Scan => "scan",
            QueryMode::Exact => "exact",
            QueryMode::Values => "values",
        }
    }

    /// Parse a mode name; unknown names fall back to scan
    pub fn parse(s: &str) -> Self {
        match s {
            "exact" => QueryMode::Exact,
            "values" => QueryMode::Values,
            _ => QueryMode::Scan,
        }
    }
}

/// Declarative query specification, one per batch of events
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    /// Event names to query
    pub events: Vec<String>,
    /// Execution mode
    pub mode: QueryMode,
    /// Range start (inclusive, rounded to the resolution step)
    pub start: DateTime<Utc>,
    /// Range end (inclusive, rounded to the resolution step)
    pub end: DateTime<Utc>,
    /// Labels defining series identity in scan mode
    pub group: Vec<String>,
    /// Candidate values per label; expanded to their cartesian product
    pub filters: HashMap<String, Vec<String>>,
    /// Resolution name, resolved against each event's descriptor
    pub resolution: String,
    /// Soft cap on returned series; zero disables
    pub max_records: usize,
}

impl Default for QueryBuilder {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            mode: QueryMode::default(),
            start: DateTime::UNIX_EPOCH,
            end: DateTime::UNIX_EPOCH,
            group: Vec::new(),
            filters: HashMap::new(),
            resolution: String::new(),
            max_records: 0,
        }
    }
}

impl QueryBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the queried events
    pub fn from_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.events = events.into_iter().map(Into::into).collect();
        self
    }

    /// Set the time range
    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    /// Set the resolution by name
    pub fn at(mut self, resolution: impl Into<String>) -> Self {
        self.resolution = resolution.into();
        self
    }

    /// Constrain a label to a set of candidate values
    pub fn where_<I, S>(mut self, label: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filters
            .insert(label.into(), values.into_iter().map(Into::into).collect());
        self
    }

    /// Group series by the given labels; implies scan mode
    pub fn group_by<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group = labels.into_iter().map(Into::into).collect();
        self.mode = QueryMode::Scan;
        self
    }

    /// Switch to exact point lookups
    pub fn exact(mut self) -> Self {
        self.mode = QueryMode::Exact;
        self
    }

    /// Switch to value enumeration
    pub fn values(mut self) -> Self {
        self.mode = QueryMode::Values;
        self
    }

    /// Set the soft series cap
    pub fn max_records(mut self, max: usize) -> Self {
        self.max_records = max;
        self
    }
}

/// One planned query, bound to a resolved event
///
/// A planning failure is carried on the query itself: the error marks the
/// query as skipped without aborting siblings in the same batch.
#[derive(Clone)]
pub struct Query {
    /// Resolved event; absent when planning failed before resolution
    pub event: Option<Arc<Event>>,
    /// Execution mode
    pub mode: QueryMode,
    /// Range start
    pub start: DateTime<Utc>,
    /// Range end
    pub end: DateTime<Utc>,
    /// Grouping labels
    pub group: Vec<String>,
    /// Resolved resolution
    pub resolution: Option<Resolution>,
    /// Expanded value filters; one store probe set per map
    pub value_filters: Vec<HashMap<String, String>>,
    /// Soft cap on returned series; zero disables
    pub max_records: usize,
    /// Planning error, if any
    pub error: Option<QueryError>,
}

impl Query {
    pub(crate) fn unplanned(builder: &QueryBuilder) -> Self {
        Self {
            event: None,
            mode: builder.mode,
            start: builder.start,
            end: builder.end,
            group: builder.group.clone(),
            resolution: None,
            value_filters: Vec::new(),
            max_records: builder.max_records,
            error: None,
        }
    }

    pub(crate) fn with_error(mut self, error: QueryError) -> Self {
        self.error = Some(error);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_names() {
        assert_eq!(QueryMode::Scan.as_str(), "scan");
        assert_eq!(QueryMode::parse("exact"), QueryMode::Exact);
        assert_eq!(QueryMode::parse("values"), QueryMode::Values);
        assert_eq!(QueryMode::parse("anything"), QueryMode::Scan);
    }

    #[test]
    fn test_builder_chains() {
        let now = Utc::now();
        let b = QueryBuilder::new()
            .from_events(["a", "b"])
            .between(now, now)
            .at("daily")
            .where_("foo", ["x"])
            .max_records(10);
        assert_eq!(b.events, vec!["a", "b"]);
        assert_eq!(b.resolution, "daily");
        assert_eq!(b.filters["foo"], vec!["x"]);
        assert_eq!(b.max_records, 10);
    }

    #[test]
    fn test_group_by_implies_scan() {
        let b = QueryBuilder::new().exact().group_by(["foo"]);
        assert_eq!(b.mode, QueryMode::Scan);
        assert_eq!(b.group, vec!["foo"]);
    }
}
