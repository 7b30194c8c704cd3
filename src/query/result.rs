//! Result aggregation
//!
//! Scan workers emit per-bucket per-field scan results in arbitrary order;
//! the aggregator merges them under a single mutex into unique
//! `(event, labels)` series. Data points are sorted by time once all
//! workers have quiesced.

use crate::error::QueryError;
use crate::types::{DataPoint, DataPoints};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One intermediate per-bucket per-field observation
#[derive(Debug, Clone)]
pub(crate) struct ScanResult {
    pub event: String,
    pub group: Vec<String>,
    pub time: i64,
    pub labels: HashMap<String, String>,
    pub count: i64,
}

/// One output series, identified by `(event, labels)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSeries {
    /// Event name
    pub event: String,
    /// Label values identifying the series
    pub labels: HashMap<String, String>,
    /// Data points ordered by time
    pub data: DataPoints,
    /// Sum of all merged counts
    pub total: i64,
}

/// Aggregated query output
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Results {
    /// Output series; no two share the same `(event, labels)`
    pub series: Vec<EventSeries>,
    /// True when the series list was cut at the query's record budget
    #[serde(default)]
    pub truncated: bool,
}

impl Results {
    /// Position of the series for `(event, labels)`, if any
    ///
    /// Label maps are equal iff they hold the same keys and values.
    pub fn index_of(&self, event: &str, labels: &HashMap<String, String>) -> Option<usize> {
        self.series
            .iter()
            .position(|s| s.event == event && &s.labels == labels)
    }

    /// The series for `(event, labels)`, if any
    pub fn find(&self, event: &str, labels: &HashMap<String, String>) -> Option<&EventSeries> {
        self.index_of(event, labels).map(|i| &self.series[i])
    }

    /// Fold series into a per-label value frequency map
    ///
    /// Values-mode series carry a single label each, so the fold yields
    /// `label → value → total count`.
    pub fn frequency_map(&self) -> HashMap<String, HashMap<String, i64>> {
        let mut out: HashMap<String, HashMap<String, i64>> = HashMap::new();
        for series in &self.series {
            for (label, value) in &series.labels {
                *out.entry(label.clone())
                    .or_default()
                    .entry(value.clone())
                    .or_insert(0) += series.total;
            }
        }
        out
    }

    /// The soft truncation error, when the record budget was exceeded
    pub fn truncation_error(&self) -> Option<QueryError> {
        self.truncated.then_some(QueryError::MaxRecordsExceeded)
    }
}

/// Mutex-guarded merge target shared by all query workers
#[derive(Default)]
pub struct ResultAggregator {
    inner: Mutex<Vec<EventSeries>>,
}

impl ResultAggregator {
    /// Create an empty aggregator
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn merge(&self, result: ScanResult) {
        // Grouping projects the candidate labels onto the group set
        let labels = if result.group.is_empty() {
            result.labels
        } else {
            result
                .group
                .iter()
                .filter_map(|g| result.labels.get(g).map(|v| (g.clone(), v.clone())))
                .collect()
        };

        let mut series = self.inner.lock();
        let found = series
            .iter()
            .position(|s| s.event == result.event && s.labels == labels);
        match found {
            Some(i) => {
                let series = &mut series[i];
                series.total += result.count;
                match series.data.index_of(result.time) {
                    Some(j) => series.data[j].count += result.count,
                    None => series.data.push(DataPoint {
                        ts: result.time,
                        count: result.count,
                    }),
                }
            }
            None => series.push(EventSeries {
                event: result.event,
                labels,
                data: DataPoints(vec![DataPoint {
                    ts: result.time,
                    count: result.count,
                }]),
                total: result.count,
            }),
        }
    }

    /// Finalise: sort every series' points ascending by time
    pub fn finish(self) -> Results {
        let mut series = self.inner.into_inner();
        for s in &mut series {
            s.data.sort_by_time();
        }
        Results {
            series,
            truncated: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn scan(event: &str, group: &[&str], time: i64, lv: &[(&str, &str)], count: i64) -> ScanResult {
        ScanResult {
            event: event.into(),
            group: group.iter().map(|g| g.to_string()).collect(),
            time,
            labels: labels(lv),
            count,
        }
    }

    #[test]
    fn test_merge_new_series_and_points() {
        let agg = ResultAggregator::new();
        agg.merge(scan("e", &[], 20, &[("foo", "a")], 1));
        agg.merge(scan("e", &[], 10, &[("foo", "a")], 2));
        agg.merge(scan("e", &[], 10, &[("foo", "b")], 5));

        let results = agg.finish();
        assert_eq!(results.series.len(), 2);
        let a = results.find("e", &labels(&[("foo", "a")])).unwrap();
        // Sorted ascending after finish
        assert_eq!(a.data.0, vec![
            DataPoint { ts: 10, count: 2 },
            DataPoint { ts: 20, count: 1 },
        ]);
        assert_eq!(a.total, 3);
    }

    #[test]
    fn test_merge_same_timestamp_adds_counts() {
        let agg = ResultAggregator::new();
        agg.merge(scan("e", &[], 10, &[("foo", "a")], 1));
        agg.merge(scan("e", &[], 10, &[("foo", "a")], 4));
        let results = agg.finish();
        assert_eq!(results.series.len(), 1);
        assert_eq!(results.series[0].data.0, vec![DataPoint { ts: 10, count: 5 }]);
        assert_eq!(results.series[0].total, 5);
    }

    #[test]
    fn test_merge_projects_candidate_labels_onto_group() {
        let agg = ResultAggregator::new();
        agg.merge(scan("e", &["foo"], 10, &[("foo", "a"), ("bar", "1")], 1));
        agg.merge(scan("e", &["foo"], 10, &[("foo", "a"), ("bar", "2")], 1));
        agg.merge(scan("e", &["foo"], 10, &[("foo", "b"), ("bar", "1")], 1));

        let results = agg.finish();
        assert_eq!(results.series.len(), 2);
        assert_eq!(results.find("e", &labels(&[("foo", "a")])).unwrap().total, 2);
        assert_eq!(results.find("e", &labels(&[("foo", "b")])).unwrap().total, 1);
    }

    #[test]
    fn test_series_identity_includes_event() {
        let agg = ResultAggregator::new();
        agg.merge(scan("e1", &[], 10, &[("foo", "a")], 1));
        agg.merge(scan("e2", &[], 10, &[("foo", "a")], 1));
        assert_eq!(agg.finish().series.len(), 2);
    }

    #[test]
    fn test_frequency_map() {
        let agg = ResultAggregator::new();
        agg.merge(scan("e", &[], 10, &[("foo", "a")], 3));
        agg.merge(scan("e", &[], 10, &[("bar", "1")], 1));
        agg.merge(scan("e", &[], 10, &[("bar", "2")], 2));

        let freq = agg.finish().frequency_map();
        assert_eq!(freq["foo"]["a"], 3);
        assert_eq!(freq["bar"]["1"], 1);
        assert_eq!(freq["bar"]["2"], 2);
    }

    #[test]
    fn test_truncation_error() {
        let mut results = Results::default();
        assert!(results.truncation_error().is_none());
        results.truncated = true;
        assert_eq!(results.truncation_error(), Some(QueryError::MaxRecordsExceeded));
    }
}
