//! Query execution: three-mode fan-out against the store
//!
//! Planned queries run concurrently; within a scan or values query every
//! time bucket fans out as well. All store round-trips pass through the
//! store's concurrency gate, so fan-out width never exceeds the connection
//! pool. Workers honour the cancellation token before each store call and
//! before each merge into the shared aggregator; on cancellation partial
//! results are discarded.

use super::result::{ResultAggregator, ScanResult};
use super::{Query, QueryMode, Results};
use crate::codec::Codec;
use crate::desc::Desc;
use crate::error::{Error, QueryError, Result};
use crate::store::{HashStore, StoreOp, StoreValue};
use crate::types::Resolution;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default `HSCAN` page size
pub const DEFAULT_SCAN_COUNT: usize = 512;

/// Executes batches of planned queries against a hash store
pub struct QueryExecutor {
    store: Arc<dyn HashStore>,
    codec: Codec,
    scan_count: usize,
}

impl QueryExecutor {
    /// Create an executor reading through `store` with `codec`'s key layout
    pub fn new(store: Arc<dyn HashStore>, codec: Codec) -> Self {
        Self {
            store,
            codec,
            scan_count: DEFAULT_SCAN_COUNT,
        }
    }

    /// Override the `HSCAN` page size
    pub fn with_scan_count(mut self, count: usize) -> Self {
        self.scan_count = count;
        self
    }

    /// Execute a batch of planned queries and aggregate their results
    ///
    /// Queries marked with a fatal planning error are skipped; the first
    /// fatal error is returned after the remaining queries have executed.
    /// Soft truncation caps the series list and sets `Results::truncated`.
    pub async fn run(&self, queries: &[Query], token: &CancellationToken) -> Result<Results> {
        let aggregator = ResultAggregator::new();
        let mut first_err: Option<Error> = None;

        let mut runnable = Vec::with_capacity(queries.len());
        for query in queries {
            match &query.error {
                Some(err) if !err.is_soft() => {
                    if first_err.is_none() {
                        first_err = Some(Error::Query(err.clone()));
                    }
                }
                _ => runnable.push(query),
            }
        }

        debug!(total = queries.len(), runnable = runnable.len(), "executing queries");
        let outcomes = join_all(
            runnable
                .iter()
                .map(|query| self.run_one(query, &aggregator, token)),
        )
        .await;
        for outcome in outcomes {
            if let Err(err) = outcome {
                if matches!(err, Error::Cancelled) {
                    return Err(Error::Cancelled);
                }
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }

        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(err) = first_err {
            return Err(err);
        }

        let mut results = aggregator.finish();
        let max_records = queries.iter().map(|q| q.max_records).max().unwrap_or(0);
        if max_records > 0 && results.series.len() > max_records {
            warn!(
                series = results.series.len(),
                max_records, "{}", QueryError::MaxRecordsExceeded
            );
            results.series.truncate(max_records);
            results.truncated = true;
        }
        Ok(results)
    }

    async fn run_one(
        &self,
        query: &Query,
        aggregator: &ResultAggregator,
        token: &CancellationToken,
    ) -> Result<()> {
        let (Some(event), Some(resolution)) = (&query.event, &query.resolution) else {
            return Ok(());
        };
        let desc = event.desc();
        validate(query, desc)?;

        let ts = resolution.time_sequence(query.start, query.end);
        if ts.is_empty() || query.value_filters.is_empty() {
            return Ok(());
        }

        match query.mode {
            QueryMode::Exact => {
                self.run_exact(query, desc, resolution, &ts, aggregator, token)
                    .await
            }
            QueryMode::Scan => {
                let outcomes = join_all(ts.iter().map(|t| {
                    self.scan_bucket(query, desc, resolution, *t, aggregator, token)
                }))
                .await;
                outcomes.into_iter().collect::<Result<()>>()
            }
            QueryMode::Values => {
                let outcomes = join_all(ts.iter().map(|t| {
                    self.values_bucket(query, desc, resolution, *t, aggregator, token)
                }))
                .await;
                outcomes.into_iter().collect::<Result<()>>()
            }
        }
    }

    /// Exact mode: one pipelined `HGET` per `(value filter, bucket)` pair
    ///
    /// A missing field is an empty success and yields a zero-count point.
    async fn run_exact(
        &self,
        query: &Query,
        desc: &Desc,
        resolution: &Resolution,
        ts: &[DateTime<Utc>],
        aggregator: &ResultAggregator,
        token: &CancellationToken,
    ) -> Result<()> {
        let labels = desc.labels();
        let mut ops = Vec::with_capacity(query.value_filters.len() * ts.len());
        for filter in &query.value_filters {
            let field = Codec::field_from_map(labels, filter);
            for t in ts {
                ops.push(StoreOp::HGet {
                    key: self.codec.key(resolution, desc.name(), *t),
                    field: field.clone(),
                });
            }
        }

        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let replies = self.store.exec(ops).await.map_err(Error::Store)?;

        for (i, filter) in query.value_filters.iter().enumerate() {
            for (j, t) in ts.iter().enumerate() {
                if token.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let count = replies.get(i * ts.len() + j).map_or(0, StoreValue::count);
                aggregator.merge(ScanResult {
                    event: desc.name().to_string(),
                    group: query.group.clone(),
                    time: t.timestamp(),
                    labels: filter.clone(),
                    count,
                });
            }
        }
        Ok(())
    }

    /// Scan mode: one gated `HSCAN` per bucket, client-side re-verification
    async fn scan_bucket(
        &self,
        query: &Query,
        desc: &Desc,
        resolution: &Resolution,
        t: DateTime<Utc>,
        aggregator: &ResultAggregator,
        token: &CancellationToken,
    ) -> Result<()> {
        let labels = desc.labels();
        let key = self.codec.key(resolution, desc.name(), t);
        // The pattern is a server-side prefilter; with several value filters
        // it degrades to the unfiltered form and matching happens here.
        let pattern = match query.value_filters.as_slice() {
            [single] => Codec::match_pattern(labels, &query.group, single),
            _ => Codec::match_pattern(labels, &query.group, &HashMap::new()),
        };

        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let pairs = self
            .store
            .hscan(&key, &pattern, self.scan_count)
            .await
            .map_err(Error::Store)?;

        let mut matched = false;
        for (field, raw) in &pairs {
            // Unparseable values are skipped silently
            let Ok(count) = raw.parse::<i64>() else {
                continue;
            };
            for filter in &query.value_filters {
                let candidate = if filter.is_empty() {
                    match Codec::parse_field(field, labels) {
                        Some(parsed) => parsed,
                        None => continue,
                    }
                } else {
                    if !Codec::match_field(field, labels, filter) {
                        continue;
                    }
                    let mut candidate = filter.clone();
                    if !query.group.is_empty() {
                        // Group values are not in the filter; read them off the field
                        if let Some(parsed) = Codec::parse_field(field, labels) {
                            for g in &query.group {
                                if let Some(v) = parsed.get(g) {
                                    candidate.insert(g.clone(), v.clone());
                                }
                            }
                        }
                    }
                    candidate
                };

                matched = true;
                if token.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                aggregator.merge(ScanResult {
                    event: desc.name().to_string(),
                    group: query.group.clone(),
                    time: t.timestamp(),
                    labels: candidate,
                    count,
                });
            }
        }

        if !matched {
            // Callers still observe that the bucket existed
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            aggregator.merge(ScanResult {
                event: desc.name().to_string(),
                group: query.group.clone(),
                time: t.timestamp(),
                labels: HashMap::new(),
                count: 0,
            });
        }
        Ok(())
    }

    /// Values mode: one gated `HGETALL` per bucket, one scan-result per
    /// declared label of each matching non-zero field
    async fn values_bucket(
        &self,
        query: &Query,
        desc: &Desc,
        resolution: &Resolution,
        t: DateTime<Utc>,
        aggregator: &ResultAggregator,
        token: &CancellationToken,
    ) -> Result<()> {
        let labels = desc.labels();
        let key = self.codec.key(resolution, desc.name(), t);

        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let pairs = self.store.hgetall(&key).await.map_err(Error::Store)?;

        for (field, raw) in &pairs {
            let Ok(count) = raw.parse::<i64>() else {
                continue;
            };
            if count == 0 {
                continue;
            }
            let matches = query.value_filters.is_empty()
                || query
                    .value_filters
                    .iter()
                    .any(|f| f.is_empty() || Codec::match_field(field, labels, f));
            if !matches {
                continue;
            }
            let Some(parsed) = Codec::parse_field(field, labels) else {
                continue;
            };
            for label in labels {
                if let Some(value) = parsed.get(label) {
                    if token.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    aggregator.merge(ScanResult {
                        event: desc.name().to_string(),
                        group: query.group.clone(),
                        time: t.timestamp(),
                        labels: HashMap::from([(label.clone(), value.clone())]),
                        count,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Reject hand-built queries referencing undeclared labels
fn validate(query: &Query, desc: &Desc) -> Result<()> {
    for filter in &query.value_filters {
        if filter.keys().any(|label| !desc.has_label(label)) {
            return Err(QueryError::InvalidEventLabel.into());
        }
    }
    if query.group.iter().any(|g| !desc.has_label(g)) {
        return Err(QueryError::InvalidGroupLabel.into());
    }
    Ok(())
}
