//! Core data types used throughout the metrics engine
//!
//! # Key Types
//!
//! - **`MetricType`**: how flushed counters are applied to the store
//! - **`Resolution`**: a named time-bucketing policy (step, TTL, layout)
//! - **`DataPoint`** / **`DataPoints`**: `(unix-seconds, count)` series data
//!
//! # Example
//!
//! ```rust
//! use meterdb::types::Resolution;
//! use chrono::{TimeZone, Utc};
//!
//! let hourly = Resolution::hourly();
//! let t = Utc.with_ymd_and_hms(2023, 4, 2, 11, 37, 5).unwrap();
//! assert_eq!(hourly.marshal_time(t), "2023-04-02-11");
//!
//! // Two instants in the same bucket round to the same time
//! let t2 = Utc.with_ymd_and_hms(2023, 4, 2, 11, 59, 59).unwrap();
//! assert_eq!(hourly.round_time(t), hourly.round_time(t2));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use std::time::Duration;

/// How flushed counter snapshots are applied to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricType {
    /// Counts are added into the stored field (`HINCRBY`); recoverable on
    /// pipeline failure by merging the snapshot back.
    Increment,
    /// Counts overwrite the stored field (`HSET`)
    Update,
    /// Counts are written only if the field is absent (`HSETNX`)
    UpdateOnce,
}

impl MetricType {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Increment => "increment",
            MetricType::Update => "update",
            MetricType::UpdateOnce => "update_once",
        }
    }
}

/// A single series measurement: unix-second timestamp and counter value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Bucket timestamp in unix seconds
    pub ts: i64,
    /// Counter value for the bucket
    pub count: i64,
}

/// Time-ordered sequence of data points belonging to one series
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataPoints(pub Vec<DataPoint>);

impl DataPoints {
    /// Position of the point at `ts`, if any
    pub fn index_of(&self, ts: i64) -> Option<usize> {
        self.0.iter().position(|p| p.ts == ts)
    }

    /// Sort points ascending by timestamp
    pub fn sort_by_time(&mut self) {
        self.0.sort_by_key(|p| p.ts);
    }

    /// Sum of all point values
    pub fn total(&self) -> i64 {
        self.0.iter().map(|p| p.count).sum()
    }
}

impl Deref for DataPoints {
    type Target = Vec<DataPoint>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for DataPoints {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// A named time-bucketing policy
///
/// Two instants belong to the same bucket iff their step-floored timestamps
/// are equal. `marshal_time` always formats the *rounded* time, so the
/// marshalled string identifies the bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    name: String,
    step: Duration,
    ttl: Duration,
    layout: String,
}

impl Resolution {
    /// Create a resolution with an explicit step, TTL and chrono layout
    pub fn new(
        name: impl Into<String>,
        step: Duration,
        ttl: Duration,
        layout: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            step,
            ttl,
            layout: layout.into(),
        }
    }

    /// One-minute buckets, 24h TTL
    pub fn minutely() -> Self {
        Self::new(
            "minutely",
            Duration::from_secs(60),
            Duration::from_secs(24 * 3600),
            "%Y-%m-%d-%H-%M",
        )
    }

    /// One-hour buckets, 7-day TTL
    pub fn hourly() -> Self {
        Self::new(
            "hourly",
            Duration::from_secs(3600),
            Duration::from_secs(7 * 24 * 3600),
            "%Y-%m-%d-%H",
        )
    }

    /// One-day buckets, 365-day TTL
    pub fn daily() -> Self {
        Self::new(
            "daily",
            Duration::from_secs(24 * 3600),
            Duration::from_secs(365 * 24 * 3600),
            "%Y-%m-%d",
        )
    }

    /// Override the TTL
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Override the time layout
    pub fn with_layout(mut self, layout: impl Into<String>) -> Self {
        self.layout = layout.into();
        self
    }

    /// Resolution name (part of the bucket key)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bucket width
    pub fn step(&self) -> Duration {
        self.step
    }

    /// Bucket expiry applied on gather; zero disables expiry
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Chrono layout used by `marshal_time`
    pub fn layout(&self) -> &str {
        &self.layout
    }

    /// Floor `t` to the bucket step
    pub fn round_time(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let step = self.step.as_secs() as i64;
        if step == 0 {
            return t;
        }
        let secs = t.timestamp();
        DateTime::from_timestamp(secs - secs.rem_euclid(step), 0).unwrap_or(t)
    }

    /// Marshal the bucket identity of `t` as a string
    pub fn marshal_time(&self, t: DateTime<Utc>) -> String {
        self.round_time(t).format(&self.layout).to_string()
    }

    /// Ordered bucket timestamps covering `[start, end]`
    ///
    /// Endpoints are floored to the step first; the result is empty when the
    /// rounded end precedes the rounded start (or the step is zero).
    pub fn time_sequence(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let step = self.step.as_secs() as i64;
        if step == 0 {
            return Vec::new();
        }
        let a = start.timestamp() - start.timestamp().rem_euclid(step);
        let b = end.timestamp() - end.timestamp().rem_euclid(step);
        if b < a {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(((b - a) / step + 1) as usize);
        let mut t = a;
        while t <= b {
            if let Some(dt) = DateTime::from_timestamp(t, 0) {
                out.push(dt);
            }
            t += step;
        }
        out
    }
}
