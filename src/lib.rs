//! meterdb - dimensional event counters on a Redis-backed hash store
//!
//! An in-process event-metrics engine:
//! - Labelled counters accumulated in memory with lock-minimising concurrency
//! - Periodic snapshot flushes pipelined into hash-per-bucket store keys
//! - Multi-dimensional range queries: exact lookups, pattern scans and
//!   value enumeration with bounded fan-out
//!
//! # Example
//!
//! ```rust
//! use meterdb::{Desc, Event, Registry, Resolution};
//!
//! let registry = Registry::new();
//! let event = registry
//!     .register(Event::new(Desc::counter(
//!         "requests",
//!         vec!["method".into(), "status".into()],
//!         vec![Resolution::hourly()],
//!     )))
//!     .unwrap();
//! event.add(1, &["GET", "200"]);
//! assert_eq!(event.get(&["GET", "200"]), 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod counters;
pub mod desc;
pub mod error;
pub mod event;
pub mod gather;
pub mod http;
pub mod query;
pub mod registry;
pub mod store;
pub mod types;

// Re-export main types
pub use codec::Codec;
pub use desc::Desc;
pub use error::{Error, QueryError, Result, StoreError};
pub use event::Event;
pub use gather::{Gatherer, SyncTask};
pub use query::{QueryBuilder, QueryExecutor, QueryMode, Results};
pub use registry::Registry;
pub use types::{DataPoint, MetricType, Resolution};
