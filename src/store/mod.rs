//! Hash-store abstraction
//!
//! The engine treats its backing store as a black box: a hash-per-bucket
//! key-value server offering `HINCRBY`/`HSET`/`HSETNX`/`HGET`/`HMGET`/
//! `HSCAN`/`HGETALL`/`EXPIRE` and the ability to group write operations
//! into a single pipeline. [`RedisStore`] is the production implementation;
//! [`MemoryStore`] backs tests and demos.
//!
//! A missing field is success with a zero count, never an error.

pub mod memory;
pub mod redis;
pub mod util;

pub use self::memory::MemoryStore;
pub use self::redis::{RedisConfig, RedisStore, RetryPolicy};

use crate::error::StoreError;
use async_trait::async_trait;
use std::time::Duration;

/// One queued pipeline operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Add `delta` into a hash field (`HINCRBY`)
    HIncrBy {
        /// Bucket key
        key: String,
        /// Packed field
        field: Vec<u8>,
        /// Amount to add
        delta: i64,
    },
    /// Overwrite a hash field (`HSET`)
    HSet {
        /// Bucket key
        key: String,
        /// Packed field
        field: Vec<u8>,
        /// Value to store
        value: i64,
    },
    /// Write a hash field only if absent (`HSETNX`)
    HSetNx {
        /// Bucket key
        key: String,
        /// Packed field
        field: Vec<u8>,
        /// Value to store
        value: i64,
    },
    /// Read a hash field (`HGET`)
    HGet {
        /// Bucket key
        key: String,
        /// Packed field
        field: Vec<u8>,
    },
    /// Set a key expiry (`EXPIRE`)
    Expire {
        /// Bucket key
        key: String,
        /// Time to live
        ttl: Duration,
    },
}

/// One per-command pipeline reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreValue {
    /// Integer reply
    Int(i64),
    /// Bulk string reply
    Text(String),
    /// Missing key or field
    Nil,
    /// Status reply
    Ok,
}

impl StoreValue {
    /// Interpret the reply as a counter value; missing and non-numeric
    /// replies count as zero.
    pub fn count(&self) -> i64 {
        match self {
            StoreValue::Int(n) => *n,
            StoreValue::Text(s) => s.parse().unwrap_or(0),
            StoreValue::Nil | StoreValue::Ok => 0,
        }
    }

    /// True for the missing-field sentinel
    pub fn is_missing(&self) -> bool {
        matches!(self, StoreValue::Nil)
    }
}

/// Pipelined hash store consumed by the gatherer and query executor
///
/// Implementations bound their own concurrency: every round-trip (pipeline
/// exec, scan page, bulk read) is expected to pass through the store's
/// internal gate.
#[async_trait]
pub trait HashStore: Send + Sync {
    /// Execute a batch of operations as one pipeline, returning per-command
    /// replies in order
    async fn exec(&self, ops: Vec<StoreOp>) -> Result<Vec<StoreValue>, StoreError>;

    /// Read one field; `None` when the key or field is absent
    async fn hget(&self, key: &str, field: &[u8]) -> Result<Option<String>, StoreError>;

    /// Read several fields; each missing field yields `None`
    async fn hmget(&self, key: &str, fields: &[Vec<u8>])
        -> Result<Vec<Option<String>>, StoreError>;

    /// Read all fields and values of a bucket
    async fn hgetall(&self, key: &str) -> Result<Vec<(Vec<u8>, String)>, StoreError>;

    /// Scan a bucket's fields matching `pattern`, fully draining the cursor
    ///
    /// The pattern is a server-side prefilter; callers re-verify matches.
    async fn hscan(
        &self,
        key: &str,
        pattern: &[u8],
        count: usize,
    ) -> Result<Vec<(Vec<u8>, String)>, StoreError>;
}
