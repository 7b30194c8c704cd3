//! In-memory hash store
//!
//! A mutexed-map implementation of [`HashStore`] for tests, demos and
//! single-process deployments that do not want a network store. TTLs are
//! recorded but not enforced; `HSCAN` treats the match pattern as advisory
//! and returns every pair, which is legal because callers re-verify fields
//! client-side.

use super::{HashStore, StoreOp, StoreValue};
use crate::error::StoreError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Default)]
struct Inner {
    data: HashMap<String, HashMap<Vec<u8>, i64>>,
    ttls: HashMap<String, Duration>,
}

/// Hash store backed by process memory
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded TTL for a key, if any
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.inner.lock().ttls.get(key).copied()
    }

    /// Number of fields stored under `key`
    pub fn field_count(&self, key: &str) -> usize {
        self.inner.lock().data.get(key).map_or(0, HashMap::len)
    }

    /// All bucket keys currently present
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().data.keys().cloned().collect()
    }

    /// Drop all data
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.data.clear();
        inner.ttls.clear();
    }
}

#[async_trait]
impl HashStore for MemoryStore {
    async fn exec(&self, ops: Vec<StoreOp>) -> Result<Vec<StoreValue>, StoreError> {
        let mut inner = self.inner.lock();
        let mut replies = Vec::with_capacity(ops.len());
        for op in ops {
            let reply = match op {
                StoreOp::HIncrBy { key, field, delta } => {
                    let slot = inner.data.entry(key).or_default().entry(field).or_insert(0);
                    *slot += delta;
                    StoreValue::Int(*slot)
                }
                StoreOp::HSet { key, field, value } => {
                    let created = inner
                        .data
                        .entry(key)
                        .or_default()
                        .insert(field, value)
                        .is_none();
                    StoreValue::Int(created as i64)
                }
                StoreOp::HSetNx { key, field, value } => {
                    let bucket = inner.data.entry(key).or_default();
                    if bucket.contains_key(&field) {
                        StoreValue::Int(0)
                    } else {
                        bucket.insert(field, value);
                        StoreValue::Int(1)
                    }
                }
                StoreOp::HGet { key, field } => match inner
                    .data
                    .get(&key)
                    .and_then(|bucket| bucket.get(&field))
                {
                    Some(value) => StoreValue::Text(value.to_string()),
                    None => StoreValue::Nil,
                },
                StoreOp::Expire { key, ttl } => {
                    let known = inner.data.contains_key(&key);
                    if known {
                        inner.ttls.insert(key, ttl);
                    }
                    StoreValue::Int(known as i64)
                }
            };
            replies.push(reply);
        }
        Ok(replies)
    }

    async fn hget(&self, key: &str, field: &[u8]) -> Result<Option<String>, StoreError> {
        Ok(self
            .inner
            .lock()
            .data
            .get(key)
            .and_then(|bucket| bucket.get(field))
            .map(i64::to_string))
    }

    async fn hmget(
        &self,
        key: &str,
        fields: &[Vec<u8>],
    ) -> Result<Vec<Option<String>>, StoreError> {
        let inner = self.inner.lock();
        let bucket = inner.data.get(key);
        Ok(fields
            .iter()
            .map(|field| {
                bucket
                    .and_then(|b| b.get(field.as_slice()))
                    .map(i64::to_string)
            })
            .collect())
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(Vec<u8>, String)>, StoreError> {
        Ok(self
            .inner
            .lock()
            .data
            .get(key)
            .map(|bucket| {
                bucket
                    .iter()
                    .map(|(field, value)| (field.clone(), value.to_string()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn hscan(
        &self,
        key: &str,
        _pattern: &[u8],
        _count: usize,
    ) -> Result<Vec<(Vec<u8>, String)>, StoreError> {
        self.hgetall(key).await
    }
}
