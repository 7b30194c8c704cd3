//! Redis hash store with a bounded concurrency gate and retry logic
//!
//! Wraps one multiplexed Redis connection behind a counting semaphore sized
//! to the configured pool. Every store round-trip (pipeline exec, scan page,
//! bulk read) acquires a permit before touching the wire and releases it
//! afterwards, so the gate bounds in-flight operations across the whole
//! engine regardless of which query mode issued them.
//!
//! # Example
//!
//! ```rust,no_run
//! use meterdb::store::{HashStore, RedisConfig, RedisStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisStore::new(RedisConfig::with_url("redis://127.0.0.1:6379")).await?;
//! let value = store.hget("meter\u{1f}hourly\u{1f}2023-04-02-11\u{1f}test", b"\x03baz").await?;
//! # Ok(())
//! # }
//! ```

use super::util::safe_redis_error;
use super::{HashStore, StoreOp, StoreValue};
use crate::error::StoreError;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, warn};

/// Configuration for the Redis store
#[derive(Clone, Debug)]
pub struct RedisConfig {
    /// Redis server URL (e.g., "redis://localhost:6379")
    pub url: String,

    /// Gate size: maximum in-flight operations
    /// Default: 16
    pub pool_size: u32,

    /// Timeout for establishing the connection
    /// Default: 5 seconds
    pub connection_timeout: Duration,

    /// Timeout for individual commands and pipelines
    /// Default: 1 second
    pub command_timeout: Duration,

    /// Page size passed to `HSCAN COUNT`
    /// Default: 512
    pub scan_count: usize,

    /// Retry policy for failed operations
    pub retry_policy: RetryPolicy,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 16,
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(1),
            scan_count: 512,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl RedisConfig {
    /// Create a config with the specified URL
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the gate size
    pub fn pool_size(mut self, size: u32) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the connection timeout
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the command timeout
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the `HSCAN` page size
    pub fn scan_count(mut self, count: usize) -> Self {
        self.scan_count = count;
        self
    }

    /// Set the retry policy
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("Redis URL cannot be empty".to_string());
        }
        if self.pool_size == 0 {
            return Err("Pool size must be greater than 0".to_string());
        }
        if self.pool_size > 1000 {
            return Err("Pool size cannot exceed 1000".to_string());
        }
        if self.scan_count == 0 {
            return Err("Scan count must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Retry policy with exponential backoff
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    /// Default: 3
    pub max_retries: u32,

    /// Initial delay between retries
    /// Default: 100ms
    pub initial_delay: Duration,

    /// Maximum delay between retries
    /// Default: 5 seconds
    pub max_delay: Duration,

    /// Multiplier for exponential backoff
    /// Default: 2.0
    pub multiplier: f64,

    /// Add random jitter to delays
    /// Default: true
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry `attempt` (0-indexed)
    ///
    /// Grows geometrically from `initial_delay` and caps at `max_delay`;
    /// with jitter enabled the capped wait is stretched by up to a further
    /// quarter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let backoff = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = backoff.min(self.max_delay.as_secs_f64());
        let jittered = match self.jitter {
            true => capped * (1.0 + rand::random::<f64>() / 4.0),
            false => capped,
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Check if we should retry after the given attempt
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Store operation metrics
#[derive(Debug, Default)]
pub struct StoreMetrics {
    /// Total number of connections established
    pub connections_created: AtomicU64,
    /// Total number of connection failures
    pub connection_failures: AtomicU64,
    /// Total number of commands executed
    pub commands_executed: AtomicU64,
    /// Total number of command failures
    pub command_failures: AtomicU64,
    /// Total number of retries
    pub retries: AtomicU64,
    /// Total command latency in microseconds
    pub total_latency_us: AtomicU64,
}

impl StoreMetrics {
    fn record_command(&self, latency: Duration) {
        self.commands_executed.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    /// Average command latency in microseconds
    pub fn average_latency_us(&self) -> f64 {
        let total = self.total_latency_us.load(Ordering::Relaxed);
        let count = self.commands_executed.load(Ordering::Relaxed);
        if count == 0 {
            0.0
        } else {
            total as f64 / count as f64
        }
    }
}

/// Redis-backed [`HashStore`]
///
/// Uses one multiplexed connection (the redis crate handles interleaving);
/// the semaphore bounds concurrent operations to the configured pool size.
pub struct RedisStore {
    client: Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    config: RedisConfig,
    metrics: Arc<StoreMetrics>,
    gate: Arc<Semaphore>,
}

impl RedisStore {
    /// Connect to Redis and build the store
    pub async fn new(config: RedisConfig) -> Result<Self, StoreError> {
        config.validate().map_err(StoreError::Connection)?;

        let client = Client::open(config.url.as_str())
            .map_err(|e| StoreError::Connection(safe_redis_error(&config.url, &e)))?;

        let store = Self {
            client,
            connection: RwLock::new(None),
            gate: Arc::new(Semaphore::new(config.pool_size as usize)),
            metrics: Arc::new(StoreMetrics::default()),
            config,
        };
        store.connect().await?;

        debug!("redis store initialized");
        Ok(store)
    }

    /// Store configuration
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Operation metrics
    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    /// Check liveness with a `PING`
    pub async fn ping(&self) -> bool {
        self.execute(|mut conn| async move {
            redis::cmd("PING").query_async::<String>(&mut conn).await
        })
        .await
        .is_ok()
    }

    async fn connect(&self) -> Result<(), StoreError> {
        let start = Instant::now();
        let conn_future = self.client.get_multiplexed_async_connection();
        let conn = tokio::time::timeout(self.config.connection_timeout, conn_future)
            .await
            .map_err(|_| {
                self.metrics.connection_failures.fetch_add(1, Ordering::Relaxed);
                StoreError::Connection("connection timeout".to_string())
            })?
            .map_err(|e| {
                self.metrics.connection_failures.fetch_add(1, Ordering::Relaxed);
                StoreError::Connection(safe_redis_error(&self.config.url, &e))
            })?;

        *self.connection.write().await = Some(conn);
        self.metrics.connections_created.fetch_add(1, Ordering::Relaxed);
        debug!("redis connection established in {:?}", start.elapsed());
        Ok(())
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let conn = { self.connection.read().await.clone() };
        match conn {
            Some(conn) => Ok(conn),
            None => {
                self.connect().await?;
                self.connection
                    .read()
                    .await
                    .clone()
                    .ok_or_else(|| StoreError::Connection("no connection available".to_string()))
            }
        }
    }

    /// Run one gated, time-limited attempt of `f`
    ///
    /// Gate and connection acquisition failures are not retriable and
    /// surface immediately; command errors and timeouts come back as an
    /// [`Attempt`] for the caller to classify.
    async fn attempt_once<F, Fut, T>(&self, f: &F) -> Result<Attempt<T>, StoreError>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = Result<T, RedisError>>,
    {
        let permit = Arc::clone(&self.gate)
            .acquire_owned()
            .await
            .map_err(|_| StoreError::Connection("gate closed".to_string()))?;
        let conn = self.connection().await?;
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.config.command_timeout, f(conn)).await;
        drop(permit);

        Ok(match outcome {
            Ok(Ok(value)) => {
                self.metrics.record_command(started.elapsed());
                Attempt::Done(value)
            }
            Ok(Err(e)) => Attempt::Failed(e),
            Err(_) => Attempt::TimedOut,
        })
    }

    /// Execute a command, retrying transient failures under the policy
    async fn execute<F, Fut, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = Result<T, RedisError>>,
    {
        let policy = &self.config.retry_policy;
        let mut attempt = 0;
        loop {
            let failure = match self.attempt_once(&f).await? {
                Attempt::Done(value) => return Ok(value),
                Attempt::TimedOut => None,
                Attempt::Failed(e) => Some(e),
            };
            self.metrics.command_failures.fetch_add(1, Ordering::Relaxed);

            let kind = failure
                .as_ref()
                .map_or(FailureKind::Transient, classify_failure);
            if kind == FailureKind::Fatal || !policy.should_retry(attempt) {
                return Err(match failure {
                    Some(e) => StoreError::Command(safe_redis_error(&self.config.url, &e)),
                    None => StoreError::Timeout,
                });
            }

            self.metrics.retries.fetch_add(1, Ordering::Relaxed);
            let backoff = policy.delay_for_attempt(attempt);
            match &failure {
                Some(e) => warn!(attempt, ?backoff, "redis operation failed, backing off: {}", e),
                None => warn!(attempt, ?backoff, "redis operation timed out, backing off"),
            }
            tokio::time::sleep(backoff).await;
            if kind == FailureKind::Disconnected {
                // The multiplexed connection is stale; replace it first
                let _ = self.connect().await;
            }
            attempt += 1;
        }
    }
}

/// Outcome of a single command attempt
enum Attempt<T> {
    Done(T),
    TimedOut,
    Failed(RedisError),
}

/// How a failed command should be handled
#[derive(Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    /// Worth another attempt on the current connection
    Transient,
    /// Worth another attempt, but only on a fresh connection
    Disconnected,
    /// Retrying cannot help
    Fatal,
}

/// Classify a redis error by what a retry would need
///
/// The redis crate exposes dropped-connection, IO and timeout predicates
/// plus the busy-loading kind; everything else (bad replies, type errors,
/// auth failures) is fatal.
fn classify_failure(e: &RedisError) -> FailureKind {
    if e.is_connection_dropped() || e.is_io_error() {
        return FailureKind::Disconnected;
    }
    if e.is_timeout() || e.kind() == redis::ErrorKind::BusyLoadingError {
        return FailureKind::Transient;
    }
    FailureKind::Fatal
}

#[async_trait]
impl HashStore for RedisStore {
    async fn exec(&self, ops: Vec<StoreOp>) -> Result<Vec<StoreValue>, StoreError> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let pipe = build_pipeline(&ops);
        let replies = self
            .execute(|mut conn| {
                let pipe = pipe.clone();
                async move { pipe.query_async::<Vec<redis::Value>>(&mut conn).await }
            })
            .await?;
        Ok(replies.into_iter().map(convert_value).collect())
    }

    async fn hget(&self, key: &str, field: &[u8]) -> Result<Option<String>, StoreError> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(key).arg(field);
        self.execute(|mut conn| {
            let cmd = cmd.clone();
            async move { cmd.query_async::<Option<String>>(&mut conn).await }
        })
        .await
    }

    async fn hmget(
        &self,
        key: &str,
        fields: &[Vec<u8>],
    ) -> Result<Vec<Option<String>>, StoreError> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(key);
        for field in fields {
            cmd.arg(field.as_slice());
        }
        self.execute(|mut conn| {
            let cmd = cmd.clone();
            async move { cmd.query_async::<Vec<Option<String>>>(&mut conn).await }
        })
        .await
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(Vec<u8>, String)>, StoreError> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(key);
        self.execute(|mut conn| {
            let cmd = cmd.clone();
            async move { cmd.query_async::<Vec<(Vec<u8>, String)>>(&mut conn).await }
        })
        .await
    }

    async fn hscan(
        &self,
        key: &str,
        pattern: &[u8],
        count: usize,
    ) -> Result<Vec<(Vec<u8>, String)>, StoreError> {
        let mut pairs = Vec::new();
        let mut cursor = 0u64;
        loop {
            let mut cmd = redis::cmd("HSCAN");
            cmd.arg(key)
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(count);
            // One gate permit per page round-trip
            let (next, items) = self
                .execute(|mut conn| {
                    let cmd = cmd.clone();
                    async move { cmd.query_async::<(u64, Vec<Vec<u8>>)>(&mut conn).await }
                })
                .await?;
            for pair in items.chunks(2) {
                if let [field, value] = pair {
                    pairs.push((field.clone(), String::from_utf8_lossy(value).into_owned()));
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(pairs)
    }
}

fn build_pipeline(ops: &[StoreOp]) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    for op in ops {
        match op {
            StoreOp::HIncrBy { key, field, delta } => {
                pipe.cmd("HINCRBY").arg(key).arg(field.as_slice()).arg(*delta);
            }
            StoreOp::HSet { key, field, value } => {
                pipe.cmd("HSET").arg(key).arg(field.as_slice()).arg(*value);
            }
            StoreOp::HSetNx { key, field, value } => {
                pipe.cmd("HSETNX").arg(key).arg(field.as_slice()).arg(*value);
            }
            StoreOp::HGet { key, field } => {
                pipe.cmd("HGET").arg(key).arg(field.as_slice());
            }
            StoreOp::Expire { key, ttl } => {
                pipe.cmd("EXPIRE").arg(key).arg(ttl.as_secs());
            }
        }
    }
    pipe
}

fn convert_value(value: redis::Value) -> StoreValue {
    match value {
        redis::Value::Int(n) => StoreValue::Int(n),
        redis::Value::BulkString(bytes) => {
            StoreValue::Text(String::from_utf8_lossy(&bytes).into_owned())
        }
        redis::Value::SimpleString(s) => StoreValue::Text(s),
        redis::Value::Okay => StoreValue::Ok,
        redis::Value::Nil => StoreValue::Nil,
        _ => StoreValue::Nil,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RedisConfig::default();
        assert_eq!(config.pool_size, 16);
        assert_eq!(config.scan_count, 512);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let config = RedisConfig {
            url: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RedisConfig::with_url("redis://localhost").pool_size(0);
        assert!(config.validate().is_err());

        let config = RedisConfig::with_url("redis://localhost").pool_size(1001);
        assert!(config.validate().is_err());

        let config = RedisConfig::with_url("redis://localhost").scan_count(0);
        assert!(config.validate().is_err());

        let config = RedisConfig::with_url("redis://localhost");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = RedisConfig::with_url("redis://localhost:6380")
            .pool_size(32)
            .scan_count(100)
            .command_timeout(Duration::from_secs(2));
        assert_eq!(config.url, "redis://localhost:6380");
        assert_eq!(config.pool_size, 32);
        assert_eq!(config.scan_count, 100);
        assert_eq!(config.command_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_retry_policy_delay() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: false,
            ..Default::default()
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        // Capped at max_delay
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_policy_should_retry() {
        let policy = RetryPolicy {
            max_retries: 3,
            ..Default::default()
        };
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_build_pipeline_covers_all_ops() {
        let ops = vec![
            StoreOp::HIncrBy {
                key: "k".into(),
                field: b"f".to_vec(),
                delta: 1,
            },
            StoreOp::HSet {
                key: "k".into(),
                field: b"f".to_vec(),
                value: 2,
            },
            StoreOp::HSetNx {
                key: "k".into(),
                field: b"f".to_vec(),
                value: 3,
            },
            StoreOp::HGet {
                key: "k".into(),
                field: b"f".to_vec(),
            },
            StoreOp::Expire {
                key: "k".into(),
                ttl: Duration::from_secs(60),
            },
        ];
        let pipe = build_pipeline(&ops);
        assert_eq!(pipe.cmd_iter().count(), ops.len());
    }

    #[test]
    fn test_classify_failure() {
        let busy = RedisError::from((redis::ErrorKind::BusyLoadingError, "loading"));
        assert!(matches!(classify_failure(&busy), FailureKind::Transient));

        let fatal = RedisError::from((redis::ErrorKind::TypeError, "bad reply"));
        assert!(matches!(classify_failure(&fatal), FailureKind::Fatal));

        let io = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(matches!(classify_failure(&io), FailureKind::Disconnected));
    }

    #[test]
    fn test_convert_value() {
        assert_eq!(convert_value(redis::Value::Int(4)), StoreValue::Int(4));
        assert_eq!(
            convert_value(redis::Value::BulkString(b"12".to_vec())),
            StoreValue::Text("12".into())
        );
        assert_eq!(convert_value(redis::Value::Nil), StoreValue::Nil);
        assert_eq!(convert_value(redis::Value::Okay), StoreValue::Ok);
    }
}
