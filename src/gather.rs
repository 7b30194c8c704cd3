//! Gathering: flushing in-memory counters into the store
//!
//! [`Gatherer::gather`] drains an event's counter table and queues one
//! pipelined write per `(resolution, non-zero entry)`, followed by one
//! `EXPIRE` per distinct bucket key. If the pipeline fails, an
//! `Increment`-type event gets its snapshot merged back so no counts are
//! lost; `Update`/`UpdateOnce` snapshots are discarded, since a late replay
//! would overwrite newer point-in-time values.
//!
//! [`SyncTask`] runs the periodic half: gather every registered event on an
//! interval until cancelled.

use crate::codec::Codec;
use crate::counters::Snapshot;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::registry::Registry;
use crate::store::{HashStore, StoreOp};
use crate::types::MetricType;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Flushes event snapshots into the hash store
pub struct Gatherer {
    store: Arc<dyn HashStore>,
    codec: Codec,
}

impl Gatherer {
    /// Create a gatherer writing through `store` with `codec`'s key layout
    pub fn new(store: Arc<dyn HashStore>, codec: Codec) -> Self {
        Self { store, codec }
    }

    /// Flush one event's counters into the store at bucket time `tm`
    ///
    /// A snapshot with no non-zero entries is a no-op that succeeds without
    /// opening a pipeline.
    pub async fn gather(&self, event: &Event, tm: DateTime<Utc>) -> Result<()> {
        let snapshot = event.flush(Snapshot::new());
        if snapshot.is_empty() {
            return Ok(());
        }

        let desc = event.desc();
        let kind = desc.kind();
        let label_count = desc.labels().len();
        let fields: Vec<Vec<u8>> = snapshot
            .iter()
            .map(|entry| Codec::field(label_count, &entry.values))
            .collect();

        let mut ops = Vec::with_capacity(desc.resolutions().len() * (snapshot.len() + 1));
        let mut expiries: Vec<(String, Duration)> = Vec::new();
        let mut seen_keys = HashSet::new();
        for res in desc.resolutions() {
            let key = self.codec.key(res, desc.name(), tm);
            for (entry, field) in snapshot.iter().zip(&fields) {
                ops.push(match kind {
                    MetricType::Increment => StoreOp::HIncrBy {
                        key: key.clone(),
                        field: field.clone(),
                        delta: entry.count,
                    },
                    MetricType::Update => StoreOp::HSet {
                        key: key.clone(),
                        field: field.clone(),
                        value: entry.count,
                    },
                    MetricType::UpdateOnce => StoreOp::HSetNx {
                        key: key.clone(),
                        field: field.clone(),
                        value: entry.count,
                    },
                });
            }
            if !res.ttl().is_zero() && seen_keys.insert(key.clone()) {
                expiries.push((key, res.ttl()));
            }
        }
        for (key, ttl) in expiries {
            ops.push(StoreOp::Expire { key, ttl });
        }

        match self.store.exec(ops).await {
            Ok(_) => {
                debug!(
                    event = desc.name(),
                    counters = snapshot.len(),
                    resolutions = desc.resolutions().len(),
                    "gathered event"
                );
                Ok(())
            }
            Err(e) => {
                warn!(event = desc.name(), "gather pipeline failed: {}", e);
                if kind == MetricType::Increment {
                    event.merge(&snapshot);
                }
                Err(Error::Store(e))
            }
        }
    }

    /// Gather every registered event at the same bucket time
    ///
    /// Later events are still flushed when an earlier one fails; the first
    /// error is returned.
    pub async fn gather_all(&self, registry: &Registry, tm: DateTime<Utc>) -> Result<()> {
        let mut events: Vec<Arc<Event>> = Vec::with_capacity(registry.len());
        registry.each(|_, event| events.push(Arc::clone(event)));

        let mut first_err = None;
        for event in events {
            if let Err(e) = self.gather(&event, tm).await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Background loop gathering all events on a fixed interval
pub struct SyncTask;

impl SyncTask {
    /// Spawn the loop; it stops when `token` is cancelled
    pub fn spawn(
        gatherer: Arc<Gatherer>,
        registry: Arc<Registry>,
        interval: Duration,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = gatherer.gather_all(&registry, Utc::now()).await {
                            warn!("periodic gather failed: {}", e);
                        }
                    }
                }
            }
            debug!("sync task stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::Desc;
    use crate::error::StoreError;
    use crate::store::{MemoryStore, StoreValue};
    use crate::types::Resolution;
    use async_trait::async_trait;
    use chrono::TimeZone;

    /// Store whose pipeline always fails
    struct FailStore;

    #[async_trait]
    impl HashStore for FailStore {
        async fn exec(&self, _ops: Vec<StoreOp>) -> std::result::Result<Vec<StoreValue>, StoreError> {
            Err(StoreError::Command("injected".into()))
        }

        async fn hget(
            &self,
            _key: &str,
            _field: &[u8],
        ) -> std::result::Result<Option<String>, StoreError> {
            Err(StoreError::Command("injected".into()))
        }

        async fn hmget(
            &self,
            _key: &str,
            _fields: &[Vec<u8>],
        ) -> std::result::Result<Vec<Option<String>>, StoreError> {
            Err(StoreError::Command("injected".into()))
        }

        async fn hgetall(
            &self,
            _key: &str,
        ) -> std::result::Result<Vec<(Vec<u8>, String)>, StoreError> {
            Err(StoreError::Command("injected".into()))
        }

        async fn hscan(
            &self,
            _key: &str,
            _pattern: &[u8],
            _count: usize,
        ) -> std::result::Result<Vec<(Vec<u8>, String)>, StoreError> {
            Err(StoreError::Command("injected".into()))
        }
    }

    fn hourly() -> Resolution {
        Resolution::hourly().with_ttl(Duration::from_secs(3600))
    }

    fn counter_event(name: &str) -> Event {
        Event::new(Desc::counter(
            name,
            vec!["foo".into(), "bar".into()],
            vec![hourly()],
        ))
    }

    fn bucket_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 4, 2, 11, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_gather_writes_counters_and_ttl() {
        let store = Arc::new(MemoryStore::new());
        let gatherer = Gatherer::new(store.clone(), Codec::default());
        let event = counter_event("test");
        event.add(1, &["bar", "baz"]);
        event.add(1, &["bax"]);

        gatherer.gather(&event, bucket_time()).await.unwrap();

        let key = Codec::default().key(&hourly(), "test", bucket_time());
        assert_eq!(store.field_count(&key), 2);
        assert_eq!(store.ttl(&key), Some(Duration::from_secs(3600)));
        let field = Codec::field(2, &["bar".into(), "baz".into()]);
        assert_eq!(store.hget(&key, &field).await.unwrap(), Some("1".to_string()));
        // Counters were reset by the flush
        assert_eq!(event.get(&["bar", "baz"]), 0);
        // Entries survive for the next round
        assert_eq!(event.len(), 2);
    }

    #[tokio::test]
    async fn test_gather_accumulates_increments() {
        let store = Arc::new(MemoryStore::new());
        let gatherer = Gatherer::new(store.clone(), Codec::default());
        let event = counter_event("test");

        event.add(2, &["a", "b"]);
        gatherer.gather(&event, bucket_time()).await.unwrap();
        event.add(3, &["a", "b"]);
        gatherer.gather(&event, bucket_time()).await.unwrap();

        let key = Codec::default().key(&hourly(), "test", bucket_time());
        let field = Codec::field(2, &["a".into(), "b".into()]);
        assert_eq!(store.hget(&key, &field).await.unwrap(), Some("5".to_string()));
    }

    #[tokio::test]
    async fn test_gather_empty_event_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let gatherer = Gatherer::new(store.clone(), Codec::default());
        let event = counter_event("test");

        gatherer.gather(&event, bucket_time()).await.unwrap();
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_gather_failure_restores_increment_counters() {
        let gatherer = Gatherer::new(Arc::new(FailStore), Codec::default());
        let event = counter_event("test");
        event.add(4, &["a", "b"]);
        event.add(2, &["c", "d"]);

        let err = gatherer.gather(&event, bucket_time()).await.unwrap_err();
        assert!(matches!(err, Error::Store(_)));
        assert_eq!(event.get(&["a", "b"]), 4);
        assert_eq!(event.get(&["c", "d"]), 2);
    }

    #[tokio::test]
    async fn test_gather_failure_discards_update_snapshot() {
        let gatherer = Gatherer::new(Arc::new(FailStore), Codec::default());
        let event = Event::new(Desc::new(
            MetricType::Update,
            "gauge",
            vec!["foo".into()],
            vec![hourly()],
        ));
        event.add(7, &["a"]);

        assert!(gatherer.gather(&event, bucket_time()).await.is_err());
        // No recovery for Update: the snapshot is dropped
        assert_eq!(event.get(&["a"]), 0);
    }

    #[tokio::test]
    async fn test_gather_update_once_uses_first_value() {
        let store = Arc::new(MemoryStore::new());
        let gatherer = Gatherer::new(store.clone(), Codec::default());
        let event = Event::new(Desc::new(
            MetricType::UpdateOnce,
            "first",
            vec!["foo".into()],
            vec![hourly()],
        ));

        event.add(5, &["a"]);
        gatherer.gather(&event, bucket_time()).await.unwrap();
        event.add(9, &["a"]);
        gatherer.gather(&event, bucket_time()).await.unwrap();

        let key = Codec::default().key(&hourly(), "first", bucket_time());
        let field = Codec::field(1, &["a".into()]);
        assert_eq!(store.hget(&key, &field).await.unwrap(), Some("5".to_string()));
    }

    /// Fails pipelines touching one event's buckets, stores the rest
    struct PartialFailStore {
        inner: MemoryStore,
        fail_event: String,
    }

    #[async_trait]
    impl HashStore for PartialFailStore {
        async fn exec(&self, ops: Vec<StoreOp>) -> std::result::Result<Vec<StoreValue>, StoreError> {
            let poisoned = ops.iter().any(|op| {
                let key = match op {
                    StoreOp::HIncrBy { key, .. }
                    | StoreOp::HSet { key, .. }
                    | StoreOp::HSetNx { key, .. }
                    | StoreOp::HGet { key, .. }
                    | StoreOp::Expire { key, .. } => key,
                };
                key.ends_with(&self.fail_event)
            });
            if poisoned {
                return Err(StoreError::Command("injected".into()));
            }
            self.inner.exec(ops).await
        }

        async fn hget(
            &self,
            key: &str,
            field: &[u8],
        ) -> std::result::Result<Option<String>, StoreError> {
            self.inner.hget(key, field).await
        }

        async fn hmget(
            &self,
            key: &str,
            fields: &[Vec<u8>],
        ) -> std::result::Result<Vec<Option<String>>, StoreError> {
            self.inner.hmget(key, fields).await
        }

        async fn hgetall(&self, key: &str) -> std::result::Result<Vec<(Vec<u8>, String)>, StoreError> {
            self.inner.hgetall(key).await
        }

        async fn hscan(
            &self,
            key: &str,
            pattern: &[u8],
            count: usize,
        ) -> std::result::Result<Vec<(Vec<u8>, String)>, StoreError> {
            self.inner.hscan(key, pattern, count).await
        }
    }

    #[tokio::test]
    async fn test_gather_all_continues_after_failure() {
        let store = Arc::new(PartialFailStore {
            inner: MemoryStore::new(),
            fail_event: "bad".into(),
        });
        let registry = Registry::new();
        let ok = registry.register(counter_event("ok")).unwrap();
        let bad = registry.register(counter_event("bad")).unwrap();
        ok.add(1, &["a", "b"]);
        bad.add(2, &["c", "d"]);

        let gatherer = Gatherer::new(store.clone(), Codec::default());
        let err = gatherer
            .gather_all(&registry, bucket_time())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(_)));

        // The healthy event was still flushed despite the failure
        let key = Codec::default().key(&hourly(), "ok", bucket_time());
        assert_eq!(store.inner.field_count(&key), 1);
        assert_eq!(ok.get(&["a", "b"]), 0);
        // The failing event rolled its counters back
        assert_eq!(bad.get(&["c", "d"]), 2);
    }

    #[tokio::test]
    async fn test_sync_task_stops_on_cancel() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(Registry::new());
        let event = registry.register(counter_event("test")).unwrap();
        event.add(1, &["a", "b"]);

        let gatherer = Arc::new(Gatherer::new(store.clone(), Codec::default()));
        let token = CancellationToken::new();
        let handle = SyncTask::spawn(
            gatherer,
            Arc::clone(&registry),
            Duration::from_millis(10),
            token.clone(),
        );

        // Give the first tick a chance to run, then stop
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        handle.await.unwrap();
        assert!(!store.keys().is_empty());
    }
}
