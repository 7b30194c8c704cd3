//! meterd - HTTP query shell over a Redis-backed metrics registry
//!
//! Serves the query controller and runs the periodic gather loop. Events
//! are registered by embedding applications; this shell exists so the
//! query surface can run standalone against an already-populated store.
//!
//! # Endpoints
//!
//! - `GET /` - query gathered counters
//! - `GET /values` - per-label value frequencies
//!
//! # Configuration
//!
//! - `METERD_REDIS_URL` - store URL (default `redis://127.0.0.1:6379`)
//! - `METERD_LISTEN` - listen address (default `127.0.0.1:9099`)
//! - `METERD_SYNC_SECS` - gather interval in seconds (default 60)

use meterdb::http::{Controller, UnixDecoder};
use meterdb::store::{HashStore, RedisConfig, RedisStore};
use meterdb::{Codec, Gatherer, QueryExecutor, Registry, SyncTask};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let redis_url =
        std::env::var("METERD_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
    let listen = std::env::var("METERD_LISTEN").unwrap_or_else(|_| "127.0.0.1:9099".into());
    let sync_secs: u64 = std::env::var("METERD_SYNC_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(60);

    let store: Arc<dyn HashStore> =
        Arc::new(RedisStore::new(RedisConfig::with_url(redis_url)).await?);
    let codec = Codec::default();
    let registry = Arc::new(Registry::new());

    let token = CancellationToken::new();
    let gatherer = Arc::new(Gatherer::new(Arc::clone(&store), codec.clone()));
    let sync = SyncTask::spawn(
        gatherer,
        Arc::clone(&registry),
        Duration::from_secs(sync_secs),
        token.clone(),
    );

    let executor = Arc::new(QueryExecutor::new(store, codec));
    let app = Controller::new(registry, executor, Arc::new(UnixDecoder)).router();

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!("meterd listening on {}", listen);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown(token.clone()))
        .await?;

    token.cancel();
    sync.await?;
    Ok(())
}

async fn shutdown(token: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
    token.cancel();
}
