//! HTTP controller: query-string in, JSON out
//!
//! A thin GET-only surface over the planner and executor:
//!
//! - `GET /?event=E&res=R&start=S&end=E2&mode=scan|exact&group=L&<label>=<value>`
//!   plans and executes a query batch and returns the aggregated series.
//! - `GET /values?...` forces a single event and values mode and returns the
//!   per-label frequency map.
//!
//! Non-GET methods get 405, parse errors 400, store errors 500. Time
//! parameters decode through a pluggable [`TimeDecoder`].

use crate::error::Error;
use crate::query::{QueryBuilder, QueryExecutor, QueryMode};
use crate::registry::Registry;
use crate::types::Resolution;
use axum::extract::{RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const PARAM_EVENT: &str = "event";
const PARAM_RESOLUTION: &str = "res";
const PARAM_START: &str = "start";
const PARAM_END: &str = "end";
const PARAM_GROUP: &str = "group";
const PARAM_MODE: &str = "mode";

/// Decodes time query parameters
pub trait TimeDecoder: Send + Sync {
    /// Decode a raw parameter into a UTC instant; `None` on parse failure
    fn decode_time(&self, raw: &str) -> Option<DateTime<Utc>>;
}

/// Layout-based decoder using a chrono format string
pub struct LayoutDecoder {
    layout: String,
}

impl LayoutDecoder {
    /// Create a decoder for the given chrono layout
    pub fn new(layout: impl Into<String>) -> Self {
        Self {
            layout: layout.into(),
        }
    }
}

impl TimeDecoder for LayoutDecoder {
    fn decode_time(&self, raw: &str) -> Option<DateTime<Utc>> {
        decode_layout(&self.layout, raw)
    }
}

/// A resolution decodes times in its own layout
impl TimeDecoder for Resolution {
    fn decode_time(&self, raw: &str) -> Option<DateTime<Utc>> {
        decode_layout(self.layout(), raw)
    }
}

/// Unix-seconds decoder
pub struct UnixDecoder;

impl TimeDecoder for UnixDecoder {
    fn decode_time(&self, raw: &str) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(raw.parse().ok()?, 0)
    }
}

fn decode_layout(layout: &str, raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, layout) {
        return Some(dt.and_utc());
    }
    // Chrono refuses datetimes without a minute component, so hour-only
    // layouts are completed with an explicit zero minute before parsing.
    let padded_layout = format!("{} %M", layout);
    let padded_raw = format!("{} 0", raw);
    if let Ok(dt) = NaiveDateTime::parse_from_str(&padded_raw, &padded_layout) {
        return Some(dt.and_utc());
    }
    // Date-only layouts carry no time component at all
    if let Ok(date) = NaiveDate::parse_from_str(raw, layout) {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

/// Query controller state
pub struct Controller {
    registry: Arc<Registry>,
    executor: Arc<QueryExecutor>,
    decoder: Arc<dyn TimeDecoder>,
}

impl Controller {
    /// Create a controller over a registry and executor
    pub fn new(
        registry: Arc<Registry>,
        executor: Arc<QueryExecutor>,
        decoder: Arc<dyn TimeDecoder>,
    ) -> Self {
        Self {
            registry,
            executor,
            decoder,
        }
    }

    /// Build the axum router (GET-only; other methods get 405)
    pub fn router(self) -> Router {
        Router::new()
            .route("/", get(query_handler))
            .route("/values", get(values_handler))
            .with_state(Arc::new(self))
    }
}

async fn query_handler(
    State(ctrl): State<Arc<Controller>>,
    RawQuery(raw): RawQuery,
) -> Response {
    let builder = match parse_query(raw.as_deref().unwrap_or(""), ctrl.decoder.as_ref()) {
        Ok(builder) => builder,
        Err(msg) => return (StatusCode::BAD_REQUEST, msg).into_response(),
    };
    let queries = builder.queries(&ctrl.registry);
    debug!(events = queries.len(), mode = builder.mode.as_str(), "http query");
    match ctrl.executor.run(&queries, &CancellationToken::new()).await {
        Ok(results) => Json(results).into_response(),
        Err(err) => error_response(err),
    }
}

async fn values_handler(
    State(ctrl): State<Arc<Controller>>,
    RawQuery(raw): RawQuery,
) -> Response {
    let mut builder = match parse_query(raw.as_deref().unwrap_or(""), ctrl.decoder.as_ref()) {
        Ok(builder) => builder,
        Err(msg) => return (StatusCode::BAD_REQUEST, msg).into_response(),
    };
    builder.events.truncate(1);
    builder.mode = QueryMode::Values;
    let queries = builder.queries(&ctrl.registry);
    match ctrl.executor.run(&queries, &CancellationToken::new()).await {
        Ok(results) => Json(results.frequency_map()).into_response(),
        Err(err) => error_response(err),
    }
}

fn error_response(err: Error) -> Response {
    let status = match err {
        Error::Query(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}

/// Decode a raw query string into a [`QueryBuilder`]
///
/// `event`, `res`, `start` and `end` are required; `group` and `mode` are
/// optional; every other parameter becomes a label value filter. The end of
/// the range is clamped to now and an inverted range collapses onto its end.
pub fn parse_query(raw: &str, decoder: &dyn TimeDecoder) -> Result<QueryBuilder, String> {
    let mut events = Vec::new();
    let mut group = Vec::new();
    let mut resolution = None;
    let mut start_raw = None;
    let mut end_raw = None;
    let mut mode_raw = None;
    let mut filters: HashMap<String, Vec<String>> = HashMap::new();

    for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        match key.as_ref() {
            PARAM_EVENT => events.push(value.into_owned()),
            PARAM_RESOLUTION => resolution = Some(value.into_owned()),
            PARAM_START => start_raw = Some(value.into_owned()),
            PARAM_END => end_raw = Some(value.into_owned()),
            PARAM_GROUP => group.push(value.into_owned()),
            PARAM_MODE => mode_raw = Some(value.into_owned()),
            _ => filters.entry(key.into_owned()).or_default().push(value.into_owned()),
        }
    }

    if events.is_empty() {
        return Err(format!("Missing query.{}", PARAM_EVENT));
    }
    let resolution = resolution.ok_or_else(|| format!("Missing query.{}", PARAM_RESOLUTION))?;
    let start_raw = start_raw.ok_or_else(|| format!("Missing query.{}", PARAM_START))?;
    let end_raw = end_raw.ok_or_else(|| format!("Missing query.{}", PARAM_END))?;
    let mut start = decoder
        .decode_time(&start_raw)
        .ok_or_else(|| format!("Invalid query.{}: {}", PARAM_START, start_raw))?;
    let mut end = decoder
        .decode_time(&end_raw)
        .ok_or_else(|| format!("Invalid query.{}: {}", PARAM_END, end_raw))?;

    let now = Utc::now();
    if end > now {
        end = now;
    }
    if start > end {
        start = end;
    }

    let mut builder = QueryBuilder::new()
        .from_events(events)
        .between(start, end)
        .at(resolution);
    builder.group = group;
    builder.filters = filters;
    builder.mode = QueryMode::parse(mode_raw.as_deref().unwrap_or(""));
    Ok(builder)
}
