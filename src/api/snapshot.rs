//! Snapshot store endpoints: exchanges, markets, statuses, manual runs.

use super::AppState;
use crate::queue::JobQueue;
use crate::storage::{ExchangeFilter, MarketFilter, StatusFilter};
use crate::worker;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info};

fn internal_error<E: std::fmt::Display>(e: E) -> (StatusCode, Json<Value>) {
    error!(error = %e, "snapshot query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal error"})),
    )
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ExchangeQuery {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub interval: Option<i64>,
    pub volume_gte: Option<f64>,
    pub volume_lte: Option<f64>,
    pub last_updated_gte: Option<DateTime<Utc>>,
    pub last_updated_lte: Option<DateTime<Utc>>,
    pub created_gte: Option<DateTime<Utc>>,
    pub created_lte: Option<DateTime<Utc>>,
    pub ordering: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_exchanges(
    Query(query): Query<ExchangeQuery>,
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let cache_key = format!("exchanges:{}", serde_json::to_string(&query).unwrap_or_default());
    if let Some(cached) = state.cache.get(&cache_key) {
        return Ok(Json(cached));
    }
    let filter = ExchangeFilter {
        name: query.name,
        enabled: query.enabled,
        interval: query.interval,
        volume_gte: query.volume_gte,
        volume_lte: query.volume_lte,
        updated_gte: query.last_updated_gte,
        updated_lte: query.last_updated_lte,
        created_gte: query.created_gte,
        created_lte: query.created_lte,
        ordering: query.ordering,
        limit: query.limit,
        offset: query.offset,
    };
    let (count, results) = state
        .services
        .db
        .list_exchanges(&filter)
        .map_err(internal_error)?;
    let body = json!({"count": count, "results": results});
    state.cache.put(cache_key, body.clone());
    Ok(Json(body))
}

#[derive(Debug, Deserialize, Serialize)]
pub struct MarketQuery {
    pub id: Option<i64>,
    pub exchange: Option<i64>,
    pub name: Option<String>,
    pub base: Option<String>,
    pub quote: Option<String>,
    pub volume_gte: Option<f64>,
    pub volume_lte: Option<f64>,
    pub last_gte: Option<f64>,
    pub last_lte: Option<f64>,
    pub bid_gte: Option<f64>,
    pub bid_lte: Option<f64>,
    pub ask_gte: Option<f64>,
    pub ask_lte: Option<f64>,
    pub search: Option<String>,
    pub ordering: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_markets(
    Query(query): Query<MarketQuery>,
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let cache_key = format!("markets:{}", serde_json::to_string(&query).unwrap_or_default());
    if let Some(cached) = state.cache.get(&cache_key) {
        return Ok(Json(cached));
    }
    let filter = MarketFilter {
        id: query.id,
        exchange_id: query.exchange,
        name: query.name,
        base: query.base,
        quote: query.quote,
        volume_gte: query.volume_gte,
        volume_lte: query.volume_lte,
        last_gte: query.last_gte,
        last_lte: query.last_lte,
        bid_gte: query.bid_gte,
        bid_lte: query.bid_lte,
        ask_gte: query.ask_gte,
        ask_lte: query.ask_lte,
        search: query.search,
        ordering: query.ordering,
        limit: query.limit,
        offset: query.offset,
    };
    let (count, results) = state
        .services
        .db
        .list_markets(&filter)
        .map_err(internal_error)?;
    let body = json!({"count": count, "results": results});
    state.cache.put(cache_key, body.clone());
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub exchange: Option<i64>,
    pub running: Option<bool>,
    pub last_run_gte: Option<DateTime<Utc>>,
    pub last_run_lte: Option<DateTime<Utc>>,
    pub time_started_gte: Option<DateTime<Utc>>,
    pub time_started_lte: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_statuses(
    Query(query): Query<StatusQuery>,
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let filter = StatusFilter {
        exchange_id: query.exchange,
        running: query.running,
        last_run_gte: query.last_run_gte,
        last_run_lte: query.last_run_lte,
        time_started_gte: query.time_started_gte,
        time_started_lte: query.time_started_lte,
        limit: query.limit,
        offset: query.offset,
    };
    let (count, results) = state
        .services
        .db
        .list_statuses(&filter)
        .map_err(internal_error)?;
    Ok(Json(json!({"count": count, "results": results})))
}

#[derive(Debug, Deserialize)]
pub struct RunExchangeRequest {
    pub exchange_id: i64,
}

/// Enqueue an immediate fetch for one exchange.
pub async fn run_exchange(
    State(state): State<AppState>,
    Json(request): Json<RunExchangeRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let services = &state.services;
    let exchange = services
        .db
        .get_exchange(request.exchange_id)
        .map_err(internal_error)?;
    let Some(exchange) = exchange else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("no exchange with id {}", request.exchange_id)})),
        ));
    };

    let job_id = JobQueue::new_job_id();
    let job = worker::run_job(services.clone(), exchange.id, job_id.clone());
    if let Err(e) = services.queue.enqueue(&job_id, job) {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": format!("could not enqueue fetch: {}", e)})),
        ));
    }
    info!(exchange = %exchange.name, job_id = %job_id, "accepted manual exchange run");
    Ok(Json(json!({
        "status": "MarketManager has accepted the exchange run.",
        "job_id": job_id,
    })))
}
