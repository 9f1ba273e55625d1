//! Read API.
//!
//! A small axum surface over the snapshot store plus two historical
//! endpoints backed by the timeseries store. Everything is read-only except
//! `/run_exchange`, which enqueues an immediate fetch.

mod historical;
mod snapshot;

use crate::context::Services;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub services: Arc<Services>,
    pub cache: Arc<ResponseCache>,
}

pub fn router(services: Arc<Services>) -> Router {
    let cache = Arc::new(ResponseCache::new(Duration::from_secs(
        services.config.cache_ttl,
    )));
    let state = AppState { services, cache };
    Router::new()
        .route("/exchanges", get(snapshot::list_exchanges))
        .route("/markets", get(snapshot::list_markets))
        .route("/exchange_statuses", get(snapshot::list_statuses))
        .route("/run_exchange", post(snapshot::run_exchange))
        .route("/historical/markets", get(historical::markets))
        .route("/historical/fiat", get(historical::fiat))
        .route("/daemon_status", get(daemon_status))
        .route("/healthz", get(healthz))
        .layer(middleware::from_fn(request_logging))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// TTL cache for the hot list endpoints. A zero TTL disables it.
pub struct ResponseCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, (Instant, Value)>>,
}

impl ResponseCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        if self.ttl.is_zero() {
            return None;
        }
        let entries = self.entries.read();
        let (stored_at, value) = entries.get(key)?;
        if stored_at.elapsed() > self.ttl {
            return None;
        }
        Some(value.clone())
    }

    pub fn put(&self, key: String, value: Value) {
        if self.ttl.is_zero() {
            return;
        }
        let mut entries = self.entries.write();
        // Opportunistic sweep so the map does not grow with dead keys.
        let ttl = self.ttl;
        entries.retain(|_, (stored_at, _)| stored_at.elapsed() <= ttl);
        entries.insert(key, (Instant::now(), value));
    }
}

/// Request logging middleware; health checks are skipped to reduce noise.
async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    if path == "/healthz" {
        return next.run(request).await;
    }
    let start = Instant::now();
    let response = next.run(request).await;
    let status = response.status().as_u16();
    let latency_ms = start.elapsed().as_millis();
    if status >= 500 {
        warn!(%method, path, status, latency_ms, "request failed");
    } else {
        info!(%method, path, status, latency_ms, "request completed");
    }
    response
}

/// 200 when the scheduler/poller daemon answers on its control socket.
async fn daemon_status(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let config = &state.services.config;
    match crate::daemon::daemon_request(
        &config.daemon_host,
        config.daemon_port,
        &json!({"type": "status"}),
    )
    .await
    {
        Ok(status) => Ok(Json(status)),
        Err(e) => {
            warn!(error = %e, "daemon status check failed");
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "Can't connect to MarketManager daemon."})),
            ))
        }
    }
}

/// 200 iff both stores respond.
async fn healthz(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let services = &state.services;
    if let Err(e) = services
        .influx
        .health(&services.config.measurement_pairs)
        .await
    {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": format!("Couldn't connect to InfluxDB: {}", e)})),
        ));
    }
    if let Err(e) = services.db.health_check() {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": format!("Couldn't connect to the snapshot store: {}", e)})),
        ));
    }
    Ok(Json(json!({"status": "Service is OK"})))
}
