//! Historical endpoints over the timeseries store.

use super::AppState;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

/// Time bounds are passed straight into Flux, so only the characters that
/// can appear in RFC 3339 stamps, durations, and `now()` are allowed.
fn validate_time(value: &str) -> Result<&str, (StatusCode, Json<Value>)> {
    let ok = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-+:.()".contains(c));
    if ok {
        Ok(value)
    } else {
        Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("invalid time parameter: {}", value)})),
        ))
    }
}

fn query_error<E: std::fmt::Display>(e: E) -> (StatusCode, Json<Value>) {
    error!(error = %e, "historical query failed");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"error": "timeseries store unavailable"})),
    )
}

#[derive(Debug, Deserialize)]
pub struct HistoricalMarketsQuery {
    pub base: String,
    pub quote: String,
    pub time_start: String,
    pub time_end: Option<String>,
    pub exchange_id: Option<i64>,
}

/// Raw points from the pairs measurement, fields pivoted into columns.
pub async fn markets(
    Query(query): Query<HistoricalMarketsQuery>,
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let services = &state.services;
    let time_start = validate_time(&query.time_start)?;
    let time_end = match &query.time_end {
        Some(end) => Some(validate_time(end)?),
        None => None,
    };
    let exchange_id = query.exchange_id.map(|id| id.to_string());
    let mut tags = vec![
        ("base", query.base.as_str()),
        ("quote", query.quote.as_str()),
    ];
    if let Some(id) = &exchange_id {
        tags.push(("exchange_id", id.as_str()));
    }
    let flux = services.influx.range_query(
        &services.config.measurement_pairs,
        time_start,
        time_end,
        &tags,
        true,
    );
    let rows = services.influx.query(&flux).await.map_err(query_error)?;
    Ok(Json(json!({"count": rows.len(), "results": rows})))
}

#[derive(Debug, Deserialize)]
pub struct HistoricalFiatQuery {
    pub currency: String,
    pub time_start: String,
    pub time_end: Option<String>,
}

/// Fiat price points for one currency.
pub async fn fiat(
    Query(query): Query<HistoricalFiatQuery>,
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let services = &state.services;
    let time_start = validate_time(&query.time_start)?;
    let time_end = match &query.time_end {
        Some(end) => Some(validate_time(end)?),
        None => None,
    };
    let flux = services.influx.range_query(
        &services.config.measurement_fiat,
        time_start,
        time_end,
        &[("currency", query.currency.as_str())],
        true,
    );
    let rows = services.influx.query(&flux).await.map_err(query_error)?;
    Ok(Json(json!({"count": rows.len(), "results": rows})))
}
