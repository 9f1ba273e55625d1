//! Domain models.
//!
//! Durable rows live in the snapshot store (see [`crate::storage`]); the
//! transient per-run values (`TickerBatch`, `FiatRateMap`) are produced by
//! one fetch job and discarded when it finishes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A named venue we fetch ticker data from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    pub id: i64,
    pub name: String,
    pub logo: Option<String>,
    pub url: Option<String>,
    pub api_url: Option<String>,
    /// Summary fields, written by the snapshot updater.
    pub volume: Option<f64>,
    pub top_pair: Option<String>,
    pub top_pair_volume: Option<f64>,
    /// Sticky flag: the exchange has at least one fiat-quoted pair.
    pub fiat_markets: bool,
    pub last_data_fetch: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// Seconds between scheduled fetches.
    pub interval: i64,
}

/// Run bookkeeping, one row per exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeStatus {
    pub id: i64,
    pub exchange_id: i64,
    /// Advanced only on successful completion.
    pub last_run: Option<DateTime<Utc>>,
    pub last_run_id: Option<String>,
    pub last_run_status: Option<String>,
    pub time_started: Option<DateTime<Utc>>,
    pub running: bool,
    /// Seconds after `time_started` past which the poller reaps the job.
    pub timeout: i64,
}

/// A tradable pair on an exchange, canonically named `BASE-QUOTE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub id: i64,
    pub exchange_id: i64,
    pub name: String,
    pub base: String,
    pub quote: String,
    /// Base-denominated 24h volume.
    pub volume: f64,
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
    pub open: f64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub updated: DateTime<Utc>,
}

/// Latest fiat price observed for a currency on an exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrencyFiatPrice {
    pub currency: String,
    pub exchange_id: i64,
    pub price: f64,
}

/// One normalised ticker inside a per-run batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub base: String,
    pub quote: String,
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
    pub open: f64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    /// Base-denominated volume (`baseVolume` upstream).
    pub volume: f64,
    pub exchange_id: i64,
}

/// Canonical pair name (`BASE-QUOTE`) to normalised ticker.
///
/// A `BTreeMap` so one run always iterates pairs in the same order.
pub type TickerBatch = BTreeMap<String, Ticker>;

/// Currency symbol to fiat price, derived per run.
pub type FiatRateMap = BTreeMap<String, f64>;

/// A raw upstream ticker record. Every recognised key is optional and may
/// arrive with any JSON type; unknown keys are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawTicker {
    pub symbol: Option<Value>,
    pub market: Option<Value>,
    pub name: Option<Value>,
    pub underlying: Option<Value>,
    pub base: Option<Value>,
    pub quote: Option<Value>,
    /// The venue's untouched response object, when the upstream passes it
    /// through.
    pub info: Option<Value>,
    pub last: Option<Value>,
    pub bid: Option<Value>,
    pub ask: Option<Value>,
    pub high: Option<Value>,
    pub low: Option<Value>,
    pub open: Option<Value>,
    pub close: Option<Value>,
    #[serde(rename = "baseVolume")]
    pub base_volume: Option<Value>,
}

/// Upstream key (usually `"BASE/QUOTE"`) to raw record.
pub type RawTickerMap = BTreeMap<String, RawTicker>;

/// Per-exchange summary computed from one batch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExchangeSummary {
    pub volume: f64,
    pub top_pair: String,
    pub top_pair_volume: f64,
}
