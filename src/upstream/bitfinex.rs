//! Bitfinex public API adapter (v1).
//!
//! Bitfinex has no bulk ticker endpoint on v1, so this adapter exercises
//! the per-symbol path: `/symbols` for the listing, `/pubticker/{symbol}`
//! per pair. Symbols come back as compact lowercase codes (`btcusd`,
//! `dusk:usd`) and are mapped to `BASE/QUOTE` display pairs.

use super::{UpstreamError, UpstreamExchange, UpstreamUrls};
use crate::models::RawTicker;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const BASE_URL: &str = "https://api.bitfinex.com/v1";

#[derive(Debug, Deserialize)]
struct BitfinexTicker {
    last_price: Option<String>,
    bid: Option<String>,
    ask: Option<String>,
    high: Option<String>,
    low: Option<String>,
    volume: Option<String>,
}

pub struct Bitfinex {
    http: reqwest::Client,
}

impl Bitfinex {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .context("failed to build bitfinex client")?;
        Ok(Self { http })
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, UpstreamError> {
        let url = format!("{}/{}", BASE_URL, path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(UpstreamError::from_transport)?;
        match response.status().as_u16() {
            429 => Err(UpstreamError::RateLimitOrTimeout(format!(
                "bitfinex returned 429 for {}",
                path
            ))),
            400 | 404 => Err(UpstreamError::PerSymbol(format!(
                "bitfinex returned {} for {}",
                response.status(),
                path
            ))),
            status if status >= 400 => Err(UpstreamError::Other(anyhow!(
                "bitfinex returned {} for {}",
                response.status(),
                path
            ))),
            _ => Ok(response),
        }
    }
}

/// Map a compact v1 symbol code to a `BASE/QUOTE` pair.
///
/// Six-letter codes split 3/3; longer assets use an explicit colon
/// (`dusk:usd`). Anything else is unmappable.
fn to_pair(symbol: &str) -> Option<String> {
    if let Some((base, quote)) = symbol.split_once(':') {
        if base.is_empty() || quote.is_empty() {
            return None;
        }
        return Some(format!("{}/{}", base.to_uppercase(), quote.to_uppercase()));
    }
    if symbol.len() == 6 && symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
        let (base, quote) = symbol.split_at(3);
        return Some(format!("{}/{}", base.to_uppercase(), quote.to_uppercase()));
    }
    None
}

#[async_trait]
impl UpstreamExchange for Bitfinex {
    fn name(&self) -> &'static str {
        "bitfinex"
    }

    fn urls(&self) -> UpstreamUrls {
        UpstreamUrls {
            www: Some("https://www.bitfinex.com".into()),
            api: Some("https://api.bitfinex.com".into()),
            logo: None,
        }
    }

    fn has_fetch_tickers(&self) -> bool {
        false
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<RawTicker, UpstreamError> {
        let response = self.get(&format!("pubticker/{}", symbol)).await?;
        let ticker: BitfinexTicker = response
            .json()
            .await
            .map_err(|e| UpstreamError::PerSymbol(format!("bad ticker payload: {}", e)))?;
        let string_value = |v: &Option<String>| -> Option<Value> {
            v.as_ref().map(|s| Value::String(s.clone()))
        };
        Ok(RawTicker {
            symbol: to_pair(symbol).map(|p| json!(p)),
            last: string_value(&ticker.last_price),
            bid: string_value(&ticker.bid),
            ask: string_value(&ticker.ask),
            high: string_value(&ticker.high),
            low: string_value(&ticker.low),
            base_volume: string_value(&ticker.volume),
            ..RawTicker::default()
        })
    }

    async fn list_symbols(&self) -> Result<Vec<String>, UpstreamError> {
        let response = self.get("symbols").await?;
        let symbols: Vec<String> = response
            .json()
            .await
            .map_err(|e| UpstreamError::Other(anyhow!("bad symbols payload: {}", e)))?;
        Ok(symbols)
    }
}
