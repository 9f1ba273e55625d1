//! Kraken public API adapter.
//!
//! Kraken serves every ticker in one `/0/public/Ticker` call, so this is
//! the bulk-fetch path. Pair codes (`XXBTZUSD`) are mapped back to display
//! names through the `wsname` field of `/0/public/AssetPairs`.

use super::{UpstreamError, UpstreamExchange, UpstreamMarket, UpstreamUrls};
use crate::models::{RawTicker, RawTickerMap};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

const BASE_URL: &str = "https://api.kraken.com/0/public";

#[derive(Debug, Deserialize)]
struct KrakenResponse<T> {
    #[serde(default)]
    error: Vec<String>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct KrakenPair {
    wsname: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KrakenAsset {
    altname: String,
}

/// Ticker payload: `a` ask, `b` bid, `c` last trade, `o` open, `h`/`l`
/// today's and 24h high/low, `v` today's and 24h volume.
#[derive(Debug, Default, Deserialize)]
struct KrakenTicker {
    #[serde(default)]
    a: Vec<String>,
    #[serde(default)]
    b: Vec<String>,
    #[serde(default)]
    c: Vec<String>,
    #[serde(default)]
    o: Option<String>,
    #[serde(default)]
    h: Vec<String>,
    #[serde(default)]
    l: Vec<String>,
    #[serde(default)]
    v: Vec<String>,
}

pub struct Kraken {
    http: reqwest::Client,
}

impl Kraken {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .context("failed to build kraken client")?;
        Ok(Self { http })
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, UpstreamError> {
        let url = format!("{}/{}", BASE_URL, path);
        let response = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(UpstreamError::from_transport)?;
        if response.status().as_u16() == 429 {
            return Err(UpstreamError::RateLimitOrTimeout(format!(
                "kraken returned 429 for {}",
                path
            )));
        }
        if !response.status().is_success() {
            return Err(UpstreamError::Other(anyhow!(
                "kraken returned {} for {}",
                response.status(),
                path
            )));
        }
        let body: KrakenResponse<T> = response
            .json()
            .await
            .map_err(|e| UpstreamError::Other(e.into()))?;
        if let Some(error) = body.error.first() {
            return Err(classify_api_error(error));
        }
        body.result
            .ok_or_else(|| UpstreamError::Other(anyhow!("kraken response without result")))
    }

    async fn asset_pairs(&self) -> Result<BTreeMap<String, KrakenPair>, UpstreamError> {
        self.get("AssetPairs", &[]).await
    }
}

/// Kraken prefixes API errors with a class: `EAPI:Rate limit exceeded`,
/// `EQuery:Unknown asset pair`, `EService:Unavailable`, ...
fn classify_api_error(error: &str) -> UpstreamError {
    if error.contains("Rate limit") || error.starts_with("EService") {
        UpstreamError::RateLimitOrTimeout(error.to_string())
    } else if error.starts_with("EQuery") {
        UpstreamError::PerSymbol(error.to_string())
    } else {
        UpstreamError::Other(anyhow!("kraken API error: {}", error))
    }
}

fn to_raw_ticker(wsname: &str, ticker: &KrakenTicker) -> RawTicker {
    let idx = |values: &Vec<String>, i: usize| -> Option<Value> {
        values
            .get(i)
            .or_else(|| values.first())
            .map(|v| Value::String(v.clone()))
    };
    RawTicker {
        symbol: Some(json!(wsname)),
        last: idx(&ticker.c, 0),
        bid: idx(&ticker.b, 0),
        ask: idx(&ticker.a, 0),
        open: ticker.o.clone().map(Value::String),
        // Index 1 is the rolling 24h window.
        high: idx(&ticker.h, 1),
        low: idx(&ticker.l, 1),
        base_volume: idx(&ticker.v, 1),
        ..RawTicker::default()
    }
}

#[async_trait]
impl UpstreamExchange for Kraken {
    fn name(&self) -> &'static str {
        "kraken"
    }

    fn urls(&self) -> UpstreamUrls {
        UpstreamUrls {
            www: Some("https://www.kraken.com".into()),
            api: Some("https://api.kraken.com".into()),
            logo: None,
        }
    }

    fn has_fetch_tickers(&self) -> bool {
        true
    }

    fn has_fetch_markets(&self) -> bool {
        true
    }

    async fn fetch_tickers(&self) -> Result<RawTickerMap, UpstreamError> {
        let pairs = self.asset_pairs().await?;
        let tickers: BTreeMap<String, KrakenTicker> = self.get("Ticker", &[]).await?;
        let mut data = RawTickerMap::new();
        for (code, ticker) in &tickers {
            let Some(wsname) = pairs.get(code).and_then(|p| p.wsname.clone()) else {
                continue;
            };
            data.insert(wsname.clone(), to_raw_ticker(&wsname, ticker));
        }
        Ok(data)
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<RawTicker, UpstreamError> {
        let pair = symbol.replace('/', "");
        let tickers: BTreeMap<String, KrakenTicker> =
            self.get("Ticker", &[("pair", pair.as_str())]).await?;
        let (_, ticker) = tickers
            .iter()
            .next()
            .ok_or_else(|| UpstreamError::PerSymbol(format!("no ticker for {}", symbol)))?;
        Ok(to_raw_ticker(symbol, ticker))
    }

    async fn list_symbols(&self) -> Result<Vec<String>, UpstreamError> {
        let pairs = self.asset_pairs().await?;
        Ok(pairs.values().filter_map(|p| p.wsname.clone()).collect())
    }

    async fn fetch_markets(&self) -> Result<Vec<UpstreamMarket>, UpstreamError> {
        let pairs = self.asset_pairs().await?;
        Ok(pairs
            .values()
            .filter_map(|p| {
                let wsname = p.wsname.clone()?;
                let (base, quote) = wsname.split_once('/')?;
                Some(UpstreamMarket {
                    symbol: wsname.clone(),
                    base: base.to_string(),
                    quote: quote.to_string(),
                })
            })
            .collect())
    }

    async fn fetch_currencies(&self) -> Result<Vec<String>, UpstreamError> {
        let assets: BTreeMap<String, KrakenAsset> = self.get("Assets", &[]).await?;
        Ok(assets.into_values().map(|a| a.altname).collect())
    }
}
