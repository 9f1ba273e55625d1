//! Upstream exchange adapters.
//!
//! The fetch worker talks to venues through the narrow
//! [`UpstreamExchange`] capability set; concrete adapters live in the
//! submodules and are looked up by exchange name in [`by_name`]. Errors are
//! a small sum so the per-symbol fetch loop can decide to continue, break,
//! or abort without string matching.

pub mod bitfinex;
pub mod kraken;

use crate::models::{RawTicker, RawTickerMap};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Upstream failure classes.
#[derive(Debug)]
pub enum UpstreamError {
    /// Scoped to one symbol; symbol iteration continues.
    PerSymbol(String),
    /// Venue-side protection or request timeout; symbol iteration stops.
    RateLimitOrTimeout(String),
    /// Everything else; the whole fetch aborts.
    Other(anyhow::Error),
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamError::PerSymbol(msg) => write!(f, "symbol error: {}", msg),
            UpstreamError::RateLimitOrTimeout(msg) => {
                write!(f, "rate limit or timeout: {}", msg)
            }
            UpstreamError::Other(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl UpstreamError {
    /// Classify a transport-level error.
    pub fn from_transport(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UpstreamError::RateLimitOrTimeout(e.to_string())
        } else {
            UpstreamError::Other(e.into())
        }
    }
}

/// A listed market on the venue.
#[derive(Debug, Clone)]
pub struct UpstreamMarket {
    pub symbol: String,
    pub base: String,
    pub quote: String,
}

/// Informational URLs published by the venue adapter.
#[derive(Debug, Clone, Default)]
pub struct UpstreamUrls {
    pub www: Option<String>,
    pub api: Option<String>,
    pub logo: Option<String>,
}

#[async_trait]
pub trait UpstreamExchange: Send + Sync {
    fn name(&self) -> &'static str;

    fn urls(&self) -> UpstreamUrls {
        UpstreamUrls::default()
    }

    /// Whether the venue serves all tickers in one call.
    fn has_fetch_tickers(&self) -> bool;

    fn has_fetch_markets(&self) -> bool {
        false
    }

    async fn fetch_tickers(&self) -> Result<RawTickerMap, UpstreamError> {
        Err(UpstreamError::Other(anyhow!(
            "{} does not support fetch_tickers",
            self.name()
        )))
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<RawTicker, UpstreamError>;

    async fn list_symbols(&self) -> Result<Vec<String>, UpstreamError>;

    async fn fetch_markets(&self) -> Result<Vec<UpstreamMarket>, UpstreamError> {
        Err(UpstreamError::Other(anyhow!(
            "{} does not support fetch_markets",
            self.name()
        )))
    }

    /// Currency symbols listed on the venue; empty when unsupported.
    async fn fetch_currencies(&self) -> Result<Vec<String>, UpstreamError> {
        Ok(Vec::new())
    }
}

/// Look up an adapter by exchange name, case-insensitively.
pub fn by_name(name: &str) -> Result<Option<Arc<dyn UpstreamExchange>>> {
    Ok(match name.to_lowercase().as_str() {
        "kraken" => Some(Arc::new(kraken::Kraken::new()?)),
        "bitfinex" => Some(Arc::new(bitfinex::Bitfinex::new()?)),
        _ => None,
    })
}

/// Names of all known adapters.
pub fn available() -> &'static [&'static str] {
    &["kraken", "bitfinex"]
}

/// Fetch the raw ticker payload for one run.
///
/// Strategy, in order: one bulk call when the venue supports it; otherwise
/// iterate the symbol list; otherwise iterate the market list (skipping
/// non-fiat quotes on fiat-flagged exchanges). Per-symbol errors are
/// swallowed, rate limits and timeouts stop the iteration with whatever was
/// collected, anything else aborts.
pub async fn fetch_ticker_data(
    upstream: &dyn UpstreamExchange,
    fiat_markets: bool,
    fiat_symbols: &[String],
) -> Result<RawTickerMap> {
    if upstream.has_fetch_tickers() {
        return upstream
            .fetch_tickers()
            .await
            .map_err(|e| anyhow!("fetch_tickers failed for {}: {}", upstream.name(), e));
    }

    let symbols = match upstream.list_symbols().await {
        Ok(symbols) => symbols,
        Err(e) => {
            warn!(exchange = upstream.name(), error = %e, "symbol listing failed");
            Vec::new()
        }
    };
    if !symbols.is_empty() {
        debug!(
            exchange = upstream.name(),
            count = symbols.len(),
            "fetching tickers per symbol"
        );
        let mut data = RawTickerMap::new();
        for symbol in symbols {
            match upstream.fetch_ticker(&symbol).await {
                Ok(ticker) => {
                    data.insert(symbol, ticker);
                }
                Err(UpstreamError::PerSymbol(msg)) => {
                    debug!(symbol, error = %msg, "skipping symbol");
                }
                Err(UpstreamError::RateLimitOrTimeout(msg)) => {
                    warn!(exchange = upstream.name(), error = %msg, "stopping symbol iteration");
                    break;
                }
                Err(UpstreamError::Other(e)) => {
                    return Err(e.context(format!("ticker fetch aborted for {}", symbol)));
                }
            }
        }
        return Ok(data);
    }

    if upstream.has_fetch_markets() {
        let markets = upstream
            .fetch_markets()
            .await
            .map_err(|e| anyhow!("fetch_markets failed for {}: {}", upstream.name(), e))?;
        let mut data = RawTickerMap::new();
        for market in markets {
            // A fiat exchange only cares about its fiat-quoted pairs here.
            if fiat_markets && !fiat_symbols.iter().any(|s| s == &market.quote) {
                debug!(symbol = %market.symbol, "skipping non-fiat market");
                continue;
            }
            match upstream.fetch_ticker(&market.symbol).await {
                Ok(ticker) => {
                    data.insert(market.symbol, ticker);
                }
                Err(UpstreamError::PerSymbol(msg)) => {
                    debug!(symbol = %market.symbol, error = %msg, "skipping market");
                }
                Err(UpstreamError::RateLimitOrTimeout(msg)) => {
                    warn!(exchange = upstream.name(), error = %msg, "stopping market iteration");
                    break;
                }
                Err(UpstreamError::Other(e)) => {
                    return Err(e.context(format!("ticker fetch aborted for {}", market.symbol)));
                }
            }
        }
        return Ok(data);
    }

    bail!("no symbols in exchange {}", upstream.name())
}

/// Best-effort probe for fiat markets on the venue. Used to set the sticky
/// `fiat_markets` flag; probe failures just leave the flag alone.
pub async fn check_fiat_markets(
    upstream: &dyn UpstreamExchange,
    fiat_symbols: &[String],
) -> bool {
    match upstream.fetch_currencies().await {
        Ok(currencies) => {
            if currencies
                .iter()
                .any(|c| fiat_symbols.iter().any(|s| s == c))
            {
                return true;
            }
        }
        Err(e) => debug!(exchange = upstream.name(), error = %e, "currency probe failed"),
    }
    if upstream.has_fetch_markets() {
        match upstream.fetch_markets().await {
            Ok(markets) => {
                return markets
                    .iter()
                    .any(|m| fiat_symbols.iter().any(|s| s == &m.quote));
            }
            Err(e) => debug!(exchange = upstream.name(), error = %e, "market probe failed"),
        }
    }
    false
}
