//! Fiat rate resolver.
//!
//! Builds the per-run map of currency symbol -> fiat price that the
//! summariser needs to express volumes in one unit. Rates are derived from
//! the batch itself wherever possible; the snapshot store and the external
//! currency service are fallbacks for batches with no fiat anchor at all.

use crate::config::Config;
use crate::models::{FiatRateMap, TickerBatch};
use crate::storage::Database;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Output of one resolution pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FiatRates {
    /// Every symbol we could price, directly or transitively.
    pub rates: FiatRateMap,
    /// Only the bases that were directly quoted against a fiat symbol in
    /// this batch; persisted verbatim to the fiat price table and the fiat
    /// timeseries.
    pub fiat_pairs: FiatRateMap,
}

/// Seed rates from fiat-quoted pairs, then run one transitive pass.
///
/// When several fiat-quoted pairs exist for one base, the first pair in
/// canonical-name order wins; the batch is a `BTreeMap`, so this is
/// deterministic.
pub fn derive_rates(batch: &TickerBatch, fiat_symbols: &[String]) -> FiatRates {
    let is_fiat = |symbol: &str| fiat_symbols.iter().any(|s| s == symbol);

    let mut rates = FiatRateMap::new();
    let mut fiat_pairs = FiatRateMap::new();
    for ticker in batch.values() {
        if is_fiat(&ticker.quote) && ticker.last > 0.0 {
            rates.entry(ticker.base.clone()).or_insert(ticker.last);
            fiat_pairs.entry(ticker.base.clone()).or_insert(ticker.last);
        }
    }

    for ticker in batch.values() {
        if ticker.last <= 0.0 || rates.contains_key(&ticker.base) {
            continue;
        }
        if let Some(quote_rate) = rates.get(&ticker.quote).copied() {
            rates.insert(ticker.base.clone(), ticker.last * quote_rate);
        }
    }

    FiatRates { rates, fiat_pairs }
}

#[derive(Debug, Deserialize)]
struct CurrencyEntry {
    symbol: String,
    price: f64,
}

#[derive(Debug, Deserialize)]
struct CurrencyListResponse {
    count: i64,
    results: Vec<CurrencyEntry>,
}

/// Client for the external currency service.
#[derive(Clone)]
pub struct CoinManagerClient {
    http: reqwest::Client,
    base_url: String,
}

impl CoinManagerClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build currency service client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetch the symbol -> fiat price list. An empty map is a valid
    /// response; transport and decode failures are errors.
    pub async fn currencies(&self) -> Result<FiatRateMap> {
        let url = format!("{}/internal/currencies/", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("currency service request failed: {}", url))?;
        if !response.status().is_success() {
            anyhow::bail!("currency service returned {}", response.status());
        }
        let body: CurrencyListResponse = response
            .json()
            .await
            .context("failed to decode currency service response")?;
        if body.count == 0 {
            warn!("currency service has no currencies");
            return Ok(FiatRateMap::new());
        }
        Ok(body
            .results
            .into_iter()
            .map(|entry| (entry.symbol, entry.price))
            .collect())
    }
}

/// Resolver combining batch-derived rates with the local and external
/// fallbacks.
#[derive(Clone)]
pub struct FiatRateResolver {
    db: Database,
    client: CoinManagerClient,
    fiat_symbols: Vec<String>,
}

impl FiatRateResolver {
    pub fn new(db: Database, client: CoinManagerClient, config: &Config) -> Self {
        Self {
            db,
            client,
            fiat_symbols: config.fiat_symbols.clone(),
        }
    }

    /// Resolve rates for one batch. Never fails: a batch with no derivable
    /// rates and no reachable fallback yields empty maps, and the caller
    /// skips summarisation for the run.
    pub async fn resolve(&self, batch: &TickerBatch) -> FiatRates {
        let mut resolved = derive_rates(batch, &self.fiat_symbols);
        if !resolved.rates.is_empty() {
            return resolved;
        }

        debug!("no fiat anchor in batch, trying local fiat-quoted markets");
        match self.db.fiat_quoted_markets(&self.fiat_symbols) {
            Ok(markets) => {
                for market in markets {
                    resolved
                        .rates
                        .entry(market.base.clone())
                        .or_insert(market.last);
                }
            }
            Err(e) => warn!(error = %e, "local fiat market lookup failed"),
        }
        if !resolved.rates.is_empty() {
            return resolved;
        }

        debug!("no local fiat markets, querying currency service");
        match self.client.currencies().await {
            Ok(rates) => resolved.rates = rates,
            Err(e) => warn!(error = %e, "currency service fallback failed"),
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Ticker;
    use crate::storage::ExchangeDetails;

    fn ticker(base: &str, quote: &str, last: f64) -> Ticker {
        Ticker {
            base: base.into(),
            quote: quote.into(),
            last,
            bid: 0.0,
            ask: 0.0,
            open: 0.0,
            close: 0.0,
            high: 0.0,
            low: 0.0,
            volume: 0.0,
            exchange_id: 1,
        }
    }

    fn batch(entries: Vec<(&str, Ticker)>) -> TickerBatch {
        entries
            .into_iter()
            .map(|(name, t)| (name.to_string(), t))
            .collect()
    }

    fn fiat() -> Vec<String> {
        vec!["USD".to_string()]
    }

    #[test]
    fn seeds_direct_fiat_pairs_and_infers_transitively() {
        let b = batch(vec![
            ("BTC-USD", ticker("BTC", "USD", 30_000.0)),
            ("ETH-BTC", ticker("ETH", "BTC", 0.06)),
        ]);
        let resolved = derive_rates(&b, &fiat());
        assert_eq!(resolved.rates["BTC"], 30_000.0);
        assert_eq!(resolved.rates["ETH"], 1_800.0);
        assert_eq!(resolved.fiat_pairs.len(), 1);
        assert_eq!(resolved.fiat_pairs["BTC"], 30_000.0);
    }

    #[test]
    fn transitive_inference_without_direct_anchor_stays_empty() {
        let b = batch(vec![
            ("ETH-BTC", ticker("ETH", "BTC", 0.06)),
            ("LTC-BTC", ticker("LTC", "BTC", 0.004)),
        ]);
        let resolved = derive_rates(&b, &fiat());
        assert!(resolved.rates.is_empty());
        assert!(resolved.fiat_pairs.is_empty());
    }

    #[test]
    fn chain_through_an_intermediate_pair_resolves() {
        // No direct USD pair for ETH, but ETH-BTC plus BTC-USD forms a chain.
        let b = batch(vec![
            ("BTC-USD", ticker("BTC", "USD", 20_000.0)),
            ("ETH-BTC", ticker("ETH", "BTC", 0.05)),
            ("XMR-ETH", ticker("XMR", "ETH", 2.0)),
        ]);
        let resolved = derive_rates(&b, &fiat());
        assert_eq!(resolved.rates["ETH"], 1_000.0);
        // Only one transitive pass: XMR would need ETH to be priced already
        // when it is visited, and "XMR-ETH" sorts after "ETH-BTC", so it is.
        assert_eq!(resolved.rates["XMR"], 2_000.0);
    }

    #[test]
    fn first_fiat_pair_in_name_order_wins_duplicates() {
        let b = batch(vec![
            ("BTC-EUR", ticker("BTC", "EUR", 28_000.0)),
            ("BTC-USD", ticker("BTC", "USD", 30_000.0)),
        ]);
        let symbols = vec!["USD".to_string(), "EUR".to_string()];
        let resolved = derive_rates(&b, &symbols);
        // "BTC-EUR" sorts first.
        assert_eq!(resolved.rates["BTC"], 28_000.0);
        assert_eq!(resolved.fiat_pairs["BTC"], 28_000.0);
    }

    #[test]
    fn zero_last_prices_never_seed() {
        let b = batch(vec![("BTC-USD", ticker("BTC", "USD", 0.0))]);
        let resolved = derive_rates(&b, &fiat());
        assert!(resolved.rates.is_empty());
    }

    #[tokio::test]
    async fn local_markets_back_fill_when_batch_has_no_anchor() {
        let db = Database::open_in_memory().unwrap();
        let exchange = db
            .create_exchange("Test", 300, &ExchangeDetails::default(), 120)
            .unwrap();
        let seeded = batch(vec![("BNB-USD", ticker("BNB", "USD", 10.0))]);
        db.apply_snapshot(
            exchange.id,
            &seeded,
            &FiatRateMap::new(),
            None,
            chrono::Utc::now(),
        )
        .unwrap();

        let resolver = FiatRateResolver {
            db,
            client: CoinManagerClient::new("http://127.0.0.1:1").unwrap(),
            fiat_symbols: fiat(),
        };
        let no_anchor = batch(vec![("ETH-BTC", ticker("ETH", "BTC", 0.06))]);
        let resolved = resolver.resolve(&no_anchor).await;
        assert_eq!(resolved.rates["BNB"], 10.0);
        assert!(resolved.fiat_pairs.is_empty());
    }

    #[tokio::test]
    async fn unreachable_service_yields_empty_rates() {
        let db = Database::open_in_memory().unwrap();
        let resolver = FiatRateResolver {
            db,
            client: CoinManagerClient::new("http://127.0.0.1:1").unwrap(),
            fiat_symbols: fiat(),
        };
        let no_anchor = batch(vec![("ETH-BTC", ticker("ETH", "BTC", 0.06))]);
        let resolved = resolver.resolve(&no_anchor).await;
        assert!(resolved.rates.is_empty());
        assert!(resolved.fiat_pairs.is_empty());
    }
}
