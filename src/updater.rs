//! Snapshot updater.
//!
//! Takes one run's `(exchange_id, TickerBatch, FiatRates)` and brings the
//! snapshot store in line: market rows upserted, fiat prices written, the
//! per-exchange summary recomputed and the last-fetch watermark advanced,
//! all inside one transaction. This is the only pipeline stage whose failure
//! fails the job.

use crate::config::Config;
use crate::fiat::FiatRates;
use crate::models::{ExchangeSummary, Ticker, TickerBatch};
use crate::storage::{Database, SnapshotStats};
use anyhow::Result;
use chrono::Utc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub struct ExchangeUpdater {
    db: Database,
    fiat_symbols: Vec<String>,
}

impl ExchangeUpdater {
    pub fn new(db: Database, config: &Config) -> Self {
        Self {
            db,
            fiat_symbols: config.fiat_symbols.clone(),
        }
    }

    /// Apply one batch. Retries the whole transaction once on a lock
    /// conflict; a second failure propagates to the caller.
    pub fn run(
        &self,
        exchange_id: i64,
        batch: &TickerBatch,
        rates: &FiatRates,
    ) -> Result<SnapshotStats> {
        let started = Instant::now();
        let summary = summarize(batch, rates, &self.fiat_symbols);
        if summary.is_none() {
            warn!(exchange_id, "no fiat prices available, skipping summary for this run");
        }

        let mut attempt = 0;
        let stats = loop {
            attempt += 1;
            match self.db.apply_snapshot(
                exchange_id,
                batch,
                &rates.fiat_pairs,
                summary.as_ref(),
                Utc::now(),
            ) {
                Ok(stats) => break stats,
                Err(e) if attempt == 1 && is_lock_conflict(&e) => {
                    warn!(exchange_id, error = %e, "snapshot transaction conflict, retrying once");
                    continue;
                }
                Err(e) => return Err(e),
            }
        };

        info!(
            exchange_id,
            updated = stats.updated,
            created = stats.created,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "snapshot update finished"
        );
        Ok(stats)
    }
}

fn is_lock_conflict(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
        )
    })
}

/// Compute the per-exchange summary in the canonical fiat unit.
///
/// Returns `None` when the rate map is empty; the existing summary fields
/// are then left untouched for the run. Pairs that cannot be priced are
/// skipped, never fatal. Ties on the top pair go to the later pair in
/// iteration order.
pub fn summarize(
    batch: &TickerBatch,
    rates: &FiatRates,
    fiat_symbols: &[String],
) -> Option<ExchangeSummary> {
    if rates.rates.is_empty() {
        return None;
    }
    let mut summary = ExchangeSummary::default();
    for (name, ticker) in batch {
        let Some(volume) = pair_volume(ticker, rates, fiat_symbols) else {
            debug!(pair = %name, "could not price pair, skipping in summary");
            continue;
        };
        summary.volume += volume;
        if volume >= summary.top_pair_volume {
            summary.top_pair = name.clone();
            summary.top_pair_volume = volume;
        }
    }
    Some(summary)
}

/// Convert one pair's base volume into the canonical fiat unit.
fn pair_volume(ticker: &Ticker, rates: &FiatRates, fiat_symbols: &[String]) -> Option<f64> {
    let is_fiat = |symbol: &str| fiat_symbols.iter().any(|s| s == symbol);
    let positive = |v: Option<&f64>| v.copied().filter(|p| *p > 0.0);

    let quote_price = if is_fiat(&ticker.quote) {
        Some(1.0)
    } else {
        positive(rates.rates.get(&ticker.quote))
    };
    let base_price = if is_fiat(&ticker.base) {
        Some(1.0)
    } else if quote_price.is_some() && ticker.last > 0.0 && is_fiat(&ticker.quote) {
        // The volume is base-denominated, so a fiat-quoted last price *is*
        // the base's fiat price.
        Some(ticker.last)
    } else {
        positive(rates.rates.get(&ticker.base))
    };

    if let Some(base_price) = base_price {
        return Some(ticker.volume * base_price);
    }
    if let Some(quote_price) = quote_price {
        if ticker.last > 0.0 {
            return Some(ticker.volume * ticker.last * quote_price);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiat::derive_rates;
    use crate::models::FiatRateMap;
    use crate::storage::ExchangeDetails;

    fn ticker(base: &str, quote: &str, last: f64, volume: f64) -> Ticker {
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
            volume,
            exchange_id: 1,
        }
    }

    fn bittrex_batch() -> TickerBatch {
        let mut batch = TickerBatch::new();
        batch.insert("ETH-BTC".into(), ticker("ETH", "BTC", 0.06, 100.0));
        batch.insert("BTC-USD".into(), ticker("BTC", "USD", 30_000.0, 10.0));
        batch
    }

    fn fiat() -> Vec<String> {
        vec!["USD".to_string()]
    }

    fn setup() -> (Database, i64, ExchangeUpdater) {
        let db = Database::open_in_memory().unwrap();
        let exchange = db
            .create_exchange("Bittrex", 300, &ExchangeDetails::default(), 120)
            .unwrap();
        let updater = ExchangeUpdater {
            db: db.clone(),
            fiat_symbols: fiat(),
        };
        (db, exchange.id, updater)
    }

    #[test]
    fn basic_fetch_writes_rows_and_summary() {
        let (db, exchange_id, updater) = setup();
        let batch = bittrex_batch();
        let rates = derive_rates(&batch, &fiat());
        assert_eq!(rates.fiat_pairs["BTC"], 30_000.0);
        assert_eq!(rates.rates["ETH"], 1_800.0);

        updater.run(exchange_id, &batch, &rates).unwrap();

        assert_eq!(db.markets_for_exchange(exchange_id).unwrap().len(), 2);
        let exchange = db.get_exchange(exchange_id).unwrap().unwrap();
        assert_eq!(exchange.top_pair.as_deref(), Some("BTC-USD"));
        assert_eq!(exchange.top_pair_volume, Some(300_000.0));
        // 10 * 30000 + 100 * 1800
        assert_eq!(exchange.volume, Some(480_000.0));
        assert!(exchange.last_data_fetch.is_some());
        assert_eq!(
            db.get_fiat_price("BTC", exchange_id).unwrap(),
            Some(30_000.0)
        );
    }

    #[test]
    fn refetching_the_same_batch_is_idempotent() {
        let (db, exchange_id, updater) = setup();
        let batch = bittrex_batch();
        let rates = derive_rates(&batch, &fiat());

        updater.run(exchange_id, &batch, &rates).unwrap();
        let first = db.get_exchange(exchange_id).unwrap().unwrap();
        updater.run(exchange_id, &batch, &rates).unwrap();
        let second = db.get_exchange(exchange_id).unwrap().unwrap();

        let markets = db.markets_for_exchange(exchange_id).unwrap();
        assert_eq!(markets.len(), 2);
        assert_eq!(markets[0].last, 30_000.0);
        assert_eq!(first.volume, second.volume);
        assert_eq!(first.top_pair, second.top_pair);
    }

    #[test]
    fn empty_rate_map_leaves_existing_summary_untouched() {
        let (db, exchange_id, updater) = setup();
        let batch = bittrex_batch();
        let rates = derive_rates(&batch, &fiat());
        updater.run(exchange_id, &batch, &rates).unwrap();
        let before = db.get_exchange(exchange_id).unwrap().unwrap();

        // A later batch with no fiat anchor and no fallbacks.
        let mut no_anchor = TickerBatch::new();
        no_anchor.insert("ETH-BTC".into(), ticker("ETH", "BTC", 0.05, 50.0));
        no_anchor.insert("LTC-BTC".into(), ticker("LTC", "BTC", 0.004, 5.0));
        let empty = FiatRates::default();
        updater.run(exchange_id, &no_anchor, &empty).unwrap();

        let after = db.get_exchange(exchange_id).unwrap().unwrap();
        assert_eq!(after.volume, before.volume);
        assert_eq!(after.top_pair, before.top_pair);
        assert_eq!(after.top_pair_volume, before.top_pair_volume);
        // The market rows still moved.
        assert_eq!(db.markets_for_exchange(exchange_id).unwrap().len(), 3);
        assert!(after.last_data_fetch >= before.last_data_fetch);
    }

    #[test]
    fn summary_skips_unpriceable_pairs() {
        let mut batch = TickerBatch::new();
        batch.insert("BTC-USD".into(), ticker("BTC", "USD", 30_000.0, 10.0));
        batch.insert("XYZ-ABC".into(), ticker("XYZ", "ABC", 5.0, 1_000.0));
        let rates = derive_rates(&batch, &fiat());
        let summary = summarize(&batch, &rates, &fiat()).unwrap();
        assert_eq!(summary.volume, 300_000.0);
        assert_eq!(summary.top_pair, "BTC-USD");
    }

    #[test]
    fn quote_priced_pair_uses_last_times_quote_rate() {
        // ETH has no direct rate, but its quote does; the pair is priced
        // through volume * last * rate(quote).
        let mut rates = FiatRates::default();
        rates.rates.insert("BTC".into(), 30_000.0);
        let t = ticker("ETH", "BTC", 0.06, 100.0);
        assert_eq!(pair_volume(&t, &rates, &fiat()), Some(180_000.0));
    }

    #[test]
    fn fiat_base_prices_at_unity() {
        let rates = FiatRates {
            rates: FiatRateMap::from([("BTC".to_string(), 30_000.0)]),
            fiat_pairs: FiatRateMap::new(),
        };
        let t = ticker("USD", "BTC", 0.0001, 1_000.0);
        assert_eq!(pair_volume(&t, &rates, &fiat()), Some(1_000.0));
    }

    #[test]
    fn top_pair_ties_go_to_the_later_pair() {
        let mut batch = TickerBatch::new();
        batch.insert("AAA-USD".into(), ticker("AAA", "USD", 10.0, 100.0));
        batch.insert("BBB-USD".into(), ticker("BBB", "USD", 10.0, 100.0));
        let rates = derive_rates(&batch, &fiat());
        let summary = summarize(&batch, &rates, &fiat()).unwrap();
        assert_eq!(summary.top_pair, "BBB-USD");
        assert_eq!(summary.volume, 2_000.0);
    }
}
