//! Fetch worker.
//!
//! End-to-end execution of a single exchange fetch: load the exchange,
//! probe for fiat markets, pull tickers from the upstream adapter, parse,
//! resolve fiat rates, write the timeseries, and commit the snapshot. Only
//! the snapshot updater's result decides the job outcome; the timeseries
//! write is best-effort.

use crate::context::Services;
use crate::parser;
use crate::upstream;
use anyhow::{anyhow, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn, Instrument};

/// Queue entry point: runs the fetch and reconciles the status row on
/// failure. Every log line carries the job id for correlation.
pub async fn run_job(services: Arc<Services>, exchange_id: i64, job_id: String) {
    let span = tracing::info_span!("fetch_job", job_id = %job_id, exchange_id);
    async {
        match fetch_exchange_data(&services, exchange_id, &job_id).await {
            Ok(message) => info!(result = %message, "fetch job finished"),
            Err(e) => {
                error!(error = %e, "fetch job failed");
                if let Err(status_err) = services.db.fail_run(exchange_id, &e.to_string()) {
                    error!(error = %status_err, "failed to record job failure");
                }
            }
        }
    }
    .instrument(span)
    .await;
}

/// The fetch pipeline itself. Callers that invoke this directly (the CLI's
/// foreground mode) get the same status bookkeeping as queued jobs.
pub async fn fetch_exchange_data(
    services: &Services,
    exchange_id: i64,
    job_id: &str,
) -> Result<String> {
    let db = &services.db;
    let config = &services.config;

    let Some(exchange) = db.get_exchange(exchange_id)? else {
        // Unknown exchange: clear the flag if a stale status row exists and
        // report, nothing else to reconcile.
        let _ = db.clear_running(exchange_id);
        return Err(anyhow!("no exchange with id {}", exchange_id));
    };
    info!(exchange = %exchange.name, "got exchange");

    let upstream_exchange = upstream::by_name(&exchange.name)?
        .ok_or_else(|| anyhow!("exchange {} doesn't exist in the upstream library", exchange.name))?;

    db.ensure_status(exchange_id, config.exchange_timeout)?;
    db.mark_running(exchange_id, job_id, Utc::now())?;

    let mut fiat_markets = exchange.fiat_markets;
    if !fiat_markets {
        if upstream::check_fiat_markets(upstream_exchange.as_ref(), &config.fiat_symbols).await {
            info!(exchange = %exchange.name, "exchange has fiat markets, setting sticky flag");
            db.set_fiat_markets(exchange_id)?;
            fiat_markets = true;
        }
    }

    info!("fetching tickers");
    let raw = upstream::fetch_ticker_data(
        upstream_exchange.as_ref(),
        fiat_markets,
        &config.fiat_symbols,
    )
    .await?;

    info!(entries = raw.len(), "parsing the data");
    let batch = parser::parse_market_data(&raw, exchange_id);

    info!(pairs = batch.len(), "resolving fiat rates");
    let rates = services.resolver.resolve(&batch).await;

    // History first, snapshot second; neither depends on the other and the
    // snapshot result alone decides the outcome.
    if let Err(e) = services
        .influx_updater
        .write(exchange_id, &batch, &rates.fiat_pairs)
        .await
    {
        warn!(error = %e, "timeseries updater failed");
    }

    let stats = services.updater.run(exchange_id, &batch, &rates)?;

    db.finish_run(exchange_id, Utc::now())?;
    Ok(format!(
        "updater finished successfully ({} updated, {} created)",
        stats.updated, stats.created
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::Database;

    #[tokio::test]
    async fn unknown_exchange_fails_fast_without_state_changes() {
        let db = Database::open_in_memory().unwrap();
        let services = Services::with_database(Config::for_tests(), db.clone()).unwrap();
        let err = fetch_exchange_data(&services, 42, "job-1").await.unwrap_err();
        assert!(err.to_string().contains("no exchange with id 42"));
        assert!(db.get_status(42).unwrap().is_none());
    }

    #[tokio::test]
    async fn exchange_missing_upstream_reports_diagnostic() {
        let db = Database::open_in_memory().unwrap();
        let exchange = db
            .create_exchange("NotAVenue", 300, &Default::default(), 120)
            .unwrap();
        let services = Services::with_database(Config::for_tests(), db.clone()).unwrap();

        run_job(services.clone(), exchange.id, "job-1".to_string()).await;

        let status = db.get_status(exchange.id).unwrap().unwrap();
        assert!(!status.running);
        assert!(status.last_run.is_none());
        assert!(status
            .last_run_status
            .unwrap()
            .contains("doesn't exist in the upstream library"));
    }
}
