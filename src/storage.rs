//! SQLite-backed snapshot store.
//!
//! One `Database` handle is shared by the scheduler, the poller, the fetch
//! workers and the API. All methods are synchronous and hold the connection
//! lock only for the duration of the statement; multi-row mutations go
//! through explicit transactions.
//!
//! Key properties:
//! - WAL mode for concurrent reads during writes
//! - the run claim is a single conditional UPDATE, so at most one dispatch
//!   can win the `running: false -> true` transition
//! - the snapshot update is one IMMEDIATE transaction that either fully
//!   applies a batch or leaves the store untouched

use crate::models::{
    CurrencyFiatPrice, Exchange, ExchangeStatus, ExchangeSummary, Market, TickerBatch,
};
use crate::models::FiatRateMap;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, Row, ToSql, TransactionBehavior};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS exchanges (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    logo TEXT,
    url TEXT,
    api_url TEXT,
    volume REAL,
    top_pair TEXT,
    top_pair_volume REAL,
    fiat_markets INTEGER NOT NULL DEFAULT 0,
    last_data_fetch TEXT,
    enabled INTEGER NOT NULL DEFAULT 1,
    created TEXT NOT NULL,
    updated TEXT NOT NULL,
    interval INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS exchange_status (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exchange_id INTEGER NOT NULL UNIQUE REFERENCES exchanges(id) ON DELETE CASCADE,
    last_run TEXT,
    last_run_id TEXT,
    last_run_status TEXT,
    time_started TEXT,
    running INTEGER NOT NULL DEFAULT 0,
    timeout INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS markets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exchange_id INTEGER NOT NULL REFERENCES exchanges(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    base TEXT NOT NULL,
    quote TEXT NOT NULL,
    volume REAL NOT NULL DEFAULT 0,
    last REAL NOT NULL DEFAULT 0,
    bid REAL NOT NULL DEFAULT 0,
    ask REAL NOT NULL DEFAULT 0,
    open REAL NOT NULL DEFAULT 0,
    close REAL NOT NULL DEFAULT 0,
    high REAL NOT NULL DEFAULT 0,
    low REAL NOT NULL DEFAULT 0,
    updated TEXT NOT NULL,
    UNIQUE(exchange_id, name)
);

CREATE TABLE IF NOT EXISTS currency_fiat_prices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    currency TEXT NOT NULL,
    exchange_id INTEGER NOT NULL REFERENCES exchanges(id) ON DELETE CASCADE,
    price REAL NOT NULL,
    UNIQUE(currency, exchange_id)
);

CREATE INDEX IF NOT EXISTS idx_markets_quote ON markets(quote);
CREATE INDEX IF NOT EXISTS idx_markets_updated ON markets(updated);
CREATE INDEX IF NOT EXISTS idx_status_running ON exchange_status(running);
"#;

/// Timestamps are stored as RFC 3339 UTC with fixed precision, so string
/// comparison in SQL matches chronological order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn opt_ts(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

/// Informational URLs attached to an exchange at creation time.
#[derive(Debug, Clone, Default)]
pub struct ExchangeDetails {
    pub url: Option<String>,
    pub api_url: Option<String>,
    pub logo: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ExchangeFilter {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub interval: Option<i64>,
    pub volume_gte: Option<f64>,
    pub volume_lte: Option<f64>,
    pub updated_gte: Option<DateTime<Utc>>,
    pub updated_lte: Option<DateTime<Utc>>,
    pub created_gte: Option<DateTime<Utc>>,
    pub created_lte: Option<DateTime<Utc>>,
    pub ordering: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Default, Clone)]
pub struct MarketFilter {
    pub id: Option<i64>,
    pub exchange_id: Option<i64>,
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
    /// Substring match against base or quote.
    pub search: Option<String>,
    pub ordering: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Default, Clone)]
pub struct StatusFilter {
    pub exchange_id: Option<i64>,
    pub running: Option<bool>,
    pub last_run_gte: Option<DateTime<Utc>>,
    pub last_run_lte: Option<DateTime<Utc>>,
    pub time_started_gte: Option<DateTime<Utc>>,
    pub time_started_lte: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Row counts out of one snapshot transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotStats {
    pub updated: usize,
    pub created: usize,
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {}", path))?;
        Self::init(conn)
    }

    /// Private in-memory database, used by tests and the foreground CLI dry
    /// paths.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("failed to open in-memory database")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply database schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ------------------------------------------------------------------
    // Exchanges
    // ------------------------------------------------------------------

    pub fn create_exchange(
        &self,
        name: &str,
        interval: i64,
        details: &ExchangeDetails,
        default_timeout: i64,
    ) -> Result<Exchange> {
        let now = ts(Utc::now());
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO exchanges (name, logo, url, api_url, enabled, fiat_markets, created, updated, interval)
             VALUES (?1, ?2, ?3, ?4, 1, 0, ?5, ?5, ?6)",
            params![name, details.logo, details.url, details.api_url, now, interval],
        )
        .with_context(|| format!("failed to create exchange {}", name))?;
        let id = conn.last_insert_rowid();
        conn.execute(
            "INSERT OR IGNORE INTO exchange_status (exchange_id, running, timeout) VALUES (?1, 0, ?2)",
            params![id, default_timeout],
        )?;
        drop(conn);
        self.get_exchange(id)?
            .context("exchange vanished right after creation")
    }

    pub fn get_exchange(&self, id: i64) -> Result<Option<Exchange>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM exchanges WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], exchange_from_row)?;
        Ok(rows.next().transpose()?)
    }

    pub fn get_exchange_by_name(&self, name: &str) -> Result<Option<Exchange>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM exchanges WHERE name = ?1")?;
        let mut rows = stmt.query_map(params![name], exchange_from_row)?;
        Ok(rows.next().transpose()?)
    }

    pub fn enabled_exchanges(&self) -> Result<Vec<Exchange>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM exchanges WHERE enabled = 1 ORDER BY id")?;
        let rows = stmt.query_map([], exchange_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn all_exchanges(&self) -> Result<Vec<Exchange>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM exchanges ORDER BY id")?;
        let rows = stmt.query_map([], exchange_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Returns the number of rows changed.
    pub fn set_exchange_enabled(&self, id: i64, enabled: bool) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "UPDATE exchanges SET enabled = ?2, updated = ?3 WHERE id = ?1",
            params![id, enabled, ts(Utc::now())],
        )?)
    }

    pub fn set_all_exchanges_enabled(&self, enabled: bool) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "UPDATE exchanges SET enabled = ?1, updated = ?2",
            params![enabled, ts(Utc::now())],
        )?)
    }

    /// Sticky: only ever flips the flag on.
    pub fn set_fiat_markets(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE exchanges SET fiat_markets = 1, updated = ?2 WHERE id = ?1",
            params![id, ts(Utc::now())],
        )?;
        Ok(())
    }

    pub fn list_exchanges(&self, filter: &ExchangeFilter) -> Result<(i64, Vec<Exchange>)> {
        let mut where_sql: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(name) = &filter.name {
            where_sql.push("name = ?".into());
            args.push(Box::new(name.clone()));
        }
        if let Some(enabled) = filter.enabled {
            where_sql.push("enabled = ?".into());
            args.push(Box::new(enabled));
        }
        if let Some(interval) = filter.interval {
            where_sql.push("interval = ?".into());
            args.push(Box::new(interval));
        }
        if let Some(v) = filter.volume_gte {
            where_sql.push("volume >= ?".into());
            args.push(Box::new(v));
        }
        if let Some(v) = filter.volume_lte {
            where_sql.push("volume <= ?".into());
            args.push(Box::new(v));
        }
        if let Some(t) = filter.updated_gte {
            where_sql.push("updated >= ?".into());
            args.push(Box::new(ts(t)));
        }
        if let Some(t) = filter.updated_lte {
            where_sql.push("updated <= ?".into());
            args.push(Box::new(ts(t)));
        }
        if let Some(t) = filter.created_gte {
            where_sql.push("created >= ?".into());
            args.push(Box::new(ts(t)));
        }
        if let Some(t) = filter.created_lte {
            where_sql.push("created <= ?".into());
            args.push(Box::new(ts(t)));
        }
        let order = order_clause(
            filter.ordering.as_deref(),
            &["name", "volume", "top_pair", "top_pair_volume"],
            "name",
        );
        self.paged_query(
            "exchanges",
            &where_sql,
            args,
            &order,
            filter.limit,
            filter.offset,
            exchange_from_row,
        )
    }

    // ------------------------------------------------------------------
    // Exchange status
    // ------------------------------------------------------------------

    /// Fetch the status row for an exchange, creating it on first sight.
    pub fn ensure_status(&self, exchange_id: i64, default_timeout: i64) -> Result<ExchangeStatus> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO exchange_status (exchange_id, running, timeout) VALUES (?1, 0, ?2)",
            params![exchange_id, default_timeout],
        )?;
        let mut stmt = conn.prepare("SELECT * FROM exchange_status WHERE exchange_id = ?1")?;
        let mut rows = stmt.query_map(params![exchange_id], status_from_row)?;
        rows.next()
            .transpose()?
            .with_context(|| format!("no status row for exchange {}", exchange_id))
    }

    pub fn get_status(&self, exchange_id: i64) -> Result<Option<ExchangeStatus>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM exchange_status WHERE exchange_id = ?1")?;
        let mut rows = stmt.query_map(params![exchange_id], status_from_row)?;
        Ok(rows.next().transpose()?)
    }

    pub fn running_statuses(&self) -> Result<Vec<ExchangeStatus>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM exchange_status WHERE running = 1 ORDER BY exchange_id")?;
        let rows = stmt.query_map([], status_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Atomically claim the `running: false -> true` transition for a
    /// dispatch. Returns false when another dispatch already holds the run.
    pub fn claim_run(&self, exchange_id: i64, job_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE exchange_status SET running = 1, time_started = ?2, last_run_id = ?3
             WHERE exchange_id = ?1 AND running = 0",
            params![exchange_id, ts(now), job_id],
        )?;
        Ok(changed == 1)
    }

    /// Idempotent start marker used by the fetch worker; the scheduler's
    /// claim may already have set these fields at dispatch time.
    pub fn mark_running(&self, exchange_id: i64, job_id: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE exchange_status SET running = 1, time_started = ?2, last_run_id = ?3
             WHERE exchange_id = ?1",
            params![exchange_id, ts(now), job_id],
        )?;
        Ok(())
    }

    /// Successful completion: clear the flag and advance the watermark.
    pub fn finish_run(&self, exchange_id: i64, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE exchange_status SET running = 0, last_run = ?2 WHERE exchange_id = ?1",
            params![exchange_id, ts(now)],
        )?;
        Ok(())
    }

    /// Failure: clear the flag, record the diagnostic, leave `last_run`
    /// untouched.
    pub fn fail_run(&self, exchange_id: i64, diagnostic: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE exchange_status SET running = 0, last_run_status = ?2 WHERE exchange_id = ?1",
            params![exchange_id, diagnostic],
        )?;
        Ok(())
    }

    /// Defensive clear for statuses that claim to run without a start time.
    pub fn clear_running(&self, exchange_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE exchange_status SET running = 0 WHERE exchange_id = ?1",
            params![exchange_id],
        )?;
        Ok(())
    }

    pub fn list_statuses(&self, filter: &StatusFilter) -> Result<(i64, Vec<ExchangeStatus>)> {
        let mut where_sql: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(id) = filter.exchange_id {
            where_sql.push("exchange_id = ?".into());
            args.push(Box::new(id));
        }
        if let Some(running) = filter.running {
            where_sql.push("running = ?".into());
            args.push(Box::new(running));
        }
        if let Some(t) = filter.last_run_gte {
            where_sql.push("last_run >= ?".into());
            args.push(Box::new(ts(t)));
        }
        if let Some(t) = filter.last_run_lte {
            where_sql.push("last_run <= ?".into());
            args.push(Box::new(ts(t)));
        }
        if let Some(t) = filter.time_started_gte {
            where_sql.push("time_started >= ?".into());
            args.push(Box::new(ts(t)));
        }
        if let Some(t) = filter.time_started_lte {
            where_sql.push("time_started <= ?".into());
            args.push(Box::new(ts(t)));
        }
        self.paged_query(
            "exchange_status",
            &where_sql,
            args,
            "ORDER BY exchange_id",
            filter.limit,
            filter.offset,
            status_from_row,
        )
    }

    // ------------------------------------------------------------------
    // Markets
    // ------------------------------------------------------------------

    pub fn markets_for_exchange(&self, exchange_id: i64) -> Result<Vec<Market>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM markets WHERE exchange_id = ?1 ORDER BY name")?;
        let rows = stmt.query_map(params![exchange_id], market_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_market(&self, exchange_id: i64, name: &str) -> Result<Option<Market>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM markets WHERE exchange_id = ?1 AND name = ?2")?;
        let mut rows = stmt.query_map(params![exchange_id, name], market_from_row)?;
        Ok(rows.next().transpose()?)
    }

    /// Markets quoted in one of the given fiat symbols, across all
    /// exchanges. Feeds the fiat resolver's local fallback.
    pub fn fiat_quoted_markets(&self, fiat_symbols: &[String]) -> Result<Vec<Market>> {
        if fiat_symbols.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; fiat_symbols.len()].join(", ");
        let sql = format!(
            "SELECT * FROM markets WHERE quote IN ({}) ORDER BY name",
            placeholders
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(fiat_symbols.iter()), market_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list_markets(&self, filter: &MarketFilter) -> Result<(i64, Vec<Market>)> {
        let mut where_sql: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(id) = filter.id {
            where_sql.push("id = ?".into());
            args.push(Box::new(id));
        }
        if let Some(id) = filter.exchange_id {
            where_sql.push("exchange_id = ?".into());
            args.push(Box::new(id));
        }
        if let Some(name) = &filter.name {
            where_sql.push("name = ?".into());
            args.push(Box::new(name.clone()));
        }
        if let Some(base) = &filter.base {
            where_sql.push("base = ?".into());
            args.push(Box::new(base.clone()));
        }
        if let Some(quote) = &filter.quote {
            where_sql.push("quote = ?".into());
            args.push(Box::new(quote.clone()));
        }
        for (column, gte, lte) in [
            ("volume", filter.volume_gte, filter.volume_lte),
            ("last", filter.last_gte, filter.last_lte),
            ("bid", filter.bid_gte, filter.bid_lte),
            ("ask", filter.ask_gte, filter.ask_lte),
        ] {
            if let Some(v) = gte {
                where_sql.push(format!("{} >= ?", column));
                args.push(Box::new(v));
            }
            if let Some(v) = lte {
                where_sql.push(format!("{} <= ?", column));
                args.push(Box::new(v));
            }
        }
        if let Some(search) = &filter.search {
            where_sql.push("(base LIKE ? OR quote LIKE ?)".into());
            let pattern = format!("%{}%", search);
            args.push(Box::new(pattern.clone()));
            args.push(Box::new(pattern));
        }
        let order = order_clause(
            filter.ordering.as_deref(),
            &["name", "volume", "bid", "ask", "base"],
            "name",
        );
        self.paged_query(
            "markets",
            &where_sql,
            args,
            &order,
            filter.limit,
            filter.offset,
            market_from_row,
        )
    }

    /// Delete markets not updated within the staleness horizon. Returns the
    /// number of rows removed.
    pub fn delete_stale_markets(&self, now: DateTime<Utc>, stale_days: i64) -> Result<usize> {
        let horizon = ts(now - Duration::days(stale_days));
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM markets WHERE updated <= ?1", params![horizon])?;
        if removed > 0 {
            info!(removed, "cleared stale markets");
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Fiat prices
    // ------------------------------------------------------------------

    pub fn get_fiat_price(&self, currency: &str, exchange_id: i64) -> Result<Option<f64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT price FROM currency_fiat_prices WHERE currency = ?1 AND exchange_id = ?2",
        )?;
        let mut rows = stmt.query_map(params![currency, exchange_id], |row| row.get(0))?;
        Ok(rows.next().transpose()?)
    }

    pub fn fiat_prices_for_exchange(&self, exchange_id: i64) -> Result<Vec<CurrencyFiatPrice>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT currency, exchange_id, price FROM currency_fiat_prices
             WHERE exchange_id = ?1 ORDER BY currency",
        )?;
        let rows = stmt.query_map(params![exchange_id], |row| {
            Ok(CurrencyFiatPrice {
                currency: row.get(0)?,
                exchange_id: row.get(1)?,
                price: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ------------------------------------------------------------------
    // Snapshot transaction
    // ------------------------------------------------------------------

    /// Apply one fetch run's batch in a single transaction: update existing
    /// market rows, insert the rest, upsert fiat prices, optionally write
    /// the summary, and advance the last-fetch watermark.
    ///
    /// Rows present in the store but absent from the batch are left alone;
    /// they age out through [`Database::delete_stale_markets`].
    pub fn apply_snapshot(
        &self,
        exchange_id: i64,
        batch: &TickerBatch,
        fiat_pairs: &FiatRateMap,
        summary: Option<&ExchangeSummary>,
        now: DateTime<Utc>,
    ) -> Result<SnapshotStats> {
        let now_sql = ts(now);
        let mut stats = SnapshotStats::default();
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut remaining: BTreeMap<&str, &crate::models::Ticker> =
                batch.iter().map(|(k, v)| (k.as_str(), v)).collect();

            let existing: Vec<String> = {
                let mut stmt = tx.prepare("SELECT name FROM markets WHERE exchange_id = ?1")?;
                let rows = stmt.query_map(params![exchange_id], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };

            let mut update = tx.prepare(
                "UPDATE markets SET base = ?3, quote = ?4, last = ?5, bid = ?6, ask = ?7,
                     open = ?8, close = ?9, high = ?10, low = ?11, volume = ?12, updated = ?13
                 WHERE exchange_id = ?1 AND name = ?2",
            )?;
            for name in &existing {
                if let Some(t) = remaining.remove(name.as_str()) {
                    update.execute(params![
                        exchange_id,
                        name,
                        t.base,
                        t.quote,
                        t.last,
                        t.bid,
                        t.ask,
                        t.open,
                        t.close,
                        t.high,
                        t.low,
                        t.volume,
                        now_sql,
                    ])?;
                    stats.updated += 1;
                }
            }

            let mut insert = tx.prepare(
                "INSERT INTO markets (exchange_id, name, base, quote, last, bid, ask,
                     open, close, high, low, volume, updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )?;
            for (name, t) in remaining {
                insert.execute(params![
                    exchange_id,
                    name,
                    t.base,
                    t.quote,
                    t.last,
                    t.bid,
                    t.ask,
                    t.open,
                    t.close,
                    t.high,
                    t.low,
                    t.volume,
                    now_sql,
                ])?;
                stats.created += 1;
            }

            let mut upsert = tx.prepare(
                "INSERT INTO currency_fiat_prices (currency, exchange_id, price)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(currency, exchange_id) DO UPDATE SET price = excluded.price",
            )?;
            for (currency, price) in fiat_pairs {
                upsert.execute(params![currency, exchange_id, price])?;
            }

            if let Some(s) = summary {
                tx.execute(
                    "UPDATE exchanges SET volume = ?2, top_pair = ?3, top_pair_volume = ?4, updated = ?5
                     WHERE id = ?1",
                    params![exchange_id, s.volume, s.top_pair, s.top_pair_volume, now_sql],
                )?;
            }

            tx.execute(
                "UPDATE exchanges SET last_data_fetch = ?2, updated = ?2 WHERE id = ?1",
                params![exchange_id, now_sql],
            )?;
        }
        tx.commit()?;
        debug!(
            exchange_id,
            updated = stats.updated,
            created = stats.created,
            "snapshot transaction committed"
        );
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    pub fn health_check(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM exchanges", [], |row| row.get(0))?;
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn paged_query<T, F>(
        &self,
        table: &str,
        where_sql: &[String],
        args: Vec<Box<dyn ToSql>>,
        order: &str,
        limit: Option<i64>,
        offset: Option<i64>,
        map_row: F,
    ) -> Result<(i64, Vec<T>)>
    where
        F: Fn(&Row<'_>) -> rusqlite::Result<T>,
    {
        let where_clause = if where_sql.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", where_sql.join(" AND "))
        };
        let conn = self.conn.lock();
        let count_sql = format!("SELECT COUNT(*) FROM {}{}", table, where_clause);
        let count: i64 = conn.query_row(
            &count_sql,
            params_from_iter(args.iter().map(|a| a.as_ref())),
            |row| row.get(0),
        )?;

        let page_sql = format!(
            "SELECT * FROM {}{} {} LIMIT ? OFFSET ?",
            table, where_clause, order
        );
        let mut all_args: Vec<Box<dyn ToSql>> = args;
        all_args.push(Box::new(limit.unwrap_or(10_000)));
        all_args.push(Box::new(offset.unwrap_or(0)));
        let mut stmt = conn.prepare(&page_sql)?;
        let rows = stmt.query_map(
            params_from_iter(all_args.iter().map(|a| a.as_ref())),
            map_row,
        )?;
        let results = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((count, results))
    }
}

#[cfg(test)]
impl Database {
    /// Raw connection access for tests that need to fabricate odd states.
    pub(crate) fn with_raw<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> rusqlite::Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }
}

/// Build an ORDER BY clause from a `?ordering=` value, restricted to the
/// allowed columns. A leading `-` reverses the order.
fn order_clause(requested: Option<&str>, allowed: &[&str], default: &str) -> String {
    let (field, desc) = match requested {
        Some(s) if s.starts_with('-') => (&s[1..], true),
        Some(s) => (s, false),
        None => (default, false),
    };
    let column = if allowed.contains(&field) { field } else { default };
    format!("ORDER BY {}{}", column, if desc { " DESC" } else { "" })
}

fn exchange_from_row(row: &Row<'_>) -> rusqlite::Result<Exchange> {
    Ok(Exchange {
        id: row.get("id")?,
        name: row.get("name")?,
        logo: row.get("logo")?,
        url: row.get("url")?,
        api_url: row.get("api_url")?,
        volume: row.get("volume")?,
        top_pair: row.get("top_pair")?,
        top_pair_volume: row.get("top_pair_volume")?,
        fiat_markets: row.get("fiat_markets")?,
        last_data_fetch: opt_ts(row.get("last_data_fetch")?)?,
        enabled: row.get("enabled")?,
        created: parse_ts(&row.get::<_, String>("created")?)?,
        updated: parse_ts(&row.get::<_, String>("updated")?)?,
        interval: row.get("interval")?,
    })
}

fn status_from_row(row: &Row<'_>) -> rusqlite::Result<ExchangeStatus> {
    Ok(ExchangeStatus {
        id: row.get("id")?,
        exchange_id: row.get("exchange_id")?,
        last_run: opt_ts(row.get("last_run")?)?,
        last_run_id: row.get("last_run_id")?,
        last_run_status: row.get("last_run_status")?,
        time_started: opt_ts(row.get("time_started")?)?,
        running: row.get("running")?,
        timeout: row.get("timeout")?,
    })
}

fn market_from_row(row: &Row<'_>) -> rusqlite::Result<Market> {
    Ok(Market {
        id: row.get("id")?,
        exchange_id: row.get("exchange_id")?,
        name: row.get("name")?,
        base: row.get("base")?,
        quote: row.get("quote")?,
        volume: row.get("volume")?,
        last: row.get("last")?,
        bid: row.get("bid")?,
        ask: row.get("ask")?,
        open: row.get("open")?,
        close: row.get("close")?,
        high: row.get("high")?,
        low: row.get("low")?,
        updated: parse_ts(&row.get::<_, String>("updated")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Ticker;

    fn db_with_exchange() -> (Database, Exchange) {
        let db = Database::open_in_memory().unwrap();
        let exchange = db
            .create_exchange("Bittrex", 300, &ExchangeDetails::default(), 120)
            .unwrap();
        (db, exchange)
    }

    fn ticker(base: &str, quote: &str, last: f64, volume: f64, exchange_id: i64) -> Ticker {
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
            exchange_id,
        }
    }

    #[test]
    fn create_exchange_also_creates_status_row() {
        let (db, exchange) = db_with_exchange();
        let status = db.get_status(exchange.id).unwrap().unwrap();
        assert!(!status.running);
        assert_eq!(status.timeout, 120);
        assert!(status.last_run.is_none());
    }

    #[test]
    fn duplicate_exchange_name_is_rejected() {
        let (db, _) = db_with_exchange();
        assert!(db
            .create_exchange("Bittrex", 60, &ExchangeDetails::default(), 120)
            .is_err());
    }

    #[test]
    fn claim_run_admits_exactly_one_dispatch() {
        let (db, exchange) = db_with_exchange();
        let now = Utc::now();
        assert!(db.claim_run(exchange.id, "job-1", now).unwrap());
        assert!(!db.claim_run(exchange.id, "job-2", now).unwrap());

        let status = db.get_status(exchange.id).unwrap().unwrap();
        assert!(status.running);
        assert_eq!(status.last_run_id.as_deref(), Some("job-1"));
        assert!(status.time_started.is_some());
    }

    #[test]
    fn finish_run_clears_flag_and_advances_watermark() {
        let (db, exchange) = db_with_exchange();
        let now = Utc::now();
        db.claim_run(exchange.id, "job-1", now).unwrap();
        db.finish_run(exchange.id, now).unwrap();
        let status = db.get_status(exchange.id).unwrap().unwrap();
        assert!(!status.running);
        assert_eq!(status.last_run.map(|t| t.timestamp()), Some(now.timestamp()));
    }

    #[test]
    fn fail_run_records_diagnostic_without_advancing_last_run() {
        let (db, exchange) = db_with_exchange();
        db.claim_run(exchange.id, "job-1", Utc::now()).unwrap();
        db.fail_run(exchange.id, "Timeout reached").unwrap();
        let status = db.get_status(exchange.id).unwrap().unwrap();
        assert!(!status.running);
        assert!(status.last_run.is_none());
        assert_eq!(status.last_run_status.as_deref(), Some("Timeout reached"));
    }

    #[test]
    fn apply_snapshot_inserts_then_updates() {
        let (db, exchange) = db_with_exchange();
        let mut batch = TickerBatch::new();
        batch.insert("ETH-BTC".into(), ticker("ETH", "BTC", 0.06, 100.0, exchange.id));

        let stats = db
            .apply_snapshot(exchange.id, &batch, &FiatRateMap::new(), None, Utc::now())
            .unwrap();
        assert_eq!(stats, SnapshotStats { updated: 0, created: 1 });

        batch.get_mut("ETH-BTC").unwrap().last = 0.07;
        let stats = db
            .apply_snapshot(exchange.id, &batch, &FiatRateMap::new(), None, Utc::now())
            .unwrap();
        assert_eq!(stats, SnapshotStats { updated: 1, created: 0 });

        let market = db.get_market(exchange.id, "ETH-BTC").unwrap().unwrap();
        assert_eq!(market.last, 0.07);
        let exchange = db.get_exchange(exchange.id).unwrap().unwrap();
        assert!(exchange.last_data_fetch.is_some());
        // No summary was supplied, so the fields stay unset.
        assert!(exchange.volume.is_none());
    }

    #[test]
    fn markets_absent_from_batch_persist() {
        let (db, exchange) = db_with_exchange();
        let mut batch = TickerBatch::new();
        batch.insert("ETH-BTC".into(), ticker("ETH", "BTC", 0.06, 100.0, exchange.id));
        batch.insert("LTC-BTC".into(), ticker("LTC", "BTC", 0.004, 10.0, exchange.id));
        db.apply_snapshot(exchange.id, &batch, &FiatRateMap::new(), None, Utc::now())
            .unwrap();

        batch.remove("LTC-BTC");
        db.apply_snapshot(exchange.id, &batch, &FiatRateMap::new(), None, Utc::now())
            .unwrap();
        assert_eq!(db.markets_for_exchange(exchange.id).unwrap().len(), 2);
    }

    #[test]
    fn stale_markets_are_garbage_collected() {
        let (db, exchange) = db_with_exchange();
        let mut batch = TickerBatch::new();
        batch.insert("ETH-BTC".into(), ticker("ETH", "BTC", 0.06, 100.0, exchange.id));
        let old = Utc::now() - Duration::days(10);
        db.apply_snapshot(exchange.id, &batch, &FiatRateMap::new(), None, old)
            .unwrap();

        let mut fresh = TickerBatch::new();
        fresh.insert("BTC-USD".into(), ticker("BTC", "USD", 30_000.0, 10.0, exchange.id));
        db.apply_snapshot(exchange.id, &fresh, &FiatRateMap::new(), None, Utc::now())
            .unwrap();

        let removed = db.delete_stale_markets(Utc::now(), 7).unwrap();
        assert_eq!(removed, 1);
        let remaining = db.markets_for_exchange(exchange.id).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, "BTC-USD");
    }

    #[test]
    fn fiat_price_upserts_replace_existing_rows() {
        let (db, exchange) = db_with_exchange();
        let mut fiat = FiatRateMap::new();
        fiat.insert("BTC".into(), 30_000.0);
        db.apply_snapshot(exchange.id, &TickerBatch::new(), &fiat, None, Utc::now())
            .unwrap();
        fiat.insert("BTC".into(), 31_000.0);
        db.apply_snapshot(exchange.id, &TickerBatch::new(), &fiat, None, Utc::now())
            .unwrap();
        assert_eq!(
            db.get_fiat_price("BTC", exchange.id).unwrap(),
            Some(31_000.0)
        );
        assert_eq!(db.fiat_prices_for_exchange(exchange.id).unwrap().len(), 1);
    }

    #[test]
    fn list_markets_filters_and_orders() {
        let (db, exchange) = db_with_exchange();
        let mut batch = TickerBatch::new();
        batch.insert("ETH-BTC".into(), ticker("ETH", "BTC", 0.06, 100.0, exchange.id));
        batch.insert("BTC-USD".into(), ticker("BTC", "USD", 30_000.0, 10.0, exchange.id));
        db.apply_snapshot(exchange.id, &batch, &FiatRateMap::new(), None, Utc::now())
            .unwrap();

        let (count, rows) = db
            .list_markets(&MarketFilter {
                quote: Some("USD".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(rows[0].name, "BTC-USD");

        let (_, rows) = db
            .list_markets(&MarketFilter {
                ordering: Some("-volume".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows[0].name, "ETH-BTC");

        let (count, _) = db
            .list_markets(&MarketFilter {
                search: Some("ET".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn ordering_rejects_unknown_columns() {
        assert_eq!(
            order_clause(Some("; DROP TABLE markets"), &["name", "volume"], "name"),
            "ORDER BY name"
        );
        assert_eq!(
            order_clause(Some("-volume"), &["name", "volume"], "name"),
            "ORDER BY volume DESC"
        );
    }
}
