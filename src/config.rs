//! Environment-driven configuration.
//!
//! Every knob the daemon, the workers and the CLI recognise comes from the
//! process environment (optionally seeded from a `.env` file). Missing
//! mandatory keys abort startup; everything else has a sensible default.

use anyhow::{bail, Result};
use std::env;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    /// Ordered fiat symbols; the first element is the canonical unit used
    /// for exchange volume summaries.
    pub fiat_symbols: Vec<String>,
    /// Default job timeout in seconds, applied to new status rows.
    pub exchange_timeout: i64,
    /// Interval in seconds for exchanges created automatically at startup.
    pub default_fetch_interval: i64,
    pub market_stale_days: i64,
    /// Exchange names ensured to exist when the scheduler starts.
    pub enabled_exchanges: Vec<String>,
    /// Number of concurrent fetch worker slots.
    pub fetch_workers: usize,
    pub coin_manager_url: String,
    pub influxdb_url: String,
    pub influxdb_token: String,
    pub influxdb_org: String,
    pub influxdb_bucket: String,
    pub measurement_pairs: String,
    pub measurement_fiat: String,
    /// API response cache TTL in seconds; 0 disables the cache.
    pub cache_ttl: u64,
    pub daemon_host: String,
    pub daemon_port: u16,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn list_var(key: &str, default: &str) -> Vec<String> {
    var_or(key, default)
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        // Mandatory collaborators: the external currency service and the
        // timeseries store. Fail fast rather than limp along without them.
        let coin_manager_url = match env::var("COIN_MANAGER_URL") {
            Ok(v) if !v.trim().is_empty() => v.trim_end_matches('/').to_string(),
            _ => bail!("Missing mandatory env variable COIN_MANAGER_URL"),
        };
        let influxdb_url = match env::var("INFLUXDB_URL") {
            Ok(v) if !v.trim().is_empty() => v.trim_end_matches('/').to_string(),
            _ => bail!("Missing mandatory env variable INFLUXDB_URL"),
        };

        let fiat_symbols: Vec<String> = list_var("FIAT_SYMBOLS", "USD,EUR,GBP")
            .into_iter()
            .map(|s| s.to_uppercase())
            .collect();
        if fiat_symbols.is_empty() {
            bail!("FIAT_SYMBOLS must name at least one symbol");
        }

        Ok(Self {
            database_path: var_or("DATABASE_PATH", "./marketmanager.db"),
            port: parse_or("PORT", 8000),
            fiat_symbols,
            exchange_timeout: parse_or("EXCHANGE_TIMEOUT", 120),
            default_fetch_interval: parse_or("EXCHANGE_DEFAULT_FETCH_INTERVAL", 300),
            market_stale_days: parse_or("MARKET_STALE_DAYS", 7),
            enabled_exchanges: list_var("ENABLED_EXCHANGES", ""),
            fetch_workers: parse_or("FETCH_WORKERS", 4),
            coin_manager_url,
            influxdb_url,
            influxdb_token: var_or("INFLUXDB_TOKEN", ""),
            influxdb_org: var_or("INFLUXDB_ORG", "marketmanager"),
            influxdb_bucket: var_or("INFLUXDB_BUCKET", "marketmanager"),
            measurement_pairs: var_or("INFLUX_MEASUREMENT_PAIRS", "market-pairs"),
            measurement_fiat: var_or("INFLUX_MEASUREMENT_FIAT", "fiat-markets"),
            cache_ttl: parse_or("CACHE_TTL", 60),
            daemon_host: var_or("DAEMON_HOST", "127.0.0.1"),
            daemon_port: parse_or("DAEMON_PORT", 5000),
        })
    }

    /// The unit all exchange volumes are expressed in.
    pub fn canonical_fiat(&self) -> &str {
        &self.fiat_symbols[0]
    }

    pub fn is_fiat(&self, symbol: &str) -> bool {
        self.fiat_symbols.iter().any(|s| s == symbol)
    }
}

#[cfg(test)]
impl Config {
    /// In-memory configuration for unit tests.
    pub(crate) fn for_tests() -> Self {
        Config {
            database_path: ":memory:".into(),
            port: 8000,
            fiat_symbols: vec!["USD".into(), "EUR".into()],
            exchange_timeout: 120,
            default_fetch_interval: 300,
            market_stale_days: 7,
            enabled_exchanges: vec![],
            fetch_workers: 4,
            coin_manager_url: "http://127.0.0.1:1".into(),
            influxdb_url: "http://127.0.0.1:1".into(),
            influxdb_token: String::new(),
            influxdb_org: "marketmanager".into(),
            influxdb_bucket: "marketmanager".into(),
            measurement_pairs: "market-pairs".into(),
            measurement_fiat: "fiat-markets".into(),
            cache_ttl: 0,
            daemon_host: "127.0.0.1".into(),
            daemon_port: 5000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_fiat_is_first_symbol() {
        let cfg = Config::for_tests();
        assert_eq!(cfg.canonical_fiat(), "USD");
        assert!(cfg.is_fiat("EUR"));
        assert!(!cfg.is_fiat("BTC"));
    }

    #[test]
    fn missing_mandatory_key_fails_fast() {
        // Serialise env-touching tests through a lock to avoid interference.
        let _guard = crate::config::test_env_lock().lock();
        std::env::remove_var("COIN_MANAGER_URL");
        std::env::remove_var("INFLUXDB_URL");
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("COIN_MANAGER_URL"));
    }

    #[test]
    fn defaults_applied_when_unset() {
        let _guard = crate::config::test_env_lock().lock();
        std::env::set_var("COIN_MANAGER_URL", "http://coins.local/");
        std::env::set_var("INFLUXDB_URL", "http://influx.local");
        std::env::remove_var("FIAT_SYMBOLS");
        std::env::remove_var("EXCHANGE_TIMEOUT");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.coin_manager_url, "http://coins.local");
        assert_eq!(cfg.exchange_timeout, 120);
        assert_eq!(cfg.fiat_symbols, vec!["USD", "EUR", "GBP"]);
        std::env::remove_var("COIN_MANAGER_URL");
        std::env::remove_var("INFLUXDB_URL");
    }
}

#[cfg(test)]
pub(crate) fn test_env_lock() -> &'static parking_lot::Mutex<()> {
    static LOCK: std::sync::OnceLock<parking_lot::Mutex<()>> = std::sync::OnceLock::new();
    LOCK.get_or_init(|| parking_lot::Mutex::new(()))
}
