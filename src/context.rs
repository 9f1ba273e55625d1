//! Shared service context.
//!
//! One `Services` value wires the stores, the queue and the pipeline stages
//! together; the scheduler, the poller, the workers and the API all hold the
//! same `Arc<Services>`.

use crate::config::Config;
use crate::fiat::{CoinManagerClient, FiatRateResolver};
use crate::influx::{InfluxClient, InfluxUpdater};
use crate::queue::JobQueue;
use crate::storage::Database;
use crate::updater::ExchangeUpdater;
use anyhow::Result;
use std::sync::Arc;

pub struct Services {
    pub config: Arc<Config>,
    pub db: Database,
    pub queue: Arc<JobQueue>,
    pub influx: Arc<InfluxClient>,
    pub influx_updater: InfluxUpdater,
    pub resolver: FiatRateResolver,
    pub updater: ExchangeUpdater,
}

impl Services {
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let db = Database::open(&config.database_path)?;
        Self::with_database(config, db)
    }

    /// Build services over an existing database handle; tests use this with
    /// an in-memory store.
    pub fn with_database(config: Config, db: Database) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let influx = Arc::new(InfluxClient::new(&config)?);
        let coin_client = CoinManagerClient::new(&config.coin_manager_url)?;
        Ok(Arc::new(Self {
            queue: JobQueue::new(config.fetch_workers),
            influx_updater: InfluxUpdater::new(influx.clone(), &config),
            resolver: FiatRateResolver::new(db.clone(), coin_client, &config),
            updater: ExchangeUpdater::new(db.clone(), &config),
            influx,
            db,
            config,
        }))
    }
}
