//! Poller loop.
//!
//! The supervisor of in-flight fetches. Every tick it inspects each status
//! row with the `running` flag set: jobs inside their timeout are left
//! alone, stuck ones are cancelled through the queue and the flag is
//! released with a `"Timeout reached"` diagnostic. The poller is the only
//! component that cancels jobs.

use crate::context::Services;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const TICK: Duration = Duration::from_secs(10);

/// How long a cancelled job gets to wind down before we stop waiting.
const CANCEL_GRACE: Duration = Duration::from_secs(3);

pub struct Poller {
    services: Arc<Services>,
}

impl Poller {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    pub async fn run(self) {
        info!("starting poller loop");
        let mut ticker = tokio::time::interval(TICK);
        loop {
            ticker.tick().await;
            if let Err(e) = self.pass().await {
                error!(error = %e, "poller pass failed");
            }
        }
    }

    /// One supervision pass over every running status.
    pub async fn pass(&self) -> Result<()> {
        let db = &self.services.db;
        for status in db.running_statuses()? {
            let Some(job_id) = status.last_run_id.as_deref() else {
                info!(exchange_id = status.exchange_id, "missing last run id, skipping");
                continue;
            };
            let Some(time_started) = status.time_started else {
                warn!(
                    exchange_id = status.exchange_id,
                    "running exchange has no start time, clearing flag"
                );
                db.clear_running(status.exchange_id)?;
                continue;
            };
            if !is_timed_out(Utc::now(), time_started, status.timeout) {
                debug!(exchange_id = status.exchange_id, "exchange is within timeout");
                continue;
            }
            error!(
                exchange_id = status.exchange_id,
                job_id, "timeout reached, revoking job"
            );
            if !self.services.queue.cancel(job_id, CANCEL_GRACE).await {
                warn!(job_id, "job was not in the queue registry");
            }
            db.fail_run(status.exchange_id, "Timeout reached")?;
        }
        debug!("finished running through all running exchanges");
        Ok(())
    }
}

/// A job is stuck strictly after its timeout; elapsed time exactly equal to
/// the timeout still counts as in-flight.
pub fn is_timed_out(now: DateTime<Utc>, time_started: DateTime<Utc>, timeout: i64) -> bool {
    (now - time_started).num_seconds() > timeout
}
