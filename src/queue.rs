//! In-process fetch job queue.
//!
//! Jobs are spawned tasks gated by a semaphore, so at most `workers` fetches
//! run at once while the rest wait for a slot. Every job is registered under
//! an opaque handle; the poller cancels through that handle. Deregistration
//! happens in a drop guard, so an aborted job always leaves the registry
//! clean.

use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

type JobRegistry = Arc<Mutex<HashMap<String, AbortHandle>>>;

pub struct JobQueue {
    semaphore: Arc<Semaphore>,
    jobs: JobRegistry,
    closed: AtomicBool,
}

/// Removes the registry entry when the job future is dropped, whether it
/// finished or was aborted.
struct JobGuard {
    jobs: JobRegistry,
    job_id: String,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.jobs.lock().remove(&self.job_id);
    }
}

impl JobQueue {
    pub fn new(workers: usize) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(workers.max(1))),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            closed: AtomicBool::new(false),
        })
    }

    /// Fresh opaque job handle.
    pub fn new_job_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Register and spawn a job. The job waits for a worker slot before it
    /// runs. Fails when the queue has been shut down.
    pub fn enqueue<F>(&self, job_id: &str, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            bail!("job queue is shut down");
        }
        let guard = JobGuard {
            jobs: self.jobs.clone(),
            job_id: job_id.to_string(),
        };
        let semaphore = self.semaphore.clone();

        // Hold the registry lock across spawn + insert so the guard's
        // removal cannot run before the entry exists.
        let mut jobs = self.jobs.lock();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            job.await;
        });
        jobs.insert(job_id.to_string(), handle.abort_handle());
        Ok(())
    }

    /// Best-effort cancellation: abort the job, then wait up to `grace` for
    /// it to leave the registry. Returns false when the handle is unknown
    /// (the job already finished, or was never enqueued here).
    pub async fn cancel(&self, job_id: &str, grace: Duration) -> bool {
        let handle = self.jobs.lock().get(job_id).cloned();
        let Some(handle) = handle else {
            debug!(job_id, "cancel requested for unknown job");
            return false;
        };
        handle.abort();
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if !self.jobs.lock().contains_key(job_id) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        warn!(job_id, "job still registered after cancellation grace period");
        true
    }

    pub fn in_flight(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.jobs.lock().contains_key(job_id)
    }

    /// Stop accepting jobs and release waiters; running jobs finish on
    /// their own.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.semaphore.close();
    }
}
