//! Daemon assembly and control socket.
//!
//! `run` wires everything together in one process: the scheduler loop, the
//! poller loop, the stale-market maintenance task, the HTTP read API, and a
//! small TCP control socket speaking newline-delimited JSON. The control
//! socket is how the CLI and the API's `/daemon_status` endpoint reach a
//! running daemon.

use crate::api;
use crate::config::Config;
use crate::context::Services;
use crate::poller::Poller;
use crate::queue::JobQueue;
use crate::scheduler::Scheduler;
use crate::worker;
use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{error, info, warn};

const CONTROL_TIMEOUT: Duration = Duration::from_secs(3);
const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Run the daemon until a shutdown request or Ctrl-C arrives.
pub async fn run(config: Config) -> Result<()> {
    let port = config.port;
    let control_addr = format!("{}:{}", config.daemon_host, config.daemon_port);
    let services = Services::new(config)?;
    let shutdown = Arc::new(Notify::new());

    let control_listener = TcpListener::bind(&control_addr)
        .await
        .with_context(|| format!("failed to bind control socket on {} (daemon already running?)", control_addr))?;
    info!(addr = %control_addr, "control socket listening");
    tokio::spawn(control_loop(
        control_listener,
        services.clone(),
        shutdown.clone(),
    ));

    tokio::spawn(Scheduler::new(services.clone()).run());
    tokio::spawn(Poller::new(services.clone()).run());
    tokio::spawn(stale_market_sweeper(services.clone()));

    let app = api::router(services.clone());
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind API on port {}", port))?;
    info!(port, "API listening");

    let shutdown_signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_signal.notified() => info!("shutdown requested over control socket"),
                _ = tokio::signal::ctrl_c() => info!("received Ctrl-C, shutting down"),
            }
        })
        .await
        .context("API server failed")?;

    services.queue.shutdown();
    info!("daemon stopped");
    Ok(())
}

/// Hourly sweep deleting market rows past the staleness horizon.
async fn stale_market_sweeper(services: Arc<Services>) {
    let mut ticker = tokio::time::interval(STALE_SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        if let Err(e) = services
            .db
            .delete_stale_markets(Utc::now(), services.config.market_stale_days)
        {
            error!(error = %e, "stale market sweep failed");
        }
    }
}

async fn control_loop(listener: TcpListener, services: Arc<Services>, shutdown: Arc<Notify>) {
    let started_at = Utc::now();
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let services = services.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        handle_control(stream, services, shutdown, started_at).await
                    {
                        warn!(client = %addr, error = %e, "control connection failed");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "control socket accept failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn handle_control(
    stream: TcpStream,
    services: Arc<Services>,
    shutdown: Arc<Notify>,
    started_at: chrono::DateTime<Utc>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let Some(line) = tokio::time::timeout(CONTROL_TIMEOUT, lines.next_line())
        .await
        .context("control read timed out")??
    else {
        return Ok(());
    };

    let request: Value = match serde_json::from_str(&line) {
        Ok(value) => value,
        Err(_) => {
            let response = json!({"error": "bad request - expected a JSON object"});
            writer.write_all(format!("{}\n", response).as_bytes()).await?;
            return Ok(());
        }
    };
    let response = match request.get("type").and_then(Value::as_str) {
        Some("status") => json!({
            "status": "running",
            "started_at": started_at.to_rfc3339(),
            "jobs_in_flight": services.queue.in_flight(),
        }),
        Some("shutdown") => {
            info!("shutdown request received");
            shutdown.notify_waiters();
            json!({"status": "shutting down"})
        }
        Some("run_exchange") => run_exchange_request(&services, &request),
        _ => json!({"error": "bad request - expected status, shutdown or run_exchange"}),
    };
    writer.write_all(format!("{}\n", response).as_bytes()).await?;
    Ok(())
}

fn run_exchange_request(services: &Arc<Services>, request: &Value) -> Value {
    let Some(exchange_id) = request.get("exchange_id").and_then(Value::as_i64) else {
        return json!({"error": "run_exchange requires a numeric exchange_id"});
    };
    match services.db.get_exchange(exchange_id) {
        Ok(Some(_)) => {}
        Ok(None) => return json!({"error": format!("no exchange with id {}", exchange_id)}),
        Err(e) => return json!({"error": format!("exchange lookup failed: {}", e)}),
    }
    let job_id = JobQueue::new_job_id();
    let job = worker::run_job(services.clone(), exchange_id, job_id.clone());
    match services.queue.enqueue(&job_id, job) {
        Ok(()) => json!({"status": "accepted", "job_id": job_id}),
        Err(e) => json!({"error": format!("could not enqueue fetch: {}", e)}),
    }
}

/// One request/response round-trip against a daemon's control socket.
pub async fn daemon_request(host: &str, port: u16, request: &Value) -> Result<Value> {
    let stream = tokio::time::timeout(CONTROL_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .context("daemon connection timed out")?
        .with_context(|| format!("failed to connect to daemon at {}:{}", host, port))?;
    let (reader, mut writer) = stream.into_split();
    writer
        .write_all(format!("{}\n", request).as_bytes())
        .await
        .context("failed to send daemon request")?;
    let mut lines = BufReader::new(reader).lines();
    let line = tokio::time::timeout(CONTROL_TIMEOUT, lines.next_line())
        .await
        .context("daemon response timed out")?
        .context("failed to read daemon response")?
        .context("daemon closed the connection without a response")?;
    serde_json::from_str(&line).context("daemon sent an unparseable response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    async fn spawn_control(services: Arc<Services>) -> (u16, Arc<Notify>) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shutdown = Arc::new(Notify::new());
        tokio::spawn(control_loop(listener, services, shutdown.clone()));
        (port, shutdown)
    }

    fn test_services() -> Arc<Services> {
        Services::with_database(Config::for_tests(), Database::open_in_memory().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn status_request_round_trips() {
        let (port, _shutdown) = spawn_control(test_services()).await;
        let response = daemon_request("127.0.0.1", port, &json!({"type": "status"}))
            .await
            .unwrap();
        assert_eq!(response["status"], "running");
        assert_eq!(response["jobs_in_flight"], 0);
    }

    #[tokio::test]
    async fn malformed_request_gets_an_error_reply() {
        let (port, _shutdown) = spawn_control(test_services()).await;
        let response = daemon_request("127.0.0.1", port, &json!({"type": "configure"}))
            .await
            .unwrap();
        assert!(response["error"].as_str().unwrap().contains("bad request"));
    }

    #[tokio::test]
    async fn run_exchange_rejects_unknown_ids() {
        let (port, _shutdown) = spawn_control(test_services()).await;
        let response = daemon_request(
            "127.0.0.1",
            port,
            &json!({"type": "run_exchange", "exchange_id": 7}),
        )
        .await
        .unwrap();
        assert!(response["error"].as_str().unwrap().contains("no exchange"));
    }

    #[tokio::test]
    async fn unreachable_daemon_is_an_error() {
        assert!(
            daemon_request("127.0.0.1", 1, &json!({"type": "status"}))
                .await
                .is_err()
        );
    }
}
