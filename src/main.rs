//! MarketManager - crypto exchange market data control plane.
//!
//! One binary: admin subcommands for managing exchanges plus the `daemon`
//! subcommand that runs the scheduler, poller, fetch workers and read API.

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use marketmanager::queue::JobQueue;
use marketmanager::storage::ExchangeDetails;
use marketmanager::{daemon, upstream, worker, Config, Database, Services};

#[derive(Parser)]
#[command(name = "marketmanager", about = "Crypto exchange market data manager")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add an exchange for scheduling (must have an upstream adapter).
    AddExchange {
        /// Name of the exchange.
        #[arg(long, conflicts_with = "all")]
        name: Option<String>,
        /// Add every exchange the upstream library knows.
        #[arg(long)]
        all: bool,
        /// Fetch interval in seconds.
        #[arg(long)]
        interval: Option<i64>,
    },
    /// Enable exchanges for scheduling.
    EnableExchanges {
        /// Exchange id; repeatable.
        #[arg(long = "id", conflicts_with = "all")]
        ids: Vec<i64>,
        #[arg(long)]
        all: bool,
    },
    /// Disable exchanges from scheduling.
    DisableExchanges {
        /// Exchange id; repeatable.
        #[arg(long = "id", conflicts_with = "all")]
        ids: Vec<i64>,
        #[arg(long)]
        all: bool,
    },
    /// List configured exchanges.
    GetExchanges {
        /// List every adapter the upstream library provides instead.
        #[arg(long)]
        available: bool,
        #[arg(long, conflicts_with = "disabled")]
        enabled: bool,
        #[arg(long)]
        disabled: bool,
        /// Machine-readable output.
        #[arg(long)]
        json: bool,
    },
    /// Run one exchange fetch.
    FetchExchangeData {
        /// Exchange id.
        id: i64,
        /// Hand the job to a running daemon instead of fetching in-process.
        #[arg(long)]
        background: bool,
    },
    /// Control the scheduler/poller daemon.
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
}

#[derive(Subcommand)]
enum DaemonAction {
    Start,
    Stop,
    Restart,
    Status,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marketmanager=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    match cli.command {
        Command::AddExchange {
            name,
            all,
            interval,
        } => {
            let interval = interval.unwrap_or(config.default_fetch_interval);
            let db = Database::open(&config.database_path)?;
            if all {
                for name in upstream::available() {
                    add_exchange(&db, &config, name, interval)?;
                }
                return Ok(());
            }
            let name = name.ok_or_else(|| anyhow!("either --name or --all is required"))?;
            add_exchange(&db, &config, &name, interval)
        }
        Command::EnableExchanges { ids, all } => {
            set_enabled(&config, ids, all, true)
        }
        Command::DisableExchanges { ids, all } => {
            set_enabled(&config, ids, all, false)
        }
        Command::GetExchanges {
            available,
            enabled,
            disabled,
            json,
        } => get_exchanges(&config, available, enabled, disabled, json),
        Command::FetchExchangeData { id, background } => {
            if background {
                let response = daemon::daemon_request(
                    &config.daemon_host,
                    config.daemon_port,
                    &json!({"type": "run_exchange", "exchange_id": id}),
                )
                .await?;
                if let Some(error) = response.get("error") {
                    bail!("daemon refused the run: {}", error);
                }
                println!(
                    "Running exchange data fetch through the daemon. Job ID: {}",
                    response["job_id"].as_str().unwrap_or("?")
                );
                return Ok(());
            }
            fetch_foreground(config, id).await
        }
        Command::Daemon { action } => match action {
            DaemonAction::Start => daemon::run(config).await,
            DaemonAction::Stop => {
                let response = daemon::daemon_request(
                    &config.daemon_host,
                    config.daemon_port,
                    &json!({"type": "shutdown"}),
                )
                .await?;
                println!("{}", response);
                Ok(())
            }
            DaemonAction::Status => {
                match daemon::daemon_request(
                    &config.daemon_host,
                    config.daemon_port,
                    &json!({"type": "status"}),
                )
                .await
                {
                    Ok(response) => {
                        println!("{}", serde_json::to_string_pretty(&response)?);
                        Ok(())
                    }
                    Err(e) => bail!("daemon is not reachable: {}", e),
                }
            }
            DaemonAction::Restart => {
                let stop = daemon::daemon_request(
                    &config.daemon_host,
                    config.daemon_port,
                    &json!({"type": "shutdown"}),
                )
                .await;
                if stop.is_err() {
                    eprintln!("No running daemon found, starting fresh.");
                }
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                daemon::run(config).await
            }
        },
    }
}

fn add_exchange(db: &Database, config: &Config, name: &str, interval: i64) -> Result<()> {
    let Some(adapter) = upstream::by_name(name)? else {
        bail!("exchange {} doesn't exist in the upstream library", name);
    };
    let display_name = capitalize(name);
    if db.get_exchange_by_name(&display_name)?.is_some() {
        eprintln!("Exchange {} already exists", display_name);
        return Ok(());
    }
    let urls = adapter.urls();
    let details = ExchangeDetails {
        url: urls.www,
        api_url: urls.api,
        logo: urls.logo,
    };
    db.create_exchange(&display_name, interval, &details, config.exchange_timeout)?;
    println!("Created exchange {}", display_name);
    Ok(())
}

fn set_enabled(config: &Config, ids: Vec<i64>, all: bool, enabled: bool) -> Result<()> {
    let db = Database::open(&config.database_path)?;
    if all {
        let changed = db.set_all_exchanges_enabled(enabled)?;
        println!("All {} existing exchanges modified!", changed);
        return Ok(());
    }
    if ids.is_empty() {
        bail!("either --id or --all is required");
    }
    for id in ids {
        if db.set_exchange_enabled(id, enabled)? == 0 {
            bail!("no exchange with id {}", id);
        }
        println!("Exchange changed successfully: {}", id);
    }
    Ok(())
}

fn get_exchanges(
    config: &Config,
    available: bool,
    enabled: bool,
    disabled: bool,
    json: bool,
) -> Result<()> {
    if available {
        println!("All current upstream exchanges");
        for name in upstream::available() {
            println!("{}", name);
        }
        return Ok(());
    }
    let db = Database::open(&config.database_path)?;
    let exchanges = db.all_exchanges()?;
    let exchanges: Vec<_> = exchanges
        .into_iter()
        .filter(|e| {
            if enabled {
                e.enabled
            } else if disabled {
                !e.enabled
            } else {
                true
            }
        })
        .collect();
    if exchanges.is_empty() {
        println!("No exchanges configured");
        return Ok(());
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&exchanges)?);
        return Ok(());
    }
    for exchange in exchanges {
        let mut line = format!(
            "ID: {}, Name: {}, Interval: {}s, Enabled: {}, Fiat: {}",
            exchange.id, exchange.name, exchange.interval, exchange.enabled, exchange.fiat_markets
        );
        if let Some(status) = db.get_status(exchange.id)? {
            line.push_str(&format!(
                ", Last run: {}, Running: {}",
                status
                    .last_run
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".into()),
                status.running
            ));
        }
        println!("{}", line);
    }
    Ok(())
}

async fn fetch_foreground(config: Config, exchange_id: i64) -> Result<()> {
    let services = Services::new(config)?;
    if services.db.get_exchange(exchange_id)?.is_none() {
        bail!("no exchange with that ID exists");
    }
    let job_id = JobQueue::new_job_id();
    match worker::fetch_exchange_data(&services, exchange_id, &job_id).await {
        Ok(message) => {
            println!("Finished running exchange data gathering: {}", message);
            Ok(())
        }
        Err(e) => {
            services.db.fail_run(exchange_id, &e.to_string())?;
            Err(e)
        }
    }
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
