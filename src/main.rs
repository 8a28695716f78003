mod config;
mod db_utils;
mod detection;
mod keyed_locks;
mod log_config;
mod phone;
mod providers;
mod rate_limiter;
mod request_handler;
mod response;
mod scoring;
mod signals;
mod state_store;
mod velocity_tracker;
mod window_counter;

use crate::config::{ServerConfig, StateBackend};
use crate::db_utils::DbUtils;
use crate::detection::{Detector, Providers};
use crate::log_config::init_logging;
use crate::providers::{StaticCarrierLookup, StaticIpGeo};
use crate::rate_limiter::RateLimiter;
use crate::request_handler::RequestHandler;
use crate::state_store::{MemoryStateStore, StateStore};
use crate::velocity_tracker::VelocityTracker;
use crate::window_counter::RETENTION_MS;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;

fn print_usage() {
    eprintln!("Usage: smsguard-riskd [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --help               Show this help message");
    eprintln!();
    eprintln!("Environment variables:");
    eprintln!("  CONFIG_PATH          Path to config file (default: config/riskd.toml)");
    eprintln!("  DATABASE_PATH        Path to SQLite database (default: storage/riskd.db)");
    eprintln!("  LOG_FILE_PATH        Path to log file (default: logs/riskd.log)");
    eprintln!("  LISTEN_ADDR          Address to serve on (default: 127.0.0.1:7171)");
    eprintln!("  LOG_LEVEL            Log level filter (default: info)");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if let Some(arg) = args.get(1) {
        print_usage();
        if arg == "--help" || arg == "-h" {
            return Ok(());
        }
        return Err(anyhow::anyhow!("Unknown option: {}", arg));
    }

    let config_path = std::env::var("CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| ServerConfig::default_path());
    let mut config = ServerConfig::load_or_create(&config_path)?;
    config.apply_env_overrides();
    config.validate()?;

    run_server(config).await
}

/// Run the risk daemon until Ctrl-C
async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    init_logging(&config.log_file)?;
    log::info!(
        "Starting risk daemon: keying={:?}, state={:?}",
        config.velocity_keying,
        config.state_backend
    );

    // Prepare database path
    if config.database_path != ":memory:" {
        if let Some(parent) = PathBuf::from(&config.database_path).parent() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let db = Arc::new(DbUtils::new(&config.database_path).await?);

    for country in &config.country_risk {
        db.upsert_country_risk(country).await?;
    }
    log::info!("Seeded {} country risk rows", config.country_risk.len());

    let store: Arc<dyn StateStore> = match config.state_backend {
        StateBackend::Memory => Arc::new(MemoryStateStore::new()),
        StateBackend::Sqlite => db.clone(),
    };

    let tracker = Arc::new(VelocityTracker::new(store.clone(), config.velocity_keying));
    let rate_limiter = Arc::new(RateLimiter::new(store));
    let providers = Providers {
        country_risk: db.clone(),
        carrier: Arc::new(StaticCarrierLookup::new(config.carrier_defaults.clone())),
        ip_geo: Arc::new(StaticIpGeo::new(config.ip_country.clone())),
        conversion: db.clone(),
    };
    let detector = Arc::new(Detector::new(
        tracker.clone(),
        providers,
        config.velocity_limits,
        config.scoring,
    ));
    let handler = Arc::new(RequestHandler::new(
        detector,
        rate_limiter.clone(),
        db,
        config.rate_limit,
    ));

    let listener = TcpListener::bind(&config.listen_addr).await?;
    log::info!("Listening on {}", config.listen_addr);

    // Idle per-key state goes once nothing in it can still be counted
    let horizon = RETENTION_MS.max(config.rate_limit.window_ms);
    let interval_secs = config.maintenance_interval_secs;
    let maintenance = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            let now = Utc::now().timestamp_millis();
            let windows = tracker.evict_idle(now).await;
            let limits = rate_limiter.evict_idle(now, horizon).await;
            if windows + limits > 0 {
                log::info!("Evicted {} idle state keys", windows + limits);
            }
        }
    });

    tokio::select! {
        _ = async {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        log::debug!("Accepted connection from {}", peer);
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, handler).await {
                                log::warn!("Connection from {} ended with error: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => log::error!("Accept failed: {}", e),
                }
            }
        } => {},
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down risk daemon.");
        }
    }

    maintenance.abort();
    Ok(())
}

/// Answer each request line on the connection with one response line.
async fn serve_connection(stream: TcpStream, handler: Arc<RequestHandler>) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = LinesStream::new(BufReader::new(reader).lines());

    while let Some(line) = lines.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let mut response = handler.handle_line(&line).await;
        response.push('\n');
        writer.write_all(response.as_bytes()).await?;
    }
    Ok(())
}
