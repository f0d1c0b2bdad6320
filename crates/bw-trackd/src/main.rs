mod aggregator;
mod buffer;
mod dispatch;
mod ingest;
mod presence;
mod retry;
mod worker;

use crate::aggregator::{Aggregator, EngineConfig, SharedStore};
use crate::dispatch::DispatchConfig;
use crate::ingest::IngestConfig;
use crate::presence::{NeighborScan, PresenceOracle};
use anyhow::Context;
use bw_core::DEFAULT_MAX_FRAME_BYTES;
use bw_storage::BedStore;
use chrono::{Duration as ChronoDuration, Utc};
use clap::Parser;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bw-trackd")]
struct Args {
    #[arg(long, default_value = "")]
    listen: String,
    #[arg(long, default_value = "")]
    dispatch: String,
    #[arg(long, default_value = "")]
    db: String,
    #[arg(long, default_value_t = 1)]
    tick_secs: u64,
    #[arg(long, default_value_t = 60)]
    retry_secs: u64,
    /// 0 disables expiry; unconfirmable sightings then hand off to the
    /// retry monitor instead of expiring
    #[arg(long, default_value_t = 0)]
    expire_secs: u64,
    #[arg(long, default_value_t = 8)]
    oracle_timeout_secs: u64,
    #[arg(long, default_value_t = 5)]
    connect_timeout_secs: u64,
    #[arg(long, default_value_t = 5)]
    write_timeout_secs: u64,
    #[arg(long, default_value_t = 7)]
    retention_days: i64,
    #[arg(long, default_value_t = 3600)]
    cleanup_secs: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[derive(Clone, Debug)]
struct Config {
    listen_addr: String,
    dispatch_addr: String,
    db_path: String,
    engine: EngineConfig,
    connect_timeout: Duration,
    write_timeout: Duration,
    retention_days: i64,
    cleanup_interval: Duration,
    debug: bool,
}

fn load_config() -> Config {
    let args = Args::parse();
    Config {
        listen_addr: resolve(&args.listen, "BEDWATCH_LISTEN", "0.0.0.0:9500"),
        dispatch_addr: resolve(&args.dispatch, "BEDWATCH_DISPATCH", "127.0.0.1:9501"),
        db_path: resolve(&args.db, "BEDWATCH_DB", "beds.db"),
        engine: EngineConfig {
            tick_interval: Duration::from_secs(args.tick_secs.max(1)),
            retry_interval: Duration::from_secs(args.retry_secs.max(1)),
            expire_after: (args.expire_secs > 0).then(|| Duration::from_secs(args.expire_secs)),
            oracle_timeout: Duration::from_secs(args.oracle_timeout_secs.max(1)),
        },
        connect_timeout: Duration::from_secs(args.connect_timeout_secs.max(1)),
        write_timeout: Duration::from_secs(args.write_timeout_secs.max(1)),
        retention_days: args.retention_days.max(1),
        cleanup_interval: Duration::from_secs(args.cleanup_secs.max(60)),
        debug: args.debug || env_true("BEDWATCH_DEBUG"),
    }
}

fn resolve(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn init_logging(config: &Config) {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("BEDWATCH_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn spawn_retention_sweeper(
    store: SharedStore,
    retention_days: i64,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        event = "retention_sweeper_start",
        retention_days,
        interval_secs = interval.as_secs()
    );
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // skip the immediate first tick so startup stays cheap
        ticker.tick().await;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let cutoff = Utc::now() - ChronoDuration::days(retention_days);
                    let purged = {
                        let store = store.lock().unwrap_or_else(PoisonError::into_inner);
                        store.purge_events_before(cutoff)
                    };
                    match purged {
                        Ok(count) if count > 0 => {
                            info!(event = "events_purged", count, cutoff = %cutoff.to_rfc3339());
                        }
                        Ok(_) => {}
                        Err(err) => {
                            error!(event = "purge_error", error = %err);
                        }
                    }
                }
            }
        }
        info!(event = "retention_sweeper_stop");
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config();
    init_logging(&config);

    let store = BedStore::open(&config.db_path)
        .with_context(|| format!("open bed store at {}", config.db_path))?;
    let store: SharedStore = Arc::new(Mutex::new(store));

    let (dispatch_handle, _dispatch_task) = dispatch::spawn(DispatchConfig {
        target_addr: config.dispatch_addr.clone(),
        connect_timeout: config.connect_timeout,
        write_timeout: config.write_timeout,
        queue_capacity: 256,
    });

    let oracle: Arc<dyn PresenceOracle> = Arc::new(NeighborScan::new());
    let agg = Arc::new(Aggregator::new(
        config.engine.clone(),
        store.clone(),
        oracle,
        dispatch_handle,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    agg.clone().spawn_scheduler(shutdown_rx.clone());
    spawn_retention_sweeper(
        store,
        config.retention_days,
        config.cleanup_interval,
        shutdown_rx.clone(),
    );

    info!(
        event = "trackd_start",
        listen = %config.listen_addr,
        dispatch = %config.dispatch_addr,
        db = %config.db_path
    );

    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "trackd_shutdown");
        let _ = ctrl_c_tx.send(true);
    });

    ingest::run(
        IngestConfig {
            listen_addr: config.listen_addr.clone(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            ack_timeout: Duration::from_secs(2),
        },
        agg,
        shutdown_rx,
    )
    .await
    .with_context(|| format!("ingest listener on {}", config.listen_addr))?;

    Ok(())
}
