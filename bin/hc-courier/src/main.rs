//! HttpCourier
//!
//! Reads newline-delimited JSON events from stdin and delivers them to the
//! HTTP endpoint described in the configuration file.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `HC_CONFIG` | `courier.toml` | Path to the TOML configuration |
//! | `HC_BATCH_SIZE` | `100` | Max events per batch |
//! | `HC_BATCH_WAIT_MS` | `1000` | Flush a partial batch after this long |
//! | `HC_METRICS_PORT` | - | Prometheus exporter port (disabled when unset) |
//! | `RUST_LOG` | `info` | Log level |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use hc_common::{parse_event, Event};
use hc_config::CourierConfig;
use hc_delivery::{DeliveryEngine, DeliveryError, ShutdownFlag, ShutdownSignal};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_optional_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Logs go to stderr; stdin/stdout stay free for event data
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
        )
        .init();

    info!("Starting HttpCourier");

    let config_path = env_or("HC_CONFIG", "courier.toml");
    let batch_size: usize = env_or_parse("HC_BATCH_SIZE", 100).max(1);
    let batch_wait = Duration::from_millis(env_or_parse("HC_BATCH_WAIT_MS", 1000));

    if let Some(port) = env_optional_parse::<u16>("HC_METRICS_PORT") {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| anyhow::anyhow!("Failed to install metrics exporter: {}", e))?;
        info!("Metrics exporter listening on http://{}/metrics", addr);
    }

    let settings = CourierConfig::load(&config_path)
        .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", config_path, e))?
        .output;

    let shutdown = ShutdownFlag::new();
    let engine = DeliveryEngine::builder(settings.validate()?)
        .shutdown(Arc::new(shutdown.clone()))
        .build()?;

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received...");
            shutdown.request();
        });
    }

    info!(config = %config_path, batch_size = batch_size, "HttpCourier started");

    let abandoned = run(&engine, &shutdown, batch_size, batch_wait).await?;

    if abandoned > 0 {
        error!(abandoned = abandoned, "Events abandoned at shutdown");
        std::process::exit(1);
    }

    info!("HttpCourier shutdown complete");
    Ok(())
}

/// Read stdin until EOF or shutdown, delivering in batches.
/// Returns the number of abandoned events.
async fn run(
    engine: &DeliveryEngine,
    shutdown: &ShutdownFlag,
    batch_size: usize,
    batch_wait: Duration,
) -> Result<usize> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut batch: Vec<Event> = Vec::with_capacity(batch_size);
    let mut deadline = Instant::now() + batch_wait;
    let mut abandoned = 0;

    loop {
        if shutdown.is_requested() {
            break;
        }

        let flush = tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    push_line(&mut batch, &line);
                    batch.len() >= batch_size
                }
                None => break,
            },
            _ = tokio::time::sleep_until(deadline) => true,
            _ = wait_for(shutdown) => false,
        };

        if flush {
            abandoned += flush_batch(engine, &mut batch).await?;
            deadline = Instant::now() + batch_wait;
        }
    }

    if !batch.is_empty() {
        info!(events = batch.len(), "Delivering remaining buffered events");
        abandoned += flush_batch(engine, &mut batch).await?;
    }

    Ok(abandoned)
}

fn push_line(batch: &mut Vec<Event>, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match parse_event(line) {
        Ok(event) => batch.push(event),
        Err(e) => warn!(error = %e, "Skipping invalid event line"),
    }
}

async fn flush_batch(engine: &DeliveryEngine, batch: &mut Vec<Event>) -> Result<usize> {
    if batch.is_empty() {
        return Ok(0);
    }

    match engine.deliver(std::mem::take(batch)).await {
        Ok(summary) => {
            info!(delivered = summary.delivered, failed = summary.failed, "Batch delivered");
            Ok(0)
        }
        Err(DeliveryError::Abandoned { abandoned, delivered, failed }) => {
            warn!(abandoned, delivered, failed, "Batch interrupted by shutdown");
            Ok(abandoned)
        }
        Err(e) => Err(e.into()),
    }
}

async fn wait_for(shutdown: &ShutdownFlag) {
    while !shutdown.is_requested() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
