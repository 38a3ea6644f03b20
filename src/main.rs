//! Pendulum sorter - real-time package diversion for a conveyor line
//!
//! Correlates identified packages with entry sensor pulses and drives
//! per-lane pendulum actuators (or a PLC) so each package lands in its chute.
//!
//! Module structure:
//! - `domain/` - Core types (packages, chutes, delay windows)
//! - `io/` - Device links, wire codecs, ingest listener, Prometheus endpoint
//! - `services/` - Correlation, registry, actuation, line supervision
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use pendulum_sorter::infra::{Config, Metrics};
use pendulum_sorter::io::{start_ingest_listener, IngestConfig, LinkSettings, TcpLinkFactory};
use pendulum_sorter::services::Sorter;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Pendulum sorter - package diversion engine
#[derive(Parser, Debug)]
#[command(name = "pendulum-sorter", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Default: INFO, use RUST_LOG=debug for per-pulse visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = env!("GIT_HASH"), "pendulum-sorter starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        mode = config.mode().as_str(),
        trigger_addr = %config.trigger_addr(),
        lanes = ?config.lanes().iter().map(|l| l.name.as_str()).collect::<Vec<_>>(),
        plc_addr = %config.plc_addr(),
        ingest_port = %config.ingest_port(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics = Arc::new(Metrics::new());
    let factory = Arc::new(TcpLinkFactory::new(LinkSettings {
        connect_timeout: config.connect_timeout(),
        write_timeout: config.write_timeout(),
    }));
    let ingest_config = IngestConfig { port: config.ingest_port(), enabled: config.ingest_enabled() };
    let prometheus_port = config.prometheus_port();
    let metrics_interval = config.metrics_interval_secs();
    let site_id = config.site_id().to_string();

    let sorter = Arc::new(Sorter::new(config, factory, metrics.clone()));

    // Startup is all-or-nothing: a missing device means the line cannot sort
    if let Err(e) = sorter.start().await {
        error!(error = %e, "sorter_start_failed");
        return Err(e.into());
    }

    // Identified packages arrive over TCP
    let ingest_sorter = sorter.clone();
    let ingest_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = start_ingest_listener(ingest_config, ingest_sorter, ingest_shutdown).await {
            error!(error = %e, "Ingest listener error");
        }
    });

    // Start Prometheus metrics HTTP server (if port > 0)
    if prometheus_port > 0 {
        let prom_sorter = sorter.clone();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = pendulum_sorter::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_sorter,
                site_id,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Periodic metrics log
    let report_sorter = sorter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            let summary = metrics.report(report_sorter.pending_count(), report_sorter.queued_pulses());
            summary.log();
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);

    sorter.stop().await;
    info!("pendulum-sorter shutdown complete");
    Ok(())
}
