use anyhow::Context;
use eatsome_printer_bridge::config::RelayConfig;
use eatsome_printer_bridge::relay::{server, RelayService};
use eatsome_printer_bridge::sentry_init;
use eatsome_printer_bridge::telemetry::{self, TelemetryCollector};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Console output always; a daily-rolling file as well when
/// `BRIDGE_LOG_DIR` is set. The returned guard flushes the file writer.
fn init_logging() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match std::env::var("BRIDGE_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir.trim(), "bridge-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false),
        )
        .with(file_layer)
        .with(sentry_tracing::layer())
        .init();

    guard
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested, draining in-flight relay sessions"),
        Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Ahead of the subscriber; must stay alive until exit
    let sentry_guard = sentry_init::init();
    let _log_guard = init_logging();

    info!("========================================");
    info!("Eatsome Printer Bridge Relay Starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("========================================");

    if sentry_guard.is_some() {
        info!("Sentry crash reporting initialized");
    } else {
        info!("Sentry DSN not configured - crash reporting disabled");
    }

    let config = RelayConfig::from_env().context("invalid relay configuration")?;
    if config.auth_token.is_none() {
        warn!("BRIDGE_RELAY_TOKEN not set - relay accepts unauthenticated requests");
    }
    info!(
        "Limits: {} concurrent sessions, {} queued, payload ≤ {} bytes",
        config.max_sessions, config.admission_queue, config.max_payload_bytes
    );

    let telemetry_collector = Arc::new(TelemetryCollector::new());
    let service = Arc::new(RelayService::with_telemetry(
        config.clone(),
        telemetry_collector.clone(),
    ));

    let reporter = (config.telemetry_interval_secs > 0).then(|| {
        telemetry::spawn_reporter(
            telemetry_collector,
            Duration::from_secs(config.telemetry_interval_secs),
        )
    });

    let listener = TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("failed to bind relay on {}", config.bind_address))?;

    server::serve(listener, service, shutdown_signal()).await?;

    if let Some(reporter) = reporter {
        reporter.abort();
    }
    info!("Eatsome Printer Bridge Relay stopped");
    Ok(())
}
