//! snare sensor
//!
//! Runs the honeypot dispatch core against the tracked-traffic port until
//! Ctrl-C or SIGTERM.

use std::sync::Arc;

use anyhow::Result;
use snare::{Config, Honeypot};
use tracing::{error, info, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to SNARE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting snare sensor");
    info!(
        server_addr = %config.server_addr,
        rules_path = %config.rules_path.display(),
        var_dir = %config.var_dir.display(),
        conn_timeout_secs = config.conn_timeout.as_secs(),
        telemetry_enabled = config.telemetry_url.is_some(),
        "Configuration loaded"
    );

    let mut honeypot = Honeypot::new(config);
    if let Err(e) = honeypot.init().await {
        if e.is_startup_fatal() {
            error!(error = %e, "Sensor failed to start");
        } else {
            error!(error = %e, "Unexpected error during sensor startup");
        }
        return Err(e.into());
    }

    let sensor_id = honeypot
        .identity()
        .map(|id| id.to_string())
        .unwrap_or_default();
    let span = tracing::info_span!("snare", sensor_id = %sensor_id);

    let honeypot = Arc::new(honeypot);
    let mut runner = {
        let honeypot = Arc::clone(&honeypot);
        tokio::spawn(async move { honeypot.run().await }.instrument(span.clone()))
    };

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
            honeypot.shutdown().instrument(span).await?;
            runner.await??;
        }
        result = &mut runner => {
            result??;
        }
    }

    info!("Sensor shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
