mod config;

use clap::Parser;
use config::{Config, ConfigError, LoggingConfig, MetricsConfig};
use ingress::diagnostics::{Diagnostics, NoopDiagnostics, SentryDiagnostics};
use ingress::errors::IngressError;
use metrics_exporter_statsd::StatsdBuilder;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const METRICS_PREFIX: &str = "push";

#[derive(Parser)]
#[command(about = "Accepts encrypted analytics events and queues them per project")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, short)]
    config: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not set up metrics: {0}")]
    Metrics(String),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error(transparent)]
    Ingress(#[from] IngressError),
}

fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)?;

    // Sentry must be set up before the runtime starts its worker threads.
    let _sentry = config.common.logging.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });
    init_tracing(&config.common.logging);

    if let Some(metrics) = &config.common.metrics {
        init_metrics(metrics)?;
    }

    let diagnostics: Arc<dyn Diagnostics> = match config.common.logging.sentry_dsn {
        Some(_) => Arc::new(SentryDiagnostics),
        None => Arc::new(NoopDiagnostics),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(ingress::run(config.ingress, diagnostics, shutdown_signal()))?;

    tracing::info!("Stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let json = logging.json.then(|| tracing_subscriber::fmt::layer().json());
    let text = (!logging.json).then(tracing_subscriber::fmt::layer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json)
        .with(text)
        .with(sentry::integrations::tracing::layer())
        .init();
}

fn init_metrics(metrics: &MetricsConfig) -> Result<(), CliError> {
    let recorder = StatsdBuilder::from(metrics.statsd_host.as_str(), metrics.statsd_port)
        .build(Some(METRICS_PREFIX))
        .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| CliError::Metrics(e.to_string()))?;

    tracing::info!(
        host = %metrics.statsd_host,
        port = metrics.statsd_port,
        "Sending metrics to statsd"
    );
    Ok(())
}

/// Resolves on the first SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Could not install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
