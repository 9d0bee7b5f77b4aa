pub mod config;
pub mod diagnostics;
pub mod errors;
pub mod keys;
pub mod ledger;
pub mod message;
pub mod metrics_defs;
pub mod pipeline;
pub mod project_config;
pub mod rate_limit;
pub mod service;
pub mod store;
pub mod testutils;

use crate::config::Config;
use crate::diagnostics::Diagnostics;
use crate::errors::IngressError;
use crate::pipeline::AdmissionPipeline;
use crate::rate_limit::FixedWindowLimiter;
use crate::service::IngressService;
use crate::store::{RedisStore, Store};
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Connects to both stores and serves the push and admin listeners until
/// `shutdown` resolves.
pub async fn run(
    config: Config,
    diagnostics: Arc<dyn Diagnostics>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), IngressError> {
    let ingress_store: Arc<dyn Store> = Arc::new(
        RedisStore::connect(&config.ingress_store.redis_url)
            .await
            .map_err(|source| IngressError::StoreConnection {
                name: "ingress",
                source,
            })?,
    );
    let rate_limit_store: Arc<dyn Store> = Arc::new(
        RedisStore::connect(&config.rate_limit_store.redis_url)
            .await
            .map_err(|source| IngressError::StoreConnection {
                name: "rate limit",
                source,
            })?,
    );

    let pipeline = AdmissionPipeline::new(ingress_store.clone(), diagnostics);
    let limiter = Arc::new(FixedWindowLimiter::new(
        rate_limit_store.clone(),
        config.rate_limit.max_requests,
        Duration::from_secs(config.rate_limit.window_secs),
    ));
    let ingress_service = IngressService::new(
        pipeline,
        limiter,
        config.max_payload_bytes,
        config.homepage.clone(),
    );

    let admin_service = AdminService::<_, IngressError>::new(move || {
        let ingress_store = ingress_store.clone();
        let rate_limit_store = rate_limit_store.clone();
        async move { ingress_store.ping().await.is_ok() && rate_limit_store.ping().await.is_ok() }
    });

    let (stop_tx, stop_rx) = watch::channel(());
    let stopped = |mut rx: watch::Receiver<()>| async move {
        let _ = rx.changed().await;
    };

    tracing::info!(
        host = %config.listener.host,
        port = config.listener.port,
        admin_port = config.admin_listener.port,
        "Starting push ingress"
    );

    let ingress_task = run_http_service(
        &config.listener.host,
        config.listener.port,
        ingress_service,
        stopped(stop_rx.clone()),
    );
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin_service,
        stopped(stop_rx),
    );
    let signal_task = async move {
        shutdown.await;
        tracing::info!("Shutting down");
        let _ = stop_tx.send(());
        Ok::<(), IngressError>(())
    };

    tokio::try_join!(ingress_task, admin_task, signal_task)?;
    Ok(())
}
