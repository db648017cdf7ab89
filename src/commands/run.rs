use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;

use postrelay::config::Config;
use postrelay::engine::Engine;
use postrelay::metrics;
use postrelay::storage::PostgresStore;
use postrelay::transport::{DryRunFactory, GatewayFactory, TransportFactory};

use super::serve::metrics_server;

pub async fn run(config: Config, dry_run: bool, metrics_addr: Option<String>) -> Result<()> {
    config.validate()?;

    if let Err(e) = metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics initialization failed, continuing without metrics");
    }

    let store = PostgresStore::connect(&config.postgres_config())
        .await
        .context("Failed to connect to PostgreSQL")?;
    store
        .init_schema()
        .await
        .context("Failed to initialize publication log schema")?;

    let gateway = GatewayFactory::new(config.gateway_config()).context("Failed to build gateway client")?;
    let factory: Arc<dyn TransportFactory> = if dry_run {
        tracing::warn!("Dry run: sends, pins and deletes are only logged");
        Arc::new(DryRunFactory::new(gateway))
    } else {
        Arc::new(gateway)
    };

    let engine = Arc::new(Engine::new(&config, Arc::new(store), factory)?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Some(addr) = metrics_addr {
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics_server(addr, rx).await {
                tracing::error!(error = %e, "Metrics server stopped");
            }
        });
    }

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for interrupt");
            // dropping the sender would stop the engine
            std::future::pending::<()>().await;
        }
        tracing::info!("Interrupt received");
        shutdown_tx.send(true).ok();
    });

    engine
        .run(Some(config.listener_config()), shutdown_rx)
        .await
        .context("Engine failed")?;

    Ok(())
}
