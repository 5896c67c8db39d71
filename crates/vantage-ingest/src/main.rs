//! Vantage ingest binary entry point.
//!
//! Runs the four supervised stream processors and the status API
//! (port 3200) until Ctrl+C or SIGTERM.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vantage_broker::BrokerProvider;
use vantage_ingest::{
    api::{status_router, StatusApiState},
    fanout::Publisher,
    queue::DurableQueue,
    storage::Storage,
    supervisor::ProcessorSupervisor,
    IngestConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vantage_ingest=info,vantage_broker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting vantage-ingest");

    let config = IngestConfig::load()?;
    tracing::info!(
        status_addr = %config.server.status_addr,
        stream_prefix = %config.broker.stream_prefix,
        batch_size = config.processor.batch_size,
        "Configuration loaded"
    );

    let prometheus = if config.server.prometheus {
        Some(PrometheusBuilder::new().install_recorder()?)
    } else {
        None
    };

    let provider = BrokerProvider::from_config(&config.broker.backends()).await?;
    let queue = DurableQueue::new(provider.stream(), config.broker.stream_prefix.clone());
    let publisher = Publisher::new(provider.fanout());
    tracing::info!("Broker backends connected");

    let storage = Arc::new(Storage::from_config(&config.storage).await?);

    let supervisor =
        ProcessorSupervisor::new(queue.clone(), storage, publisher, config.processor.clone());
    let cancel = CancellationToken::new();
    let processors = supervisor.start(cancel.clone());

    let mut status_state = StatusApiState::new(supervisor.registry(), queue);
    if let Some(handle) = prometheus {
        status_state = status_state.with_prometheus(handle);
    }

    let status_addr = config.server.status_addr;
    let listener = tokio::net::TcpListener::bind(status_addr).await?;
    let server_cancel = cancel.clone();
    let status_server = tokio::spawn(async move {
        axum::serve(listener, status_router(status_state))
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    tracing::info!(status = %status_addr, "Status API listening");

    shutdown_signal().await;
    cancel.cancel();

    tracing::info!("Stopping stream processors");
    processors.shutdown().await;

    match status_server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Status API server error"),
        Err(e) => tracing::error!(error = %e, "Status API task failed"),
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
