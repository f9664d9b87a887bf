// `server.rs` composes the process: it registers Prometheus metrics,
// optionally serves them over HTTP, builds the recorder, subscribes, and
// then drives the recorder forever.
use crate::{config::Config, handlers, metrics::Metrics, recorder::Recorder};
use axum::{Extension, Router, routing::get};
use log::{error, info};
use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task;

pub async fn run(config: Config) -> anyhow::Result<()> {
    let metrics = Metrics::new()?;

    if let Some(addr) = config.metrics_listen {
        let registry = metrics.registry.clone();
        task::spawn(async move {
            if let Err(e) = serve_metrics(addr, registry).await {
                error!("Metrics server ended: {:#}", e);
            }
        });
    }

    let mut recorder = Recorder::connect(&config, metrics)?;
    recorder.subscribe(&config.topics).await?;

    // No exit condition: the loop only ends when the broker connection fails.
    loop {
        recorder.run().await?;
    }
}

fn app(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .route("/health", get(handlers::health_handler))
        .layer(Extension(registry))
}

async fn serve_metrics(addr: SocketAddr, registry: Arc<Registry>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Serving metrics on http://{}/metrics", addr);
    axum::serve(listener, app(registry)).await?;
    Ok(())
}
