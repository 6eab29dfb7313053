use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use courier::context::AppContext;
use courier::{Config, bootstrap, routes, shutdown_signal};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::from_env()?);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.rust_log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("=== Courier Starting ===");
    info!("Pod Number: {}", config.pod_number);
    info!("Kafka Enabled: {}", config.kafka.enabled);
    info!("Kafka Brokers: {}", config.kafka.brokers);
    info!("Kafka Consumer Group: {}", config.kafka.consumer_group);

    // Topic provisioning and client construction failures abort startup
    let pipeline = bootstrap::start(&config)
        .await
        .context("Failed to start pipeline")?;

    let relays = pipeline.health();
    let context = Arc::new(AppContext::new(
        config.clone(),
        pipeline.publisher.clone(),
        relays.clone(),
    ));
    context.set_ready(true);
    let app = routes::create_router(context.clone());

    info!("Courier listening on {}", config.bind_address);
    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .context("Failed to bind to address")?;

    // A stopped relay ends the process so the orchestrator restarts the pod
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_signal() => {}
                _ = relays.stopped() => {
                    error!("A relay stopped, shutting down");
                }
            }
        })
        .await
        .context("Failed to start server")?;

    context.set_ready(false);
    info!("HTTP server stopped, stopping relays...");
    pipeline
        .shutdown(Duration::from_secs(config.shutdown_grace_secs))
        .await?;

    info!("Courier stopped gracefully");
    Ok(())
}
