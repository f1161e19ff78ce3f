//! Stratus Kubernetes Operator
//!
//! This operator manages the lifecycle of Stratus clusters on Kubernetes.
//!
//! ## Usage
//!
//! ```bash
//! # Run the operator against the current kubeconfig context
//! stratus-operator
//!
//! # Run inside the cluster, watching one namespace, with debug logging
//! RUST_LOG=debug stratus-operator --in-cluster --namespace stratus
//! ```

use std::sync::Arc;

use clap::Parser;
use stratus_operator::{server, Args, ClusterController, OperatorConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = OperatorConfig::try_from(Args::parse())?;

    info!("Starting Stratus Kubernetes Operator");
    info!(
        "Watching namespace: {}",
        config.namespace.as_deref().unwrap_or("all")
    );

    let client = config.client().await?;
    info!("Connected to Kubernetes API server");

    let token = CancellationToken::new();
    let controller = ClusterController::new(client, &config).await;
    let router = server::router(Arc::new(controller.store()), controller.has_synced());

    let mut controller_handle = tokio::spawn(controller.run(token.clone()));
    let mut server_handle = tokio::spawn(server::serve(config.status_addr, router, token.clone()));

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut controller_handle => {
            match result {
                Ok(Err(e)) => error!("Cluster controller error: {}", e),
                Err(e) => error!("Cluster controller task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
        result = &mut server_handle => {
            match result {
                Ok(Err(e)) => error!("Status server error: {}", e),
                Err(e) => error!("Status server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    // Stop workers and informers, then wait for in-flight syncs
    token.cancel();
    if !controller_handle.is_finished() {
        if let Ok(Err(e)) = controller_handle.await {
            error!("Cluster controller error during shutdown: {}", e);
        }
    }
    if !server_handle.is_finished() {
        let _ = server_handle.await;
    }

    info!("Stratus Operator shutting down");
    Ok(())
}
