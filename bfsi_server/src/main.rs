mod chat;
mod csv_preview;
mod error;
mod fraud;
mod routes;
mod state;

use anyhow::Result;
use common::ServiceConfig;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use state::{ServiceContext, SERVICE_NAME};

const DEFAULT_LOG_FILTER: &str = "bfsi_server=info,tower_http=info";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .init();

    info!("======================================================================");
    info!("{} - Starting", SERVICE_NAME);
    info!("======================================================================");

    let config = ServiceConfig::load()?;
    let bind_addr = config.bind_addr();

    // Artifact loading is blocking and can take a while for the chat model.
    let context = tokio::task::spawn_blocking(move || ServiceContext::load(config)).await?;

    info!("  Fraud scoring: {}", if context.fraud.is_some() { "ready" } else { "unavailable" });
    info!("  Chat model: {}", if context.chat_model_loaded() { "ready" } else { "unavailable" });
    info!("  CSV preview: {}", context.csv.path().display());
    info!("");
    info!("Server ready on http://{}", bind_addr);
    info!("======================================================================");

    let app = routes::router(Arc::new(context));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
}
