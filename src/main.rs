use std::sync::Arc;

use tokio::signal;

use morrigan::config::Config;
use morrigan::lifecycle::Server;
use morrigan::observability;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = Config::load()?;
    let _log_guard = observability::init_tracing(&config.logger);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.http.port,
        secure = config.http.secure,
        "Starting morrigan server"
    );

    let server = Arc::new(Server::new(config));
    server.start().await?;

    let reason = shutdown_signal().await;
    server.stop(&reason).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM; the resolved value becomes the stop reason.
async fn shutdown_signal() -> String {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
            "SIGINT".to_string()
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
            "SIGTERM".to_string()
        },
    }
}
