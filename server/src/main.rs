//! Vine server binary.
//!
//! Loads settings from the environment, installs telemetry and serves until
//! SIGINT or SIGTERM, then runs the shutdown sequence.

use tokio::signal;
use tracing::{error, info};
use vine_server::infrastructure::{config::Settings, telemetry::TelemetryBuilder};
use vine_server::server::{Server, ServerOptions};
use vine_server::util::panic;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Settings::new()?;

    TelemetryBuilder::new(&config.server.name, env!("CARGO_PKG_VERSION"))
        .with_settings(&config.telemetry)
        .with_metrics()
        .init()?;
    panic::install_hook();

    info!(service = %config.server.name, "Vine Server Starting...");

    let server = Server::new(ServerOptions::from_settings(&config.server));
    if let Err(e) = server.start().await {
        error!(error = %e, "Failed to start server");
        return Err(e.into());
    }

    info!(
        address = ?server.local_addr(),
        "Vine Server Initialized. Waiting for shutdown signal..."
    );

    shutdown_signal().await;

    info!("Shutdown signal received, cleaning up...");
    server.stop().await?;

    info!("Vine Server Shutdown Complete.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
