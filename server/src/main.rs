//! Haven Server entry point.
//!
//! Exit codes: 0 success, 1 generic error, 2 configuration error,
//! 3 storage unavailable.

use haven_server::{app, build_state, BootstrapError, Config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "haven_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    if let Err(e) = run().await {
        tracing::error!("{e}");
        std::process::exit(e.exit_code());
    }
}

async fn run() -> Result<(), BootstrapError> {
    let config = Config::from_env().map_err(BootstrapError::Config)?;

    tracing::info!(
        host = %config.host,
        port = config.port,
        production = config.production,
        "starting haven server"
    );

    let addr = format!("{}:{}", config.host, config.port);
    let state = build_state(config).await?;

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| BootstrapError::Other(format!("bind {addr}: {e}")))?;
    tracing::info!("server listening on {addr}");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| BootstrapError::Other(e.to_string()))
}

/// Drain in-flight requests on ctrl-c, then exit.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("shutdown signal handler failed: {e}");
        return;
    }
    tracing::info!("shutdown requested, draining in-flight requests");
}
