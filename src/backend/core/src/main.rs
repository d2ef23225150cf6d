//! Keystone Server - Main entry point
//!
//! Serves the authorization admin API, health and metrics.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use keystone_core::{
    api::{self, AppState},
    config::Config,
    factory::GuardStack,
    models::UserId,
    policy::PolicyService,
    telemetry::{init_telemetry, TelemetryConfig},
};

/// Performer recorded on audit entries written by the server itself.
const SYSTEM_USER: &str = "system";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = match std::env::var("KEYSTONE_CONFIG") {
        Ok(path) => Config::from_file(&path).with_context(|| format!("loading configuration from {}", path))?,
        Err(_) => Config::load().context("loading configuration from the environment")?,
    };

    let telemetry = init_telemetry(&TelemetryConfig {
        service_name: "keystone-server".to_string(),
        environment: config.environment.clone(),
        logging: config.logging.clone(),
        metrics: config.metrics.clone(),
    })?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        profile = ?config.guard.profile,
        database = config.database.is_some(),
        redis = config.redis.is_some(),
        "Starting Keystone Server"
    );

    let stack = GuardStack::from_config(&config).await?;
    stack.policy.rehydrate_engine().await?;

    let shutdown = CancellationToken::new();
    let sweeper = tokio::spawn(run_cleanup(
        stack.policy.clone(),
        config.guard.cleanup_interval,
        shutdown.clone(),
    ));

    let app = api::build_router(AppState::new(&stack, telemetry.metrics));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.server.host, config.server.port))?;
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    let _ = sweeper.await;
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Periodically deactivate expired policies and role links.
async fn run_cleanup(policy: std::sync::Arc<PolicyService>, interval: Duration, shutdown: CancellationToken) {
    if interval.is_zero() {
        return;
    }

    let performer = UserId::new(SYSTEM_USER);
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = policy.cleanup_expired(&performer).await {
                    tracing::warn!(error = %e, "Expired grant cleanup failed");
                }
            }
        }
    }
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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

    tracing::info!("Shutdown signal received");
}
