//! Loan billing engine server
//!
//! Serves the loan API over HTTP and runs the scheduled delinquency sweep.

use anyhow::Context;
use hourglass_rs::{SafeTimeProvider, TimeSource};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;

use loan_billing_engine::config::Config;
use loan_billing_engine::loan::{DelinquencyMonitor, LoanService};
use loan_billing_engine::middleware::configure_cors;
use loan_billing_engine::routes::app_router;
use loan_billing_engine::state::AppState;
use loan_billing_engine::store::{LedgerStore, PgLedgerStore};
use loan_billing_engine::db;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!(
        environment = config.environment.as_str(),
        billing_offset = %config.billing_offset,
        "Starting loan billing engine"
    );

    let pool = db::create_pool(&config).await?;
    db::run_migrations(&pool).await?;

    let store: Arc<dyn LedgerStore> = Arc::new(PgLedgerStore::new(pool, config.db_lock_timeout));
    let clock = Arc::new(SafeTimeProvider::new(TimeSource::System));
    let loan_service = Arc::new(LoanService::new(
        store.clone(),
        clock,
        config.billing_offset,
    ));

    let mut scheduler = DelinquencyMonitor::new(loan_service.clone())
        .start(&config.delinquency_cron)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start delinquency monitor: {:?}", e))?;

    let app = app_router(
        AppState::new(loan_service),
        config.request_timeout,
        configure_cors(config.cors_allowed_origins.as_deref()),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Health check at http://{}/health", addr);

    // Serve with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Err(e) = scheduler.shutdown().await {
        tracing::error!(error = ?e, "Failed to stop delinquency monitor");
    }
    store.close().await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
