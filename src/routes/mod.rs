//! Route definitions for the loan billing API

mod loan;

pub use loan::loan_routes;

use axum::{routing::get, Router};
use std::time::Duration;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer};

use crate::handlers::health_check;
use crate::middleware;
use crate::state::AppState;

/// Full application router with its middleware stack
///
/// The timeout drops the handler future on expiry, which rolls back any
/// transaction it had open.
pub fn app_router(state: AppState, request_timeout: Duration, cors: CorsLayer) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .merge(loan_routes())
        .with_state(state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(axum::middleware::from_fn(middleware::request_tracing))
        .layer(cors)
}
