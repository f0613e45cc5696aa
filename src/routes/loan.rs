//! Loan route definitions

use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers::*;
use crate::state::AppState;

pub fn loan_routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/loans", post(create_loan))
        .route("/api/v1/loans/:loan_id/payments", post(make_payment))
        .route("/api/v1/loans/:loan_id/outstanding", get(get_outstanding))
        .route("/api/v1/loans/:loan_id/delinquency", get(get_delinquency))
        .route("/api/v1/loans/:loan_id/billings", get(list_billings))
}
