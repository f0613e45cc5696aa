//! Installment loan billing engine
//!
//! Originates loans with a flat-interest repayment schedule, reconciles
//! payments against the currently due billings under row locks, and reports
//! outstanding balances and delinquency.

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod loan;
pub mod middleware;
pub mod models;
pub mod money;
pub mod routes;
pub mod schedule;
pub mod state;
pub mod store;
