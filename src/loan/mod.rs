//! Installment loans: origination, payment reconciliation and read models

pub mod error;
pub mod model;
mod monitor;
mod payment;
mod service;

pub use error::{LoanError, LoanResult};
pub use model::*;
pub use monitor::DelinquencyMonitor;
pub use service::{LoanService, MAX_TENURE_PERIODS};
