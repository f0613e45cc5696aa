//! API handlers for the loan billing engine

mod health;
mod loan;

pub use health::{health_check, HealthResponse};
pub use loan::*;
