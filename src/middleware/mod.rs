//! Middleware for the loan billing API

mod cors;
mod tracing;

pub use self::cors::configure_cors;
pub use self::tracing::{request_tracing, REQUEST_ID_HEADER};
