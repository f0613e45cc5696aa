//! Response envelopes shared by the API handlers
//!
//! Failures are not wrapped here; they are rendered by
//! [`ApiError`](crate::error::ApiError) as `{"error": {code, message}}`.

use serde::Serialize;

/// Successful API response
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}
