use thiserror::Error;

use crate::schedule::ScheduleError;
use crate::store::StoreError;

/// Failures surfaced by the loan billing service
#[derive(Error, Debug)]
pub enum LoanError {
    /// Malformed or out-of-range input
    #[error("validation error: {0}")]
    Validation(String),

    /// Referenced user or loan is absent, soft-deleted, or not owned by the caller
    #[error("not found: {0}")]
    NotFound(String),

    /// Well-formed input that disagrees with current state
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// Schedule computation failed on data that passed validation
    #[error("invariant violated: {0}")]
    Invariant(#[from] ScheduleError),
}

impl LoanError {
    /// Short, stable label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            LoanError::Validation(_) => "validation",
            LoanError::NotFound(_) => "not_found",
            LoanError::Conflict(_) => "conflict",
            LoanError::Persistence(_) => "persistence",
            LoanError::Invariant(_) => "invariant",
        }
    }
}

pub type LoanResult<T> = Result<T, LoanError>;
