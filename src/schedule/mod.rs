//! Repayment schedule computation
//!
//! Pure calendar and amount logic with no I/O: the cursor that walks due
//! instants and the generator that turns loan terms into billing rows.

mod cursor;
mod generator;

pub use cursor::{end_of_day, next_due, settlement_window};
pub use generator::{
    generate_schedule, installment_amounts, InstallmentAmounts, LoanTerms, RepaymentSchedule,
};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Cadence of a loan's installments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenureUnit {
    Day,
    Week,
    Month,
    Year,
}

impl TenureUnit {
    /// Persisted code (1 day, 2 week, 3 month, 4 year)
    pub fn code(self) -> i16 {
        match self {
            TenureUnit::Day => 1,
            TenureUnit::Week => 2,
            TenureUnit::Month => 3,
            TenureUnit::Year => 4,
        }
    }

    pub fn from_code(code: i16) -> Result<Self, ScheduleError> {
        match code {
            1 => Ok(TenureUnit::Day),
            2 => Ok(TenureUnit::Week),
            3 => Ok(TenureUnit::Month),
            4 => Ok(TenureUnit::Year),
            other => Err(ScheduleError::UnrecognizedUnit(other)),
        }
    }
}

impl TryFrom<i16> for TenureUnit {
    type Error = ScheduleError;

    fn try_from(code: i16) -> Result<Self, Self::Error> {
        TenureUnit::from_code(code)
    }
}

/// Failures of schedule computation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("unrecognized tenure unit code: {0}")]
    UnrecognizedUnit(i16),

    #[error("calendar cannot advance by one {unit:?} from {from}")]
    CalendarOverflow { unit: TenureUnit, from: NaiveDateTime },

    #[error("local end of day {0} does not exist in the billing calendar")]
    NonexistentLocalTime(NaiveDateTime),

    #[error("invalid loan terms: {0}")]
    InvalidTerms(String),
}
