//! Loan billing models and data structures

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::money::Money;
use crate::schedule::{ScheduleError, TenureUnit};

/// Overdue pending billings tolerated before a loan counts as delinquent
pub const DELINQUENCY_THRESHOLD: usize = 2;

/// Loan lifecycle status
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq, Hash)]
#[sqlx(type_name = "loan_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    InRepayment,
    Defaulted,
    Completed,
}

/// Billing settlement status
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq, Hash)]
#[sqlx(type_name = "billing_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BillingStatus {
    Pending,
    Completed,
}

/// Borrower identity, read-only for the billing engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// An originated loan
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct LoanRequest {
    pub id: i64,
    pub user_id: i64,
    pub loan_amount: Money,
    pub principal_paid_amount: Money,
    pub interest_paid_amount: Money,
    pub disbursed_at: DateTime<Utc>,
    pub tenure_value: i32,
    pub tenure_unit: i16, // persisted code, see TenureUnit::code
    pub status: LoanStatus,
    pub annual_interest_rate: Decimal, // percent, e.g. 10.75
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl LoanRequest {
    /// Decode the stored tenure unit; a failure means the row is corrupt
    pub fn tenure_unit(&self) -> Result<TenureUnit, ScheduleError> {
        TenureUnit::from_code(self.tenure_unit)
    }

    pub fn is_completed(&self) -> bool {
        self.status == LoanStatus::Completed
    }

    /// Principal still owed
    pub fn outstanding_principal(&self) -> Money {
        self.loan_amount - self.principal_paid_amount
    }
}

/// Loan row to insert; the store assigns the id
#[derive(Debug, Clone, PartialEq)]
pub struct NewLoanRequest {
    pub user_id: i64,
    pub loan_amount: Money,
    pub principal_paid_amount: Money,
    pub interest_paid_amount: Money,
    pub disbursed_at: DateTime<Utc>,
    pub tenure_value: i32,
    pub tenure_unit: TenureUnit,
    pub status: LoanStatus,
    pub annual_interest_rate: Decimal,
    pub created_at: DateTime<Utc>,
}

/// One scheduled installment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct Billing {
    pub id: i64,
    pub billing_id: Uuid, // external identifier, stable across stores
    pub loan_id: i64,
    pub payment_id: Option<i64>,
    pub recurring_index: i32,
    pub principal_amount: Money,
    pub interest_amount: Money,
    pub total_amount: Money,
    pub due_at: DateTime<Utc>,
    pub payment_completed_at: Option<DateTime<Utc>>,
    pub status: BillingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Billing {
    pub fn is_pending(&self) -> bool {
        self.status == BillingStatus::Pending
    }
}

/// Billing row to insert
#[derive(Debug, Clone, PartialEq)]
pub struct NewBilling {
    pub billing_id: Uuid,
    pub loan_id: i64,
    pub recurring_index: i32,
    pub principal_amount: Money,
    pub interest_amount: Money,
    pub total_amount: Money,
    pub due_at: DateTime<Utc>,
    pub status: BillingStatus,
    pub created_at: DateTime<Utc>,
}

/// An accepted payment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct Payment {
    pub id: i64,
    pub user_id: i64,
    pub amount: Money,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPayment {
    pub user_id: i64,
    pub amount: Money,
    pub created_at: DateTime<Utc>,
}

/// Ledger row written at origination and on every settled payment
///
/// The amounts are the principal and interest applied by that event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct LoanRequestHistory {
    pub id: i64,
    pub loan_id: i64,
    pub principal_paid_amount: Money,
    pub interest_paid_amount: Money,
    pub status: LoanStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewLoanRequestHistory {
    pub loan_id: i64,
    pub principal_paid_amount: Money,
    pub interest_paid_amount: Money,
    pub status: LoanStatus,
    pub created_at: DateTime<Utc>,
}

/// Ledger row written per billing at creation and at settlement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct BillingHistory {
    pub id: i64,
    pub billing_id: Uuid,
    pub payment_completed_at: Option<DateTime<Utc>>,
    pub status: BillingStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewBillingHistory {
    pub billing_id: Uuid,
    pub payment_completed_at: Option<DateTime<Utc>>,
    pub status: BillingStatus,
    pub created_at: DateTime<Utc>,
}

/// Input for loan origination, amounts as decimal strings
#[derive(Debug, Clone, Deserialize)]
pub struct CreateLoanRequestParams {
    pub user_id: i64,
    pub loan_amount: String,
    pub tenure_value: i32,
    pub tenure_unit: i16,
    pub annual_interest_rate: String,
}

/// Input for a payment against the current settlement window
#[derive(Debug, Clone, Deserialize)]
pub struct MakePaymentParams {
    pub user_id: i64,
    pub loan_id: i64,
    pub amount: String,
}

/// Outcome of a settled payment
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PaymentReceipt {
    pub payment_id: i64,
    pub loan_id: i64,
    pub amount: Money,
    pub settled_billings: Vec<Uuid>,
    pub loan_status: LoanStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn loan(status: LoanStatus) -> LoanRequest {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        LoanRequest {
            id: 1,
            user_id: 7,
            loan_amount: Money::from_major(1_000),
            principal_paid_amount: Money::from_major(400),
            interest_paid_amount: Money::from_major(40),
            disbursed_at: at,
            tenure_value: 10,
            tenure_unit: 3,
            status,
            annual_interest_rate: Decimal::from(10),
            created_at: at,
            updated_at: at,
            deleted_at: None,
        }
    }

    #[test]
    fn test_outstanding_principal() {
        assert_eq!(loan(LoanStatus::InRepayment).outstanding_principal(), Money::from_major(600));
    }

    #[test]
    fn test_tenure_unit_decoding() {
        let mut l = loan(LoanStatus::InRepayment);
        assert_eq!(l.tenure_unit().unwrap(), TenureUnit::Month);
        l.tenure_unit = 9;
        assert_eq!(l.tenure_unit(), Err(ScheduleError::UnrecognizedUnit(9)));
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_string(&LoanStatus::InRepayment).unwrap(), "\"in_repayment\"");
        assert_eq!(serde_json::to_string(&BillingStatus::Completed).unwrap(), "\"completed\"");
        assert!(loan(LoanStatus::Completed).is_completed());
    }
}
