//! Loan service layer - origination and read-side queries

use chrono::{DateTime, FixedOffset, Utc};
use hourglass_rs::SafeTimeProvider;
use rust_decimal::Decimal;
use std::sync::Arc;

use super::error::{LoanError, LoanResult};
use super::model::{
    Billing, CreateLoanRequestParams, LoanRequest, LoanStatus, NewLoanRequest,
    NewLoanRequestHistory, DELINQUENCY_THRESHOLD,
};
use crate::money::Money;
use crate::schedule::{
    generate_schedule, installment_amounts, LoanTerms, ScheduleError, TenureUnit,
};
use crate::store::LedgerStore;

/// Upper bound on periods per loan (100 years of daily installments)
pub const MAX_TENURE_PERIODS: i32 = 36_500;

/// Installment loan service over an injected ledger store
pub struct LoanService {
    store: Arc<dyn LedgerStore>,
    clock: Arc<SafeTimeProvider>,
    billing_offset: FixedOffset,
}

impl LoanService {
    /// `billing_offset` is the calendar due instants are normalised in
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<SafeTimeProvider>,
        billing_offset: FixedOffset,
    ) -> Self {
        Self {
            store,
            clock,
            billing_offset,
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub(super) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(super) fn local(&self, at: DateTime<Utc>) -> DateTime<FixedOffset> {
        at.with_timezone(&self.billing_offset)
    }

    /// Originate a loan and its full billing schedule in one transaction
    ///
    /// Input is validated before anything is written, including that the
    /// schedule amounts fit in a `Decimal`. Calling this twice creates two
    /// independent loans.
    pub async fn create_loan_request(&self, params: CreateLoanRequestParams) -> LoanResult<i64> {
        let loan_amount = parse_money("loan_amount", &params.loan_amount)?;
        if !loan_amount.is_positive() {
            return Err(LoanError::Validation(
                "loan_amount must be greater than zero".to_string(),
            ));
        }
        if params.tenure_value < 1 || params.tenure_value > MAX_TENURE_PERIODS {
            return Err(LoanError::Validation(format!(
                "tenure_value must be between 1 and {}",
                MAX_TENURE_PERIODS
            )));
        }
        let tenure_unit = TenureUnit::from_code(params.tenure_unit)
            .map_err(|e| LoanError::Validation(e.to_string()))?;
        let annual_rate = parse_rate(&params.annual_interest_rate)?;
        installment_amounts(loan_amount, annual_rate, params.tenure_value as u32)
            .map_err(|_| {
                LoanError::Validation(
                    "loan_amount and annual_interest_rate are too large to schedule".to_string(),
                )
            })?;

        if self.store.find_user(params.user_id).await?.is_none() {
            return Err(LoanError::Validation(format!(
                "user {} does not exist",
                params.user_id
            )));
        }

        let now = self.now();
        let mut tx = self.store.begin().await?;

        let loan_id = tx
            .insert_loan(&NewLoanRequest {
                user_id: params.user_id,
                loan_amount,
                principal_paid_amount: Money::ZERO,
                interest_paid_amount: Money::ZERO,
                disbursed_at: now,
                tenure_value: params.tenure_value,
                tenure_unit,
                status: LoanStatus::InRepayment,
                annual_interest_rate: annual_rate,
                created_at: now,
            })
            .await?;

        let schedule = generate_schedule(
            &LoanTerms {
                loan_id,
                principal: loan_amount,
                annual_rate,
                tenure_count: params.tenure_value as u32,
                tenure_unit,
                disbursed_at: self.local(now),
            },
            now,
        )?;

        tx.insert_billings(&schedule.billings).await?;
        tx.insert_billing_histories(&schedule.histories).await?;
        tx.insert_loan_histories(&[NewLoanRequestHistory {
            loan_id,
            principal_paid_amount: Money::ZERO,
            interest_paid_amount: Money::ZERO,
            status: LoanStatus::InRepayment,
            created_at: now,
        }])
        .await?;
        tx.commit().await?;

        tracing::info!(
            loan_id,
            user_id = params.user_id,
            billing_count = schedule.billings.len(),
            installment = %schedule.total_per_period,
            "Loan request created"
        );

        Ok(loan_id)
    }

    /// Remaining principal plus interest projected on it
    ///
    /// Unlike the flat schedule, interest here is charged on the remaining
    /// principal only. A completed loan owes nothing.
    pub async fn get_outstanding(&self, user_id: i64, loan_id: i64) -> LoanResult<Money> {
        let loan = self.owned_loan(user_id, loan_id).await?;
        if loan.is_completed() {
            return Ok(Money::ZERO);
        }

        let principal = loan.outstanding_principal();
        let interest = principal
            .checked_percentage(loan.annual_interest_rate)
            .ok_or_else(|| {
                LoanError::Invariant(ScheduleError::InvalidTerms(format!(
                    "outstanding interest of loan {} overflows",
                    loan_id
                )))
            })?;

        Ok(principal + interest)
    }

    /// True when more than [`DELINQUENCY_THRESHOLD`] pending billings are past due
    ///
    /// Advisory read: takes no lock and may miss a payment being committed.
    pub async fn is_delinquent(&self, loan_id: i64) -> LoanResult<bool> {
        if self.store.find_loan(loan_id).await?.is_none() {
            return Err(LoanError::NotFound(format!("loan {}", loan_id)));
        }

        let overdue = self.store.list_overdue_billings(loan_id, self.now()).await?;
        let delinquent = overdue.len() > DELINQUENCY_THRESHOLD;
        if delinquent {
            tracing::warn!(loan_id, overdue = overdue.len(), "Loan is delinquent");
        }

        Ok(delinquent)
    }

    /// The loan's schedule as currently stored
    pub async fn list_billings(&self, user_id: i64, loan_id: i64) -> LoanResult<Vec<Billing>> {
        self.owned_loan(user_id, loan_id).await?;
        Ok(self.store.list_billings(loan_id).await?)
    }

    /// Ids of loans still being repaid
    pub async fn active_loan_ids(&self) -> LoanResult<Vec<i64>> {
        Ok(self
            .store
            .list_loan_ids_by_status(LoanStatus::InRepayment)
            .await?)
    }

    async fn owned_loan(&self, user_id: i64, loan_id: i64) -> LoanResult<LoanRequest> {
        if self.store.find_user(user_id).await?.is_none() {
            return Err(LoanError::NotFound(format!("user {}", user_id)));
        }
        self.store
            .find_loan_for_owner(loan_id, user_id)
            .await?
            .ok_or_else(|| LoanError::NotFound(format!("loan {}", loan_id)))
    }
}

/// Parse a decimal amount exactly, without rounding
pub(super) fn parse_money(field: &str, raw: &str) -> LoanResult<Money> {
    Money::from_str_exact(raw)
        .map_err(|e| LoanError::Validation(format!("{} is not a decimal ({}): {:?}", field, e, raw)))
}

fn parse_rate(raw: &str) -> LoanResult<Decimal> {
    let rate = Decimal::from_str_exact(raw.trim()).map_err(|e| {
        LoanError::Validation(format!(
            "annual_interest_rate is not a decimal ({}): {:?}",
            e, raw
        ))
    })?;
    if rate.is_sign_negative() && !rate.is_zero() {
        return Err(LoanError::Validation(
            "annual_interest_rate must not be negative".to_string(),
        ));
    }
    Ok(rate)
}
