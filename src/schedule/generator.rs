//! Flat-interest repayment schedule generation
//!
//! Interest is computed once on the full principal and spread evenly across
//! the periods; it is never recomputed against a declining balance. The final
//! installment's principal absorbs the rounding remainder of the even split so
//! the schedule sums back to the loan amount exactly.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::{next_due, ScheduleError, TenureUnit};
use crate::loan::model::{BillingStatus, NewBilling, NewBillingHistory};
use crate::money::Money;

/// Terms a schedule is derived from
#[derive(Debug, Clone)]
pub struct LoanTerms<Tz: TimeZone> {
    pub loan_id: i64,
    pub principal: Money,
    pub annual_rate: Decimal,
    pub tenure_count: u32,
    pub tenure_unit: TenureUnit,
    pub disbursed_at: DateTime<Tz>,
}

/// Billings for a loan plus their initial ledger rows
#[derive(Debug, Clone)]
pub struct RepaymentSchedule {
    pub principal_per_period: Money,
    pub interest_per_period: Money,
    pub total_per_period: Money,
    pub billings: Vec<NewBilling>,
    pub histories: Vec<NewBillingHistory>,
}

impl RepaymentSchedule {
    pub fn total_interest(&self) -> Money {
        self.billings.iter().map(|b| b.interest_amount).sum()
    }

    pub fn total_amount(&self) -> Money {
        self.billings.iter().map(|b| b.total_amount).sum()
    }
}

/// Per-period amounts of a flat schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallmentAmounts {
    pub principal_per_period: Money,
    pub interest_per_period: Money,
    pub total_per_period: Money,
    pub final_principal: Money,
    /// Principal plus all interest over the tenure
    pub total_repayable: Money,
}

/// Compute installment amounts, failing when any step overflows `Decimal`
pub fn installment_amounts(
    principal: Money,
    annual_rate: Decimal,
    periods: u32,
) -> Result<InstallmentAmounts, ScheduleError> {
    if periods == 0 {
        return Err(ScheduleError::InvalidTerms(
            "tenure count must be at least 1".to_string(),
        ));
    }
    let overflow = || ScheduleError::InvalidTerms("loan terms overflow exact arithmetic".to_string());

    let principal_per_period = principal.checked_split(periods).ok_or_else(overflow)?;
    let interest_per_period = principal
        .checked_percentage(annual_rate)
        .and_then(|interest| interest.checked_split(periods))
        .ok_or_else(overflow)?;
    let total_per_period = principal_per_period
        .checked_add(interest_per_period)
        .ok_or_else(overflow)?;
    let final_principal = principal_per_period
        .checked_times(periods - 1)
        .and_then(|scheduled| principal.checked_sub(scheduled))
        .and_then(|last| last.checked_add(interest_per_period).map(|_| last))
        .ok_or_else(overflow)?;
    let total_repayable = interest_per_period
        .checked_times(periods)
        .and_then(|interest| principal.checked_add(interest))
        .ok_or_else(overflow)?;

    Ok(InstallmentAmounts {
        principal_per_period,
        interest_per_period,
        total_per_period,
        final_principal,
        total_repayable,
    })
}

/// Build one pending billing per period, due at successive cursor instants
pub fn generate_schedule<Tz: TimeZone>(
    terms: &LoanTerms<Tz>,
    created_at: DateTime<Utc>,
) -> Result<RepaymentSchedule, ScheduleError> {
    let periods = terms.tenure_count;
    let InstallmentAmounts {
        principal_per_period,
        interest_per_period,
        total_per_period,
        final_principal,
        ..
    } = installment_amounts(terms.principal, terms.annual_rate, periods)?;

    let mut billings = Vec::with_capacity(periods as usize);
    let mut histories = Vec::with_capacity(periods as usize);
    let mut cursor = terms.disbursed_at.clone();

    for recurring_index in 1..=periods {
        cursor = next_due(&cursor, terms.tenure_unit)?;

        let principal_amount = if recurring_index == periods {
            final_principal
        } else {
            principal_per_period
        };
        let billing_id = Uuid::new_v4();

        billings.push(NewBilling {
            billing_id,
            loan_id: terms.loan_id,
            recurring_index: recurring_index as i32,
            principal_amount,
            interest_amount: interest_per_period,
            total_amount: principal_amount + interest_per_period,
            due_at: cursor.with_timezone(&Utc),
            status: BillingStatus::Pending,
            created_at,
        });
        histories.push(NewBillingHistory {
            billing_id,
            payment_completed_at: None,
            status: BillingStatus::Pending,
            created_at,
        });
    }

    Ok(RepaymentSchedule {
        principal_per_period,
        interest_per_period,
        total_per_period,
        billings,
        histories,
    })
}
