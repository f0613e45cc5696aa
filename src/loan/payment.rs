//! Payment reconciliation against the current settlement window

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::error::{LoanError, LoanResult};
use super::model::{
    Billing, BillingStatus, LoanStatus, MakePaymentParams, NewBillingHistory, NewLoanRequestHistory,
    NewPayment, PaymentReceipt,
};
use super::service::{parse_money, LoanService};
use crate::money::Money;
use crate::schedule::settlement_window;

/// Pending billings one payment must cover in full
#[derive(Debug, Clone, PartialEq)]
struct SettlementBatch {
    ids: Vec<i64>,
    billing_ids: Vec<Uuid>,
    principal: Money,
    interest: Money,
    total: Money,
    includes_final: bool,
}

impl SettlementBatch {
    fn collect(billings: &[Billing], tenure_value: i32) -> Self {
        SettlementBatch {
            ids: billings.iter().map(|b| b.id).collect(),
            billing_ids: billings.iter().map(|b| b.billing_id).collect(),
            principal: billings.iter().map(|b| b.principal_amount).sum(),
            interest: billings.iter().map(|b| b.interest_amount).sum(),
            total: billings.iter().map(|b| b.total_amount).sum(),
            includes_final: billings.iter().any(|b| b.recurring_index == tenure_value),
        }
    }

    fn histories(&self, settled_at: DateTime<Utc>) -> Vec<NewBillingHistory> {
        self.billing_ids
            .iter()
            .map(|billing_id| NewBillingHistory {
                billing_id: *billing_id,
                payment_completed_at: Some(settled_at),
                status: BillingStatus::Completed,
                created_at: settled_at,
            })
            .collect()
    }
}

impl LoanService {
    /// Settle every pending billing due up to the current window with one payment
    ///
    /// The amount must equal the window's total exactly. Concurrent payments
    /// on one loan serialize on the loan row lock; the later one re-reads the
    /// settled state and is rejected.
    pub async fn make_payment(&self, params: MakePaymentParams) -> LoanResult<PaymentReceipt> {
        let amount = parse_money("amount", &params.amount)?;
        if amount.is_negative() {
            return Err(LoanError::Validation("amount must not be negative".to_string()));
        }

        let now = self.now();
        let mut tx = self.store().begin().await?;

        let loan = tx
            .lock_loan_for_owner(params.loan_id, params.user_id)
            .await?
            .ok_or_else(|| LoanError::NotFound(format!("loan {}", params.loan_id)))?;

        let unit = loan.tenure_unit()?;
        let window = settlement_window(&self.local(loan.disbursed_at), unit, &self.local(now))?;

        let due = tx
            .lock_pending_billings_due_by(loan.id, window.with_timezone(&Utc))
            .await?;
        if due.is_empty() {
            tracing::warn!(loan_id = loan.id, window = %window, "No pending billing to settle");
            return Err(LoanError::Conflict(format!(
                "loan {} has no pending billing due by {}",
                loan.id, window
            )));
        }

        let batch = SettlementBatch::collect(&due, loan.tenure_value);
        if amount != batch.total {
            tracing::warn!(
                loan_id = loan.id,
                expected = %batch.total,
                received = %amount,
                "Payment amount does not match settlement window"
            );
            return Err(LoanError::Conflict(format!(
                "payment of {} does not match the {} due",
                amount, batch.total
            )));
        }

        let payment_id = tx
            .insert_payment(&NewPayment {
                user_id: params.user_id,
                amount,
                created_at: now,
            })
            .await?;

        let settled = tx.settle_billings(&batch.ids, payment_id, now).await?;
        if settled != batch.ids.len() as u64 {
            return Err(LoanError::Conflict(format!(
                "expected to settle {} billings of loan {}, settled {}",
                batch.ids.len(),
                loan.id,
                settled
            )));
        }

        let status = if batch.includes_final {
            LoanStatus::Completed
        } else {
            loan.status
        };
        tx.apply_loan_payment(loan.id, batch.principal, batch.interest, status, now)
            .await?;
        tx.insert_loan_histories(&[NewLoanRequestHistory {
            loan_id: loan.id,
            principal_paid_amount: batch.principal,
            interest_paid_amount: batch.interest,
            status,
            created_at: now,
        }])
        .await?;
        tx.insert_billing_histories(&batch.histories(now)).await?;
        tx.commit().await?;

        tracing::info!(
            loan_id = loan.id,
            payment_id,
            billing_count = batch.ids.len(),
            amount = %amount,
            status = ?status,
            "Payment settled"
        );

        Ok(PaymentReceipt {
            payment_id,
            loan_id: loan.id,
            amount,
            settled_billings: batch.billing_ids,
            loan_status: status,
        })
    }
}
