//! Persistence gateway for the loan billing ledger
//!
//! The service layer only talks to [`LedgerStore`] and the transactions it
//! hands out. A transaction that is dropped without [`LedgerTx::commit`] is
//! rolled back, so an early return or a cancelled future never leaves a
//! partial write behind. Row locks taken inside a transaction are held until
//! it ends.

mod memory;
mod postgres;

pub use memory::{FailPoint, MemoryLedgerStore};
pub use postgres::PgLedgerStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::loan::model::{
    Billing, LoanRequest, LoanStatus, NewBilling, NewBillingHistory, NewLoanRequest,
    NewLoanRequestHistory, NewPayment, User,
};
use crate::money::Money;

/// Persistence failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("timed out waiting for a row lock")]
    LockTimeout,

    #[error("injected failure at {0:?}")]
    Injected(FailPoint),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Transaction-free reads and transaction creation
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open a read-write transaction
    async fn begin(&self) -> StoreResult<Box<dyn LedgerTx>>;

    /// Live (not soft-deleted) user by id
    async fn find_user(&self, user_id: i64) -> StoreResult<Option<User>>;

    /// Live loan by id
    async fn find_loan(&self, loan_id: i64) -> StoreResult<Option<LoanRequest>>;

    /// Live loan by id, only if owned by `user_id`
    async fn find_loan_for_owner(&self, loan_id: i64, user_id: i64)
        -> StoreResult<Option<LoanRequest>>;

    /// Pending billings of a loan due strictly before `now`
    async fn list_overdue_billings(&self, loan_id: i64, now: DateTime<Utc>)
        -> StoreResult<Vec<Billing>>;

    /// Every billing of a loan ordered by recurring index
    async fn list_billings(&self, loan_id: i64) -> StoreResult<Vec<Billing>>;

    async fn list_loan_ids_by_status(&self, status: LoanStatus) -> StoreResult<Vec<i64>>;

    async fn health_check(&self) -> StoreResult<()>;

    /// Release underlying resources; called once on shutdown
    async fn close(&self);
}

/// Reads and writes inside one all-or-nothing unit
#[async_trait]
pub trait LedgerTx: Send {
    /// Lock and read a live loan owned by `user_id`
    async fn lock_loan_for_owner(&mut self, loan_id: i64, user_id: i64)
        -> StoreResult<Option<LoanRequest>>;

    /// Lock and read the pending billings of a loan due on or before `due_by`
    async fn lock_pending_billings_due_by(
        &mut self,
        loan_id: i64,
        due_by: DateTime<Utc>,
    ) -> StoreResult<Vec<Billing>>;

    async fn insert_loan(&mut self, loan: &NewLoanRequest) -> StoreResult<i64>;

    async fn insert_payment(&mut self, payment: &NewPayment) -> StoreResult<i64>;

    async fn insert_billings(&mut self, billings: &[NewBilling]) -> StoreResult<()>;

    async fn insert_loan_histories(&mut self, rows: &[NewLoanRequestHistory]) -> StoreResult<()>;

    async fn insert_billing_histories(&mut self, rows: &[NewBillingHistory]) -> StoreResult<()>;

    /// Mark still-pending billings as paid by `payment_id`; returns rows changed
    async fn settle_billings(
        &mut self,
        billing_ids: &[i64],
        payment_id: i64,
        settled_at: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// Add to the loan's paid totals and set its status
    async fn apply_loan_payment(
        &mut self,
        loan_id: i64,
        principal: Money,
        interest: Money,
        status: LoanStatus,
        updated_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}
