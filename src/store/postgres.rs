//! PostgreSQL ledger store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, Postgres};
use sqlx::{QueryBuilder, Transaction};
use std::time::Duration;

use super::{LedgerStore, LedgerTx, StoreError, StoreResult};
use crate::loan::model::{
    Billing, BillingStatus, LoanRequest, LoanStatus, NewBilling, NewBillingHistory,
    NewLoanRequest, NewLoanRequestHistory, NewPayment, User,
};
use crate::money::Money;

// SQLSTATE lock_not_available, raised when lock_timeout elapses
const LOCK_NOT_AVAILABLE: &str = "55P03";

// Postgres caps a statement at 65535 bind parameters
const INSERT_CHUNK_ROWS: usize = 1_000;

const LOAN_COLUMNS: &str = "id, user_id, loan_amount, principal_paid_amount, interest_paid_amount, \
     disbursed_at, tenure_value, tenure_unit, status, annual_interest_rate, \
     created_at, updated_at, deleted_at";

const BILLING_COLUMNS: &str = "id, billing_id, loan_id, payment_id, recurring_index, \
     principal_amount, interest_amount, total_amount, due_at, payment_completed_at, \
     status, created_at, updated_at, deleted_at";

fn map_err(err: sqlx::Error) -> StoreError {
    let lock_timeout = err
        .as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == LOCK_NOT_AVAILABLE);

    if lock_timeout {
        StoreError::LockTimeout
    } else {
        StoreError::Database(err)
    }
}

/// Ledger store backed by a shared connection pool
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn begin(&self) -> StoreResult<Box<dyn LedgerTx>> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        // SET cannot take bind parameters; the value is an integer we own
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = {}",
            self.lock_timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;

        Ok(Box::new(PgLedgerTx { tx }))
    }

    async fn find_user(&self, user_id: i64) -> StoreResult<Option<User>> {
        sqlx::query_as::<_, User>(
            "SELECT id, name, created_at, updated_at, deleted_at FROM users \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)
    }

    async fn find_loan(&self, loan_id: i64) -> StoreResult<Option<LoanRequest>> {
        sqlx::query_as::<_, LoanRequest>(&format!(
            "SELECT {LOAN_COLUMNS} FROM loan_requests WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(loan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)
    }

    async fn find_loan_for_owner(
        &self,
        loan_id: i64,
        user_id: i64,
    ) -> StoreResult<Option<LoanRequest>> {
        sqlx::query_as::<_, LoanRequest>(&format!(
            "SELECT {LOAN_COLUMNS} FROM loan_requests \
             WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL"
        ))
        .bind(loan_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)
    }

    async fn list_overdue_billings(
        &self,
        loan_id: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Billing>> {
        sqlx::query_as::<_, Billing>(&format!(
            "SELECT {BILLING_COLUMNS} FROM billings \
             WHERE loan_id = $1 AND status = $2 AND due_at < $3 AND deleted_at IS NULL \
             ORDER BY recurring_index"
        ))
        .bind(loan_id)
        .bind(BillingStatus::Pending)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)
    }

    async fn list_billings(&self, loan_id: i64) -> StoreResult<Vec<Billing>> {
        sqlx::query_as::<_, Billing>(&format!(
            "SELECT {BILLING_COLUMNS} FROM billings \
             WHERE loan_id = $1 AND deleted_at IS NULL ORDER BY recurring_index"
        ))
        .bind(loan_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)
    }

    async fn list_loan_ids_by_status(&self, status: LoanStatus) -> StoreResult<Vec<i64>> {
        sqlx::query_scalar::<_, i64>(
            "SELECT id FROM loan_requests WHERE status = $1 AND deleted_at IS NULL ORDER BY id",
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// One database transaction; rolled back by sqlx when dropped uncommitted
pub struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn lock_loan_for_owner(
        &mut self,
        loan_id: i64,
        user_id: i64,
    ) -> StoreResult<Option<LoanRequest>> {
        sqlx::query_as::<_, LoanRequest>(&format!(
            "SELECT {LOAN_COLUMNS} FROM loan_requests \
             WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL FOR UPDATE"
        ))
        .bind(loan_id)
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_err)
    }

    async fn lock_pending_billings_due_by(
        &mut self,
        loan_id: i64,
        due_by: DateTime<Utc>,
    ) -> StoreResult<Vec<Billing>> {
        sqlx::query_as::<_, Billing>(&format!(
            "SELECT {BILLING_COLUMNS} FROM billings \
             WHERE loan_id = $1 AND status = $2 AND due_at <= $3 AND deleted_at IS NULL \
             ORDER BY recurring_index FOR UPDATE"
        ))
        .bind(loan_id)
        .bind(BillingStatus::Pending)
        .bind(due_by)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_err)
    }

    async fn insert_loan(&mut self, loan: &NewLoanRequest) -> StoreResult<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO loan_requests (
                user_id, loan_amount, principal_paid_amount, interest_paid_amount,
                disbursed_at, tenure_value, tenure_unit, status, annual_interest_rate,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            RETURNING id
            "#,
        )
        .bind(loan.user_id)
        .bind(loan.loan_amount)
        .bind(loan.principal_paid_amount)
        .bind(loan.interest_paid_amount)
        .bind(loan.disbursed_at)
        .bind(loan.tenure_value)
        .bind(loan.tenure_unit.code())
        .bind(loan.status)
        .bind(loan.annual_interest_rate)
        .bind(loan.created_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_err)
    }

    async fn insert_payment(&mut self, payment: &NewPayment) -> StoreResult<i64> {
        sqlx::query_scalar::<_, i64>(
            "INSERT INTO payments (user_id, amount, created_at, updated_at) \
             VALUES ($1, $2, $3, $3) RETURNING id",
        )
        .bind(payment.user_id)
        .bind(payment.amount)
        .bind(payment.created_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_err)
    }

    async fn insert_billings(&mut self, billings: &[NewBilling]) -> StoreResult<()> {
        for chunk in billings.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO billings (billing_id, loan_id, recurring_index, principal_amount, \
                 interest_amount, total_amount, due_at, status, created_at, updated_at) ",
            );
            builder.push_values(chunk, |mut row, b| {
                row.push_bind(b.billing_id)
                    .push_bind(b.loan_id)
                    .push_bind(b.recurring_index)
                    .push_bind(b.principal_amount)
                    .push_bind(b.interest_amount)
                    .push_bind(b.total_amount)
                    .push_bind(b.due_at)
                    .push_bind(b.status)
                    .push_bind(b.created_at)
                    .push_bind(b.created_at);
            });
            builder
                .build()
                .execute(&mut *self.tx)
                .await
                .map_err(map_err)?;
        }
        Ok(())
    }

    async fn insert_loan_histories(&mut self, rows: &[NewLoanRequestHistory]) -> StoreResult<()> {
        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO loan_request_histories (loan_id, principal_paid_amount, \
                 interest_paid_amount, status, created_at) ",
            );
            builder.push_values(chunk, |mut row, h| {
                row.push_bind(h.loan_id)
                    .push_bind(h.principal_paid_amount)
                    .push_bind(h.interest_paid_amount)
                    .push_bind(h.status)
                    .push_bind(h.created_at);
            });
            builder
                .build()
                .execute(&mut *self.tx)
                .await
                .map_err(map_err)?;
        }
        Ok(())
    }

    async fn insert_billing_histories(&mut self, rows: &[NewBillingHistory]) -> StoreResult<()> {
        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO billing_histories (billing_id, payment_completed_at, status, created_at) ",
            );
            builder.push_values(chunk, |mut row, h| {
                row.push_bind(h.billing_id)
                    .push_bind(h.payment_completed_at)
                    .push_bind(h.status)
                    .push_bind(h.created_at);
            });
            builder
                .build()
                .execute(&mut *self.tx)
                .await
                .map_err(map_err)?;
        }
        Ok(())
    }

    async fn settle_billings(
        &mut self,
        billing_ids: &[i64],
        payment_id: i64,
        settled_at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE billings
            SET payment_id = $1, payment_completed_at = $2, status = $3, updated_at = $2
            WHERE id = ANY($4) AND status = $5
            "#,
        )
        .bind(payment_id)
        .bind(settled_at)
        .bind(BillingStatus::Completed)
        .bind(billing_ids)
        .bind(BillingStatus::Pending)
        .execute(&mut *self.tx)
        .await
        .map_err(map_err)?;

        Ok(result.rows_affected())
    }

    async fn apply_loan_payment(
        &mut self,
        loan_id: i64,
        principal: Money,
        interest: Money,
        status: LoanStatus,
        updated_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE loan_requests
            SET principal_paid_amount = principal_paid_amount + $1,
                interest_paid_amount = interest_paid_amount + $2,
                status = $3,
                updated_at = $4
            WHERE id = $5
            "#,
        )
        .bind(principal)
        .bind(interest)
        .bind(status)
        .bind(updated_at)
        .bind(loan_id)
        .execute(&mut *self.tx)
        .await
        .map_err(map_err)?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await.map_err(map_err)
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await.map_err(map_err)
    }
}
