//! In-process ledger store
//!
//! Committed rows live behind one mutex. A transaction reads committed state,
//! stages its writes, and applies them all at once on commit. Row locks are
//! per-loan and per-billing async mutexes whose guards the transaction holds
//! until it commits or is dropped; a lock entry nobody holds or waits on is
//! then removed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};

use super::{LedgerStore, LedgerTx, StoreError, StoreResult};
use crate::loan::model::{
    Billing, BillingHistory, BillingStatus, LoanRequest, LoanRequestHistory, LoanStatus,
    NewBilling, NewBillingHistory, NewLoanRequest, NewLoanRequestHistory, NewPayment, Payment,
    User,
};
use crate::money::Money;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Write operations that can be made to fail once, for exercising rollback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    InsertLoan,
    InsertPayment,
    InsertBillings,
    InsertLoanHistories,
    InsertBillingHistories,
    SettleBillings,
    ApplyLoanPayment,
    Commit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum RowKey {
    Loan(i64),
    Billing(i64),
}

#[derive(Default)]
struct Tables {
    users: BTreeMap<i64, User>,
    loans: BTreeMap<i64, LoanRequest>,
    billings: BTreeMap<i64, Billing>,
    payments: BTreeMap<i64, Payment>,
    loan_histories: Vec<LoanRequestHistory>,
    billing_histories: Vec<BillingHistory>,
}

// Sequences advance even when the transaction that drew a value rolls back
#[derive(Default)]
struct Sequences {
    user: i64,
    loan: i64,
    billing: i64,
    payment: i64,
    loan_history: i64,
    billing_history: i64,
}

fn draw(seq: &mut i64) -> i64 {
    *seq += 1;
    *seq
}

struct Shared {
    tables: Mutex<Tables>,
    sequences: Mutex<Sequences>,
    row_locks: Mutex<HashMap<RowKey, Arc<RowLock<()>>>>,
    fail_points: Mutex<HashSet<FailPoint>>,
    lock_timeout: Duration,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        guard(&self.tables)
    }

    fn sequences(&self) -> MutexGuard<'_, Sequences> {
        guard(&self.sequences)
    }

    fn row_lock(&self, key: RowKey) -> Arc<RowLock<()>> {
        guard(&self.row_locks).entry(key).or_default().clone()
    }

    /// Forget lock entries nobody else holds or waits on
    fn prune_row_locks(&self, keys: impl IntoIterator<Item = RowKey>) {
        let mut locks = guard(&self.row_locks);
        for key in keys {
            if locks.get(&key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(&key);
            }
        }
    }

    fn trip(&self, point: FailPoint) -> StoreResult<()> {
        if guard(&self.fail_points).remove(&point) {
            return Err(StoreError::Injected(point));
        }
        Ok(())
    }
}

/// Ledger store kept in process memory, used by tests and local runs
#[derive(Clone)]
pub struct MemoryLedgerStore {
    shared: Arc<Shared>,
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                sequences: Mutex::new(Sequences::default()),
                row_locks: Mutex::new(HashMap::new()),
                fail_points: Mutex::new(HashSet::new()),
                lock_timeout,
            }),
        }
    }

    /// Add a borrower and return it
    pub fn insert_user(&self, name: &str, at: DateTime<Utc>) -> User {
        let id = draw(&mut self.shared.sequences().user);
        let user = User {
            id,
            name: name.to_string(),
            created_at: at,
            updated_at: at,
            deleted_at: None,
        };
        self.shared.tables().users.insert(id, user.clone());
        user
    }

    pub fn soft_delete_user(&self, user_id: i64, at: DateTime<Utc>) {
        if let Some(user) = self.shared.tables().users.get_mut(&user_id) {
            user.deleted_at = Some(at);
        }
    }

    /// Edit a committed loan row in place
    pub fn patch_loan(&self, loan_id: i64, patch: impl FnOnce(&mut LoanRequest)) {
        if let Some(loan) = self.shared.tables().loans.get_mut(&loan_id) {
            patch(loan);
        }
    }

    /// Make the next call to `point` fail
    pub fn fail_next(&self, point: FailPoint) {
        guard(&self.shared.fail_points).insert(point);
    }

    pub fn loans(&self) -> Vec<LoanRequest> {
        self.shared.tables().loans.values().cloned().collect()
    }

    pub fn billings_for(&self, loan_id: i64) -> Vec<Billing> {
        let mut rows: Vec<Billing> = self
            .shared
            .tables()
            .billings
            .values()
            .filter(|b| b.loan_id == loan_id)
            .cloned()
            .collect();
        rows.sort_by_key(|b| b.recurring_index);
        rows
    }

    pub fn payments(&self) -> Vec<Payment> {
        self.shared.tables().payments.values().cloned().collect()
    }

    pub fn loan_histories(&self, loan_id: i64) -> Vec<LoanRequestHistory> {
        self.shared
            .tables()
            .loan_histories
            .iter()
            .filter(|h| h.loan_id == loan_id)
            .cloned()
            .collect()
    }

    pub fn billing_histories(&self) -> Vec<BillingHistory> {
        self.shared.tables().billing_histories.clone()
    }

    fn live_loan(tables: &Tables, loan_id: i64) -> Option<&LoanRequest> {
        tables.loans.get(&loan_id).filter(|l| l.deleted_at.is_none())
    }

    fn live_billings(tables: &Tables, loan_id: i64) -> impl Iterator<Item = &Billing> {
        tables
            .billings
            .values()
            .filter(move |b| b.loan_id == loan_id && b.deleted_at.is_none())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn begin(&self) -> StoreResult<Box<dyn LedgerTx>> {
        Ok(Box::new(MemoryLedgerTx {
            shared: self.shared.clone(),
            held: HeldLocks {
                shared: self.shared.clone(),
                guards: BTreeMap::new(),
            },
            staged: Vec::new(),
        }))
    }

    async fn find_user(&self, user_id: i64) -> StoreResult<Option<User>> {
        Ok(self
            .shared
            .tables()
            .users
            .get(&user_id)
            .filter(|u| !u.is_deleted())
            .cloned())
    }

    async fn find_loan(&self, loan_id: i64) -> StoreResult<Option<LoanRequest>> {
        Ok(Self::live_loan(&self.shared.tables(), loan_id).cloned())
    }

    async fn find_loan_for_owner(
        &self,
        loan_id: i64,
        user_id: i64,
    ) -> StoreResult<Option<LoanRequest>> {
        Ok(Self::live_loan(&self.shared.tables(), loan_id)
            .filter(|l| l.user_id == user_id)
            .cloned())
    }

    async fn list_overdue_billings(
        &self,
        loan_id: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Billing>> {
        let tables = self.shared.tables();
        let mut rows: Vec<Billing> = Self::live_billings(&tables, loan_id)
            .filter(|b| b.is_pending() && b.due_at < now)
            .cloned()
            .collect();
        rows.sort_by_key(|b| b.recurring_index);
        Ok(rows)
    }

    async fn list_billings(&self, loan_id: i64) -> StoreResult<Vec<Billing>> {
        let tables = self.shared.tables();
        let mut rows: Vec<Billing> = Self::live_billings(&tables, loan_id).cloned().collect();
        rows.sort_by_key(|b| b.recurring_index);
        Ok(rows)
    }

    async fn list_loan_ids_by_status(&self, status: LoanStatus) -> StoreResult<Vec<i64>> {
        Ok(self
            .shared
            .tables()
            .loans
            .values()
            .filter(|l| l.status == status && l.deleted_at.is_none())
            .map(|l| l.id)
            .collect())
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn close(&self) {}
}

enum Staged {
    Loan(LoanRequest),
    Payment(Payment),
    Billings(Vec<Billing>),
    LoanHistories(Vec<LoanRequestHistory>),
    BillingHistories(Vec<BillingHistory>),
    Settle {
        ids: Vec<i64>,
        payment_id: i64,
        at: DateTime<Utc>,
    },
    ApplyPayment {
        loan_id: i64,
        principal: Money,
        interest: Money,
        status: LoanStatus,
        at: DateTime<Utc>,
    },
}

/// Row locks owned by one transaction, released together
struct HeldLocks {
    shared: Arc<Shared>,
    guards: BTreeMap<RowKey, OwnedMutexGuard<()>>,
}

impl Drop for HeldLocks {
    fn drop(&mut self) {
        let guards = std::mem::take(&mut self.guards);
        let keys: Vec<RowKey> = guards.keys().copied().collect();
        drop(guards);
        self.shared.prune_row_locks(keys);
    }
}

/// Staged writes plus the row locks taken so far
pub struct MemoryLedgerTx {
    shared: Arc<Shared>,
    held: HeldLocks,
    staged: Vec<Staged>,
}

impl MemoryLedgerTx {
    async fn acquire(&mut self, key: RowKey) -> StoreResult<()> {
        if self.held.guards.contains_key(&key) {
            return Ok(());
        }
        let lock = self.shared.row_lock(key);
        let owned = tokio::time::timeout(self.shared.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| StoreError::LockTimeout)?;
        self.held.guards.insert(key, owned);
        Ok(())
    }

    fn apply(tables: &mut Tables, write: Staged) {
        match write {
            Staged::Loan(loan) => {
                tables.loans.insert(loan.id, loan);
            }
            Staged::Payment(payment) => {
                tables.payments.insert(payment.id, payment);
            }
            Staged::Billings(rows) => {
                for billing in rows {
                    tables.billings.insert(billing.id, billing);
                }
            }
            Staged::LoanHistories(rows) => tables.loan_histories.extend(rows),
            Staged::BillingHistories(rows) => tables.billing_histories.extend(rows),
            Staged::Settle { ids, payment_id, at } => {
                for id in ids {
                    if let Some(billing) = tables.billings.get_mut(&id).filter(|b| b.is_pending()) {
                        billing.payment_id = Some(payment_id);
                        billing.payment_completed_at = Some(at);
                        billing.status = BillingStatus::Completed;
                        billing.updated_at = at;
                    }
                }
            }
            Staged::ApplyPayment {
                loan_id,
                principal,
                interest,
                status,
                at,
            } => {
                if let Some(loan) = tables.loans.get_mut(&loan_id) {
                    loan.principal_paid_amount += principal;
                    loan.interest_paid_amount += interest;
                    loan.status = status;
                    loan.updated_at = at;
                }
            }
        }
    }
}

#[async_trait]
impl LedgerTx for MemoryLedgerTx {
    async fn lock_loan_for_owner(
        &mut self,
        loan_id: i64,
        user_id: i64,
    ) -> StoreResult<Option<LoanRequest>> {
        self.acquire(RowKey::Loan(loan_id)).await?;
        Ok(MemoryLedgerStore::live_loan(&self.shared.tables(), loan_id)
            .filter(|l| l.user_id == user_id)
            .cloned())
    }

    async fn lock_pending_billings_due_by(
        &mut self,
        loan_id: i64,
        due_by: DateTime<Utc>,
    ) -> StoreResult<Vec<Billing>> {
        let matches = |b: &Billing| b.is_pending() && b.due_at <= due_by;

        let candidates: Vec<i64> = {
            let tables = self.shared.tables();
            MemoryLedgerStore::live_billings(&tables, loan_id)
                .filter(|b| matches(*b))
                .map(|b| b.id)
                .collect()
        };
        for id in &candidates {
            self.acquire(RowKey::Billing(*id)).await?;
        }

        // rows may have been settled while this transaction waited
        let tables = self.shared.tables();
        let mut rows: Vec<Billing> = candidates
            .iter()
            .filter_map(|id| tables.billings.get(id))
            .filter(|b| matches(*b))
            .cloned()
            .collect();
        rows.sort_by_key(|b| b.recurring_index);
        Ok(rows)
    }

    async fn insert_loan(&mut self, loan: &NewLoanRequest) -> StoreResult<i64> {
        self.shared.trip(FailPoint::InsertLoan)?;
        let id = draw(&mut self.shared.sequences().loan);
        self.staged.push(Staged::Loan(LoanRequest {
            id,
            user_id: loan.user_id,
            loan_amount: loan.loan_amount,
            principal_paid_amount: loan.principal_paid_amount,
            interest_paid_amount: loan.interest_paid_amount,
            disbursed_at: loan.disbursed_at,
            tenure_value: loan.tenure_value,
            tenure_unit: loan.tenure_unit.code(),
            status: loan.status,
            annual_interest_rate: loan.annual_interest_rate,
            created_at: loan.created_at,
            updated_at: loan.created_at,
            deleted_at: None,
        }));
        Ok(id)
    }

    async fn insert_payment(&mut self, payment: &NewPayment) -> StoreResult<i64> {
        self.shared.trip(FailPoint::InsertPayment)?;
        let id = draw(&mut self.shared.sequences().payment);
        self.staged.push(Staged::Payment(Payment {
            id,
            user_id: payment.user_id,
            amount: payment.amount,
            created_at: payment.created_at,
            updated_at: payment.created_at,
        }));
        Ok(id)
    }

    async fn insert_billings(&mut self, billings: &[NewBilling]) -> StoreResult<()> {
        self.shared.trip(FailPoint::InsertBillings)?;
        let rows = {
            let mut seq = self.shared.sequences();
            billings
                .iter()
                .map(|b| Billing {
                    id: draw(&mut seq.billing),
                    billing_id: b.billing_id,
                    loan_id: b.loan_id,
                    payment_id: None,
                    recurring_index: b.recurring_index,
                    principal_amount: b.principal_amount,
                    interest_amount: b.interest_amount,
                    total_amount: b.total_amount,
                    due_at: b.due_at,
                    payment_completed_at: None,
                    status: b.status,
                    created_at: b.created_at,
                    updated_at: b.created_at,
                    deleted_at: None,
                })
                .collect()
        };
        self.staged.push(Staged::Billings(rows));
        Ok(())
    }

    async fn insert_loan_histories(&mut self, rows: &[NewLoanRequestHistory]) -> StoreResult<()> {
        self.shared.trip(FailPoint::InsertLoanHistories)?;
        let rows = {
            let mut seq = self.shared.sequences();
            rows.iter()
                .map(|h| LoanRequestHistory {
                    id: draw(&mut seq.loan_history),
                    loan_id: h.loan_id,
                    principal_paid_amount: h.principal_paid_amount,
                    interest_paid_amount: h.interest_paid_amount,
                    status: h.status,
                    created_at: h.created_at,
                })
                .collect()
        };
        self.staged.push(Staged::LoanHistories(rows));
        Ok(())
    }

    async fn insert_billing_histories(&mut self, rows: &[NewBillingHistory]) -> StoreResult<()> {
        self.shared.trip(FailPoint::InsertBillingHistories)?;
        let rows = {
            let mut seq = self.shared.sequences();
            rows.iter()
                .map(|h| BillingHistory {
                    id: draw(&mut seq.billing_history),
                    billing_id: h.billing_id,
                    payment_completed_at: h.payment_completed_at,
                    status: h.status,
                    created_at: h.created_at,
                })
                .collect()
        };
        self.staged.push(Staged::BillingHistories(rows));
        Ok(())
    }

    async fn settle_billings(
        &mut self,
        billing_ids: &[i64],
        payment_id: i64,
        settled_at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        self.shared.trip(FailPoint::SettleBillings)?;
        let changed = {
            let tables = self.shared.tables();
            billing_ids
                .iter()
                .filter(|id| tables.billings.get(*id).is_some_and(Billing::is_pending))
                .count() as u64
        };
        self.staged.push(Staged::Settle {
            ids: billing_ids.to_vec(),
            payment_id,
            at: settled_at,
        });
        Ok(changed)
    }

    async fn apply_loan_payment(
        &mut self,
        loan_id: i64,
        principal: Money,
        interest: Money,
        status: LoanStatus,
        updated_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.shared.trip(FailPoint::ApplyLoanPayment)?;
        self.staged.push(Staged::ApplyPayment {
            loan_id,
            principal,
            interest,
            status,
            at: updated_at,
        });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.shared.trip(FailPoint::Commit)?;
        let MemoryLedgerTx {
            shared,
            held,
            staged,
        } = *self;
        {
            let mut tables = shared.tables();
            for write in staged {
                Self::apply(&mut tables, write);
            }
        }
        drop(held);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    use crate::schedule::TenureUnit;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn new_loan(user_id: i64) -> NewLoanRequest {
        NewLoanRequest {
            user_id,
            loan_amount: Money::from_major(1_000),
            principal_paid_amount: Money::ZERO,
            interest_paid_amount: Money::ZERO,
            disbursed_at: at(),
            tenure_value: 2,
            tenure_unit: TenureUnit::Day,
            status: LoanStatus::InRepayment,
            annual_interest_rate: Decimal::from(10),
            created_at: at(),
        }
    }

    fn new_billing(loan_id: i64, index: i32) -> NewBilling {
        NewBilling {
            billing_id: Uuid::new_v4(),
            loan_id,
            recurring_index: index,
            principal_amount: Money::from_major(500),
            interest_amount: Money::from_major(50),
            total_amount: Money::from_major(550),
            due_at: at() + chrono::Duration::days(index as i64),
            status: BillingStatus::Pending,
            created_at: at(),
        }
    }

    async fn seeded(store: &MemoryLedgerStore) -> (i64, i64) {
        let user = store.insert_user("ayu", at());
        let mut tx = store.begin().await.unwrap();
        let loan_id = tx.insert_loan(&new_loan(user.id)).await.unwrap();
        tx.insert_billings(&[new_billing(loan_id, 1), new_billing(loan_id, 2)])
            .await
            .unwrap();
        tx.commit().await.unwrap();
        (user.id, loan_id)
    }

    #[tokio::test]
    async fn test_writes_invisible_until_commit() {
        let store = MemoryLedgerStore::new();
        let user = store.insert_user("ayu", at());

        let mut tx = store.begin().await.unwrap();
        let loan_id = tx.insert_loan(&new_loan(user.id)).await.unwrap();
        assert!(store.find_loan(loan_id).await.unwrap().is_none());

        tx.commit().await.unwrap();
        assert!(store.find_loan(loan_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_dropped_transaction_discards_writes() {
        let store = MemoryLedgerStore::new();
        let user = store.insert_user("ayu", at());

        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_loan(&new_loan(user.id)).await.unwrap();
        }
        assert!(store.loans().is_empty());
    }

    #[tokio::test]
    async fn test_owner_scoping() {
        let store = MemoryLedgerStore::new();
        let (user_id, loan_id) = seeded(&store).await;

        assert!(store.find_loan_for_owner(loan_id, user_id).await.unwrap().is_some());
        assert!(store.find_loan_for_owner(loan_id, user_id + 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_row_lock_times_out() {
        let store = MemoryLedgerStore::with_lock_timeout(Duration::from_millis(20));
        let (user_id, loan_id) = seeded(&store).await;

        let mut first = store.begin().await.unwrap();
        first.lock_loan_for_owner(loan_id, user_id).await.unwrap();

        let mut second = store.begin().await.unwrap();
        let err = second.lock_loan_for_owner(loan_id, user_id).await.unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout));

        drop(first);
        assert!(second.lock_loan_for_owner(loan_id, user_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_locked_billings_recheck_after_wait() {
        let store = MemoryLedgerStore::new();
        let (_, loan_id) = seeded(&store).await;
        let due_by = at() + chrono::Duration::days(1);

        let mut first = store.begin().await.unwrap();
        let rows = first.lock_pending_billings_due_by(loan_id, due_by).await.unwrap();
        assert_eq!(rows.len(), 1);

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut second = store.begin().await.unwrap();
                second.lock_pending_billings_due_by(loan_id, due_by).await.unwrap()
            })
        };

        let ids: Vec<i64> = rows.iter().map(|b| b.id).collect();
        assert_eq!(first.settle_billings(&ids, 99, at()).await.unwrap(), 1);
        first.commit().await.unwrap();

        assert!(waiter.await.unwrap().is_empty());
        assert_eq!(store.billings_for(loan_id)[0].payment_id, Some(99));
    }

    #[tokio::test]
    async fn test_released_row_locks_are_forgotten() {
        let store = MemoryLedgerStore::new();
        let (user_id, loan_id) = seeded(&store).await;
        let due_by = at() + chrono::Duration::days(2);

        let mut tx = store.begin().await.unwrap();
        tx.lock_loan_for_owner(loan_id, user_id).await.unwrap();
        assert_eq!(tx.lock_pending_billings_due_by(loan_id, due_by).await.unwrap().len(), 2);
        assert_eq!(guard(&store.shared.row_locks).len(), 3);
        tx.commit().await.unwrap();
        assert!(guard(&store.shared.row_locks).is_empty());

        let mut tx = store.begin().await.unwrap();
        tx.lock_loan_for_owner(loan_id, user_id).await.unwrap();
        drop(tx);
        assert!(guard(&store.shared.row_locks).is_empty());
    }

    #[tokio::test]
    async fn test_fail_point_fires_once() {
        let store = MemoryLedgerStore::new();
        let user = store.insert_user("ayu", at());
        store.fail_next(FailPoint::InsertLoan);

        let mut tx = store.begin().await.unwrap();
        assert!(matches!(
            tx.insert_loan(&new_loan(user.id)).await,
            Err(StoreError::Injected(FailPoint::InsertLoan))
        ));
        assert!(tx.insert_loan(&new_loan(user.id)).await.is_ok());
    }

    #[tokio::test]
    async fn test_soft_deleted_user_is_hidden() {
        let store = MemoryLedgerStore::new();
        let user = store.insert_user("ayu", at());
        store.soft_delete_user(user.id, at());
        assert!(store.find_user(user.id).await.unwrap().is_none());
    }
}
