//! Ledger behaviour against a real PostgreSQL database

#[cfg(test)]
mod tests {
    use chrono::{FixedOffset, Utc};
    use hourglass_rs::{SafeTimeProvider, TimeSource};
    use sqlx::PgPool;
    use std::sync::Arc;
    use std::time::Duration;

    use loan_billing_engine::db::run_migrations;
    use loan_billing_engine::loan::{
        CreateLoanRequestParams, LoanError, LoanService, LoanStatus, MakePaymentParams,
    };
    use loan_billing_engine::money::Money;
    use loan_billing_engine::store::{LedgerStore, PgLedgerStore, StoreError};

    /// Helper to create a migrated test database pool
    async fn setup_test_db() -> PgPool {
        let database_url = std::env::var("TEST_DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost/loan_billing_test".to_string());

        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(4)
            .connect(&database_url)
            .await
            .expect("Failed to connect to test database");
        run_migrations(&pool).await.expect("Failed to migrate test database");
        pool
    }

    async fn insert_user(pool: &PgPool) -> i64 {
        sqlx::query_scalar::<_, i64>("INSERT INTO users (name) VALUES ($1) RETURNING id")
            .bind("ayu")
            .fetch_one(pool)
            .await
            .expect("Failed to insert user")
    }

    fn service(pool: &PgPool, lock_timeout: Duration) -> Arc<LoanService> {
        let store: Arc<dyn LedgerStore> = Arc::new(PgLedgerStore::new(pool.clone(), lock_timeout));
        Arc::new(LoanService::new(
            store,
            Arc::new(SafeTimeProvider::new(TimeSource::Test(Utc::now()))),
            FixedOffset::east_opt(7 * 3600).unwrap(),
        ))
    }

    fn create_params(user_id: i64) -> CreateLoanRequestParams {
        CreateLoanRequestParams {
            user_id,
            loan_amount: "300".to_string(),
            tenure_value: 3,
            tenure_unit: 1,
            annual_interest_rate: "10".to_string(),
        }
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_loan_round_trip() {
        let pool = setup_test_db().await;
        let user_id = insert_user(&pool).await;
        let service = service(&pool, Duration::from_secs(5));

        let loan_id = service.create_loan_request(create_params(user_id)).await.unwrap();

        let billings = service.list_billings(user_id, loan_id).await.unwrap();
        assert_eq!(billings.len(), 3);
        assert!(billings.iter().all(|b| b.total_amount == Money::from_major(110)));

        let receipt = service
            .make_payment(MakePaymentParams {
                user_id,
                loan_id,
                amount: "110".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(receipt.loan_status, LoanStatus::InRepayment);

        let loan = service.store().find_loan(loan_id).await.unwrap().unwrap();
        assert_eq!(loan.principal_paid_amount, Money::from_major(100));
        assert_eq!(
            service.get_outstanding(user_id, loan_id).await.unwrap(),
            Money::from_major(220)
        );

        let histories: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM loan_request_histories WHERE loan_id = $1",
        )
        .bind(loan_id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(histories, 2);
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_concurrent_payments_settle_once() {
        let pool = setup_test_db().await;
        let user_id = insert_user(&pool).await;
        let service = service(&pool, Duration::from_secs(5));
        let loan_id = service.create_loan_request(create_params(user_id)).await.unwrap();

        let pay = move |service: Arc<LoanService>| async move {
            service
                .make_payment(MakePaymentParams {
                    user_id,
                    loan_id,
                    amount: "110".to_string(),
                })
                .await
        };
        let (first, second) = tokio::join!(
            tokio::spawn(pay(service.clone())),
            tokio::spawn(pay(service.clone()))
        );
        let results = [first.unwrap(), second.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(LoanError::Conflict(_))))
                .count(),
            1
        );
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_lock_timeout_is_reported() {
        let pool = setup_test_db().await;
        let user_id = insert_user(&pool).await;
        let service = service(&pool, Duration::from_millis(100));
        let loan_id = service.create_loan_request(create_params(user_id)).await.unwrap();

        let mut holder = service.store().begin().await.unwrap();
        holder.lock_loan_for_owner(loan_id, user_id).await.unwrap();

        let err = service
            .make_payment(MakePaymentParams {
                user_id,
                loan_id,
                amount: "110".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LoanError::Persistence(StoreError::LockTimeout)));

        holder.rollback().await.unwrap();
    }
}
