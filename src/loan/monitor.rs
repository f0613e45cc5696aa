//! Scheduled delinquency sweep
//!
//! Advisory only: delinquent loans are reported, never transitioned.

use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};

use super::error::LoanResult;
use super::service::LoanService;

/// Periodically evaluates every loan in repayment for delinquency
#[derive(Clone)]
pub struct DelinquencyMonitor {
    loan_service: Arc<LoanService>,
}

impl DelinquencyMonitor {
    pub fn new(loan_service: Arc<LoanService>) -> Self {
        Self { loan_service }
    }

    /// Evaluate all loans in repayment once and return the delinquent ids
    ///
    /// A loan whose evaluation fails is logged and skipped.
    pub async fn sweep(&self) -> LoanResult<Vec<i64>> {
        let loan_ids = self.loan_service.active_loan_ids().await?;
        let mut delinquent = Vec::new();

        for loan_id in &loan_ids {
            match self.loan_service.is_delinquent(*loan_id).await {
                Ok(true) => delinquent.push(*loan_id),
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(loan_id, kind = e.kind(), error = %e, "Error evaluating delinquency");
                }
            }
        }

        tracing::info!(
            checked = loan_ids.len(),
            delinquent = delinquent.len(),
            "Delinquency sweep finished"
        );
        Ok(delinquent)
    }

    /// Register the sweep on a six-field cron schedule and start the scheduler
    ///
    /// The caller owns the returned scheduler and shuts it down.
    pub async fn start(self, schedule: &str) -> Result<JobScheduler, JobSchedulerError> {
        tracing::info!(schedule, "Starting delinquency monitor");

        let scheduler = JobScheduler::new().await?;
        let job = Job::new_async(schedule, move |_id, _scheduler| {
            let monitor = self.clone();
            Box::pin(async move {
                if let Err(e) = monitor.sweep().await {
                    tracing::error!(error = %e, "Delinquency sweep failed");
                }
            })
        })?;

        scheduler.add(job).await?;
        scheduler.start().await?;
        Ok(scheduler)
    }
}
