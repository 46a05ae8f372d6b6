//! Payroll jobs on the queue.
//!
//! [`PayrollJob`] is the payload carried by the payroll queue and
//! [`PayrollJobHandler`] runs it: a monthly job fans out into one
//! organisation job per organisation, and an organisation job runs
//! [`OrganizationPayrollJob`].  [`trigger_monthly_payroll`] is the
//! entry point for cron triggers and admin actions.

use crate::error::{PayrollError, QueueError};
use crate::job::{OrganizationPayrollJob, OrganizationPayrollRequest};
use crate::queue::{JobHandler, JobId, JobPayload, JobQueue};
use crate::scheduler::{fan_out_monthly, JobSink};
use crate::store::PayrollStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyPayrollRequest {
    pub year: i32,
    pub month: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data", rename_all = "kebab-case")]
pub enum PayrollJob {
    MonthlyPayrollGeneration(MonthlyPayrollRequest),
    OrganizationPayrollGeneration(OrganizationPayrollRequest),
}

impl JobPayload for PayrollJob {
    fn name(&self) -> &'static str {
        match self {
            PayrollJob::MonthlyPayrollGeneration(_) => "monthly-payroll-generation",
            PayrollJob::OrganizationPayrollGeneration(_) => "organization-payroll-generation",
        }
    }
}

#[async_trait]
impl JobSink for JobQueue<PayrollJob> {
    async fn enqueue_organization(
        &self,
        request: OrganizationPayrollRequest,
    ) -> Result<JobId, QueueError> {
        self.add(PayrollJob::OrganizationPayrollGeneration(request)).await
    }
}

fn check_month(year: i32, month: u32) -> Result<(), QueueError> {
    if !(1..=12).contains(&month) || !(1970..=9999).contains(&year) {
        return Err(QueueError::InvalidJob(format!(
            "no such payroll month {year}-{month}"
        )));
    }
    Ok(())
}

/// Enqueue the fan-out for `year`/`month`.
pub async fn trigger_monthly_payroll(
    queue: &JobQueue<PayrollJob>,
    year: i32,
    month: u32,
) -> Result<JobId, QueueError> {
    check_month(year, month)?;
    let id = queue
        .add(PayrollJob::MonthlyPayrollGeneration(MonthlyPayrollRequest {
            year,
            month,
        }))
        .await?;
    info!(year, month, job_id = %id, "Monthly payroll triggered");
    Ok(id)
}

pub struct PayrollJobHandler {
    store: Arc<dyn PayrollStore>,
    queue: JobQueue<PayrollJob>,
    organization_job: OrganizationPayrollJob,
}

impl PayrollJobHandler {
    /// `queue` receives the organisation jobs a monthly job fans out.
    pub fn new(
        store: Arc<dyn PayrollStore>,
        queue: JobQueue<PayrollJob>,
        organization_job: OrganizationPayrollJob,
    ) -> Self {
        Self {
            store,
            queue,
            organization_job,
        }
    }
}

#[async_trait]
impl JobHandler<PayrollJob> for PayrollJobHandler {
    async fn handle(&self, job: &PayrollJob) -> anyhow::Result<serde_json::Value> {
        match *job {
            PayrollJob::MonthlyPayrollGeneration(MonthlyPayrollRequest { year, month }) => {
                let report = fan_out_monthly(self.store.as_ref(), &self.queue, year, month).await?;
                // Organisations that did get queued are skipped on retry
                // by the organisation job itself.
                if !report.failed.is_empty() {
                    return Err(PayrollError::PartialFanOut {
                        failed: report.failed.len(),
                        total: report.total(),
                    }
                    .into());
                }
                Ok(serde_json::to_value(report)?)
            }
            PayrollJob::OrganizationPayrollGeneration(request) => {
                let outcome = self.organization_job.run(request).await?;
                Ok(serde_json::to_value(outcome)?)
            }
        }
    }
}
