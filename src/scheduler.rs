//! Monthly fan-out.
//!
//! One monthly trigger becomes one organisation payroll job per
//! organisation.  A failure to enqueue one organisation is logged and
//! reported but does not stop the others.

use crate::error::{QueueError, Result};
use crate::job::OrganizationPayrollRequest;
use crate::queue::JobId;
use crate::store::PayrollStore;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

/// Where fan-out sends organisation jobs.
#[async_trait]
pub trait JobSink: Send + Sync {
    async fn enqueue_organization(
        &self,
        request: OrganizationPayrollRequest,
    ) -> std::result::Result<JobId, QueueError>;
}

/// Per-organisation result of a fan-out.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FanOutReport {
    pub year: i32,
    pub month: u32,
    pub enqueued: Vec<(Uuid, JobId)>,
    pub failed: Vec<(Uuid, String)>,
}

impl FanOutReport {
    pub fn total(&self) -> usize {
        self.enqueued.len() + self.failed.len()
    }
}

/// Enqueue an organisation payroll job for every organisation.
///
/// Fails only when the organisations cannot be listed, in which case
/// nothing was enqueued.
pub async fn fan_out_monthly(
    store: &dyn PayrollStore,
    sink: &dyn JobSink,
    year: i32,
    month: u32,
) -> Result<FanOutReport> {
    info!(year, month, "Starting monthly payroll generation");
    let organizations = store.list_organizations().await?;
    info!(organizations = organizations.len(), "Found organisations");

    let mut report = FanOutReport {
        year,
        month,
        ..FanOutReport::default()
    };
    for org in organizations {
        let request = OrganizationPayrollRequest {
            organization_id: org.id,
            year,
            month,
        };
        match sink.enqueue_organization(request).await {
            Ok(job_id) => {
                info!(organization = %org.name, organization_id = %org.id, %job_id, "Queued payroll generation");
                report.enqueued.push((org.id, job_id));
            }
            Err(e) => {
                error!(organization = %org.name, organization_id = %org.id, error = %e, "Failed to queue payroll generation");
                report.failed.push((org.id, e.to_string()));
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PayrollError, StoreError};
    use crate::models::Organization;
    use crate::store::{InMemoryStore, SeedData};
    use tokio::sync::Mutex;

    /// Records requests and refuses one organisation.
    struct RecordingSink {
        refuse: Uuid,
        seen: Mutex<Vec<OrganizationPayrollRequest>>,
    }

    #[async_trait]
    impl JobSink for RecordingSink {
        async fn enqueue_organization(
            &self,
            request: OrganizationPayrollRequest,
        ) -> std::result::Result<JobId, QueueError> {
            if request.organization_id == self.refuse {
                return Err(QueueError::Closed("payroll".into()));
            }
            self.seen.lock().await.push(request);
            Ok(JobId(Uuid::new_v4()))
        }
    }

    fn orgs(n: u128) -> Vec<Organization> {
        (1..=n)
            .map(|i| Organization {
                id: Uuid::from_u128(i),
                name: format!("Org {i}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn one_failed_enqueue_does_not_block_the_rest() {
        let store = InMemoryStore::from_seed(SeedData {
            organizations: orgs(3),
            ..SeedData::default()
        });
        let sink = RecordingSink {
            refuse: Uuid::from_u128(2),
            seen: Mutex::new(Vec::new()),
        };

        let report = fan_out_monthly(&store, &sink, 2025, 3).await.unwrap();
        assert_eq!(report.total(), 3);
        assert_eq!(report.enqueued.len(), 2);
        assert_eq!(report.failed[0].0, Uuid::from_u128(2));

        let seen = sink.seen.lock().await;
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|r| r.year == 2025 && r.month == 3));
        assert_eq!(seen[1].organization_id, Uuid::from_u128(3));
    }

    #[tokio::test]
    async fn listing_failure_enqueues_nothing() {
        let store = InMemoryStore::from_seed(SeedData {
            organizations: orgs(2),
            ..SeedData::default()
        });
        store.set_unavailable(true);
        let sink = RecordingSink {
            refuse: Uuid::nil(),
            seen: Mutex::new(Vec::new()),
        };

        let err = fan_out_monthly(&store, &sink, 2025, 3).await.unwrap_err();
        assert!(matches!(err, PayrollError::Store(StoreError::Unavailable(_))));
        assert!(sink.seen.lock().await.is_empty());
    }
}
