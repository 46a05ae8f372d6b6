//! Organisation payroll job.
//!
//! [`OrganizationPayrollJob::run`] produces one organisation's payroll
//! for one calendar month: it looks for an existing period, gathers
//! the month's attendance, splits it between drivers and service
//! providers, prices every subject with the rule engine and commits
//! the period, its entries and its total in one step.
//!
//! Running the job again for the same month is harmless.  An existing
//! period ends the run early, and a period created concurrently by
//! another run surfaces at commit time as a duplicate, which is
//! treated the same way.

use crate::aggregate::{self, DriverAttendance, Partition, ProviderAttendance};
use crate::error::{PayrollError, Result, RuleError, StoreError};
use crate::models::{EntryDraft, NewPeriod, Payee, PeriodBounds, WorkMetrics};
use crate::rules;
use crate::store::PayrollStore;
use chrono::FixedOffset;
use rayon::prelude::*;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Which organisation and month to generate payroll for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationPayrollRequest {
    pub organization_id: Uuid,
    pub year: i32,
    pub month: u32,
}

/// How a run ended.  None of these is an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum PayrollOutcome {
    /// The month already had a period; nothing was written.
    #[serde(rename_all = "camelCase")]
    AlreadyExists { period_id: Uuid },
    /// The period was created without entries, either because the
    /// month had no attendance or none of it could be attributed.
    #[serde(rename_all = "camelCase")]
    NoEntries { period_id: Uuid, unattributed: usize },
    #[serde(rename_all = "camelCase")]
    Generated {
        period_id: Uuid,
        entries: usize,
        total_amount: Decimal,
        /// Attendance rows that belonged to no driver or provider.
        unattributed: usize,
    },
}

impl PayrollOutcome {
    pub fn period_id(&self) -> Uuid {
        match self {
            PayrollOutcome::AlreadyExists { period_id }
            | PayrollOutcome::NoEntries { period_id, .. }
            | PayrollOutcome::Generated { period_id, .. } => *period_id,
        }
    }
}

pub struct OrganizationPayrollJob {
    store: Arc<dyn PayrollStore>,
    offset: FixedOffset,
}

impl OrganizationPayrollJob {
    /// `offset` is the local offset month boundaries are drawn in.
    pub fn new(store: Arc<dyn PayrollStore>, offset: FixedOffset) -> Self {
        Self { store, offset }
    }

    pub async fn run(&self, request: OrganizationPayrollRequest) -> Result<PayrollOutcome> {
        let OrganizationPayrollRequest {
            organization_id,
            year,
            month,
        } = request;
        info!(%organization_id, year, month, "Generating organisation payroll");

        let bounds = PeriodBounds::for_month(year, month, self.offset)
            .ok_or(PayrollError::InvalidPeriod { year, month })?;

        if let Some(existing) = self.store.find_period(organization_id, &bounds).await? {
            info!(%organization_id, period_id = %existing.id, "Payroll period already exists, skipping");
            return Ok(PayrollOutcome::AlreadyExists {
                period_id: existing.id,
            });
        }

        let period = NewPeriod {
            organization_id,
            name: bounds.name(),
            bounds,
        };

        let rows = self
            .store
            .attendance_for_period(organization_id, &bounds)
            .await?;
        if rows.is_empty() {
            info!(%organization_id, "No attendance records found");
            return self.commit(period, Vec::new(), 0).await;
        }
        debug!(%organization_id, records = rows.len(), "Attendance loaded");

        let partition = aggregate::partition(rows);
        if partition.unattributed > 0 {
            warn!(
                %organization_id,
                unattributed = partition.unattributed,
                "Attendance records matched no driver or service provider and were left out"
            );
        }

        let mut fleet_sizes = HashMap::with_capacity(partition.providers.len());
        for group in &partition.providers {
            let id = group.provider.id;
            fleet_sizes.insert(id, self.store.count_provider_vehicles(id).await?);
        }

        let unattributed = partition.unattributed;
        // Pricing is CPU-bound; keep it off the async workers.
        let entries = tokio::task::spawn_blocking(move || price(&partition, &fleet_sizes))
            .await
            .map_err(|e| PayrollError::Pricing(e.to_string()))??;

        info!(%organization_id, entries = entries.len(), "Creating payroll entries");
        self.commit(period, entries, unattributed).await
    }

    async fn commit(
        &self,
        period: NewPeriod,
        entries: Vec<EntryDraft>,
        unattributed: usize,
    ) -> Result<PayrollOutcome> {
        let organization_id = period.organization_id;
        match self.store.commit_period(period, entries).await {
            Ok(committed) if committed.entries.is_empty() => {
                info!(%organization_id, period_id = %committed.period.id, "Created empty payroll period");
                Ok(PayrollOutcome::NoEntries {
                    period_id: committed.period.id,
                    unattributed,
                })
            }
            Ok(committed) => {
                info!(
                    %organization_id,
                    period_id = %committed.period.id,
                    entries = committed.entries.len(),
                    total = %committed.period.total_amount,
                    "Generated payroll entries"
                );
                Ok(PayrollOutcome::Generated {
                    period_id: committed.period.id,
                    entries: committed.entries.len(),
                    total_amount: committed.period.total_amount,
                    unattributed,
                })
            }
            Err(StoreError::DuplicatePeriod { existing }) => {
                info!(%organization_id, period_id = %existing, "Payroll period created concurrently, skipping");
                Ok(PayrollOutcome::AlreadyExists {
                    period_id: existing,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Price every driver and provider group in parallel.  Drivers come
/// first, each side in partition order.
fn price(
    partition: &Partition,
    fleet_sizes: &HashMap<Uuid, u64>,
) -> std::result::Result<Vec<EntryDraft>, RuleError> {
    let mut entries = partition
        .drivers
        .par_iter()
        .map(driver_entry)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let provider_entries = partition
        .providers
        .par_iter()
        .map(|group| {
            let fleet_size = fleet_sizes.get(&group.provider.id).copied().unwrap_or(0);
            provider_entry(group, fleet_size)
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    entries.extend(provider_entries);
    Ok(entries)
}

/// A quantity as shown in an entry description.
fn one_place(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(1, RoundingStrategy::MidpointAwayFromZero)
}

fn driver_entry(group: &DriverAttendance) -> std::result::Result<EntryDraft, RuleError> {
    aggregate::check_quantities(&group.rows)?;
    let summary = aggregate::summarise(&group.rows);
    let pay = rules::compute_driver_pay(&group.driver, &summary)?;
    let hours = summary.hours_worked.unwrap_or_default();
    Ok(EntryDraft {
        payee: Payee::Driver(group.driver.id),
        vehicle_id: Some(group.vehicle.id),
        description: format!(
            "Salary for {} days ({:.1}h, {} trips)",
            summary.days_worked,
            one_place(hours),
            summary.trips_completed
        ),
        pay: pay.breakdown,
        metrics: WorkMetrics {
            days_worked: summary.days_worked,
            hours_worked: Some(hours),
            trips_completed: summary.trips_completed,
            kms_covered: summary.kms_covered,
        },
    })
}

fn provider_entry(
    group: &ProviderAttendance,
    fleet_size: u64,
) -> std::result::Result<EntryDraft, RuleError> {
    aggregate::check_quantities(&group.rows)?;
    let summary = aggregate::summarise(&group.rows);
    let pay = rules::compute_provider_fee(&group.provider, &group.vehicle, &summary, fleet_size)?;
    Ok(EntryDraft {
        payee: Payee::ServiceProvider(group.provider.id),
        vehicle_id: Some(group.vehicle.id),
        description: format!(
            "Service fee for {} days ({} trips, {:.1}km) + expenses",
            summary.days_worked,
            summary.trips_completed,
            one_place(summary.kms_covered)
        ),
        pay,
        metrics: WorkMetrics {
            days_worked: summary.days_worked,
            hours_worked: None,
            trips_completed: summary.trips_completed,
            kms_covered: summary.kms_covered,
        },
    })
}
