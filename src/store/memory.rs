//! Process-local [`PayrollStore`].

use super::{CommittedPeriod, PayrollStore, SeedData};
use crate::error::StoreError;
use crate::models::{
    AttendanceRecord, AttendanceRow, Driver, EntryDraft, NewPeriod, Organization, PayrollEntry,
    PayrollPeriod, PeriodBounds, PeriodStatus, ServiceProvider, Vehicle,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

type PeriodKey = (Uuid, DateTime<Utc>, DateTime<Utc>);

#[derive(Debug, Default)]
struct Ledger {
    periods: HashMap<Uuid, PayrollPeriod>,
    by_window: HashMap<PeriodKey, Uuid>,
    entries: HashMap<Uuid, Vec<PayrollEntry>>,
}

#[derive(Debug, Default)]
struct Reference {
    organizations: Vec<Organization>,
    drivers: HashMap<Uuid, Driver>,
    providers: HashMap<Uuid, ServiceProvider>,
    vehicles: HashMap<Uuid, Vehicle>,
    attendance: Vec<AttendanceRecord>,
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: AtomicBool,
    interrupt_before_total: AtomicBool,
}

/// [`PayrollStore`] kept in process memory.  Nothing survives the
/// process.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    reference: RwLock<Reference>,
    ledger: RwLock<Ledger>,
    faults: Faults,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: SeedData) -> Self {
        let reference = Reference {
            organizations: seed.organizations,
            drivers: seed.drivers.into_iter().map(|d| (d.id, d)).collect(),
            providers: seed.service_providers.into_iter().map(|p| (p.id, p)).collect(),
            vehicles: seed.vehicles.into_iter().map(|v| (v.id, v)).collect(),
            attendance: seed.attendance,
        };
        Self {
            reference: RwLock::new(reference),
            ..Self::default()
        }
    }

    /// Append attendance records, e.g. captured after startup.
    pub async fn record_attendance(&self, records: impl IntoIterator<Item = AttendanceRecord>) {
        self.reference.write().await.attendance.extend(records);
    }

    /// Make every call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Abort the next commit after its entries are staged but before
    /// the period total is written.
    pub fn interrupt_next_commit(&self) {
        self.faults
            .interrupt_before_total
            .store(true, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.faults.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PayrollStore for InMemoryStore {
    async fn list_organizations(&self) -> Result<Vec<Organization>, StoreError> {
        self.check_available()?;
        Ok(self.reference.read().await.organizations.clone())
    }

    async fn find_period(
        &self,
        organization_id: Uuid,
        bounds: &PeriodBounds,
    ) -> Result<Option<PayrollPeriod>, StoreError> {
        self.check_available()?;
        let ledger = self.ledger.read().await;
        Ok(ledger
            .by_window
            .get(&(organization_id, bounds.start, bounds.end))
            .and_then(|id| ledger.periods.get(id))
            .cloned())
    }

    async fn attendance_for_period(
        &self,
        organization_id: Uuid,
        bounds: &PeriodBounds,
    ) -> Result<Vec<AttendanceRow>, StoreError> {
        self.check_available()?;
        let reference = self.reference.read().await;
        reference
            .attendance
            .iter()
            .filter(|r| r.organization_id == organization_id && bounds.contains(r.date))
            .map(|record| {
                let vehicle = reference
                    .vehicles
                    .get(&record.vehicle_id)
                    .cloned()
                    .ok_or(StoreError::MissingVehicle(record.vehicle_id))?;
                let driver = record
                    .driver_id
                    .and_then(|id| reference.drivers.get(&id))
                    .cloned();
                let service_provider = vehicle
                    .service_provider_id
                    .and_then(|id| reference.providers.get(&id))
                    .cloned();
                Ok(AttendanceRow {
                    record: record.clone(),
                    driver,
                    vehicle,
                    service_provider,
                })
            })
            .collect()
    }

    async fn count_provider_vehicles(&self, service_provider_id: Uuid) -> Result<u64, StoreError> {
        self.check_available()?;
        let reference = self.reference.read().await;
        Ok(reference
            .vehicles
            .values()
            .filter(|v| v.service_provider_id == Some(service_provider_id))
            .count() as u64)
    }

    async fn commit_period(
        &self,
        period: NewPeriod,
        entries: Vec<EntryDraft>,
    ) -> Result<CommittedPeriod, StoreError> {
        self.check_available()?;
        let mut ledger = self.ledger.write().await;

        let key = (period.organization_id, period.bounds.start, period.bounds.end);
        if let Some(existing) = ledger.by_window.get(&key) {
            return Err(StoreError::DuplicatePeriod {
                existing: *existing,
            });
        }

        // Rows are built aside and only published once complete.
        let mut row = PayrollPeriod {
            id: Uuid::new_v4(),
            organization_id: period.organization_id,
            name: period.name,
            start_date: period.bounds.start,
            end_date: period.bounds.end,
            total_amount: Decimal::ZERO,
            status: PeriodStatus::Pending,
            created_at: Utc::now(),
        };
        let created: Vec<PayrollEntry> = entries
            .into_iter()
            .map(|draft| PayrollEntry::from_draft(&row, draft))
            .collect();

        if self
            .faults
            .interrupt_before_total
            .swap(false, Ordering::SeqCst)
        {
            return Err(StoreError::Interrupted(
                "aborted before period total update".into(),
            ));
        }

        row.total_amount = created.iter().map(|e| e.net_pay).sum();

        ledger.by_window.insert(key, row.id);
        ledger.periods.insert(row.id, row.clone());
        ledger.entries.insert(row.id, created.clone());
        Ok(CommittedPeriod {
            period: row,
            entries: created,
        })
    }

    async fn period_entries(&self, period_id: Uuid) -> Result<Vec<PayrollEntry>, StoreError> {
        self.check_available()?;
        Ok(self
            .ledger
            .read()
            .await
            .entries
            .get(&period_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn organization_periods(
        &self,
        organization_id: Uuid,
    ) -> Result<Vec<PayrollPeriod>, StoreError> {
        self.check_available()?;
        let ledger = self.ledger.read().await;
        let mut periods: Vec<PayrollPeriod> = ledger
            .periods
            .values()
            .filter(|p| p.organization_id == organization_id)
            .cloned()
            .collect();
        periods.sort_by_key(|p| p.start_date);
        Ok(periods)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::aggregate::fixtures;
    use crate::models::{PayBreakdown, Payee, VehicleType, WorkMetrics};
    use chrono::FixedOffset;

    pub(crate) fn march() -> PeriodBounds {
        PeriodBounds::for_month(2025, 3, FixedOffset::east_opt(0).unwrap()).unwrap()
    }

    pub(crate) fn new_period() -> NewPeriod {
        NewPeriod {
            organization_id: fixtures::org(),
            name: march().name(),
            bounds: march(),
        }
    }

    pub(crate) fn draft(net: i64) -> EntryDraft {
        EntryDraft {
            payee: Payee::Driver(Uuid::new_v4()),
            vehicle_id: None,
            description: "test".into(),
            pay: PayBreakdown {
                amount: Decimal::from(net),
                bonuses: Decimal::new(50, 2),
                deductions: Decimal::new(50, 2),
            },
            metrics: WorkMetrics::default(),
        }
    }

    #[tokio::test]
    async fn commit_writes_period_entries_and_total() {
        let store = InMemoryStore::new();
        let committed = store
            .commit_period(new_period(), vec![draft(100), draft(250)])
            .await
            .unwrap();
        assert_eq!(committed.period.total_amount, Decimal::from(350));
        assert_eq!(committed.period.status, PeriodStatus::Pending);

        let found = store.find_period(fixtures::org(), &march()).await.unwrap().unwrap();
        assert_eq!(found, committed.period);
        assert_eq!(store.period_entries(found.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn second_commit_for_same_window_is_rejected() {
        let store = InMemoryStore::new();
        let first = store.commit_period(new_period(), vec![]).await.unwrap();
        let err = store.commit_period(new_period(), vec![draft(1)]).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::DuplicatePeriod {
                existing: first.period.id
            }
        );
        assert_eq!(store.organization_periods(fixtures::org()).await.unwrap().len(), 1);
        assert!(store.period_entries(first.period.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn interrupted_commit_leaves_nothing_behind() {
        let store = InMemoryStore::new();
        store.interrupt_next_commit();
        let err = store.commit_period(new_period(), vec![draft(10)]).await.unwrap_err();
        assert!(matches!(err, StoreError::Interrupted(_)));
        assert!(store.find_period(fixtures::org(), &march()).await.unwrap().is_none());
        assert!(store.organization_periods(fixtures::org()).await.unwrap().is_empty());

        // The fault is one-shot; a retry goes through.
        store.commit_period(new_period(), vec![draft(10)]).await.unwrap();
    }

    #[tokio::test]
    async fn attendance_is_joined_and_filtered_by_month() {
        let driver = fixtures::driver(Some(10));
        let provider = fixtures::provider();
        let own = fixtures::vehicle(VehicleType::InHouse, None);
        let hired = fixtures::vehicle(VehicleType::Outsourced, Some(provider.id));
        let spare = fixtures::vehicle(VehicleType::Outsourced, Some(provider.id));
        let mut april = fixtures::record(&own, Some(driver.id), 1, Some(8));
        april.date = chrono::NaiveDate::from_ymd_opt(2025, 4, 1).unwrap();

        let store = InMemoryStore::from_seed(SeedData {
            organizations: vec![],
            drivers: vec![driver.clone()],
            service_providers: vec![provider.clone()],
            vehicles: vec![own.clone(), hired.clone(), spare],
            attendance: vec![
                fixtures::record(&own, Some(driver.id), 3, Some(8)),
                fixtures::record(&hired, None, 3, None),
                april,
            ],
        });

        let rows = store.attendance_for_period(fixtures::org(), &march()).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].driver.as_ref().map(|d| d.id), Some(driver.id));
        assert_eq!(rows[1].service_provider.as_ref().map(|p| p.id), Some(provider.id));
        assert_eq!(store.count_provider_vehicles(provider.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn missing_vehicle_is_an_error() {
        let own = fixtures::vehicle(VehicleType::InHouse, None);
        let store = InMemoryStore::from_seed(SeedData {
            attendance: vec![fixtures::record(&own, None, 3, None)],
            ..SeedData::default()
        });
        let err = store.attendance_for_period(fixtures::org(), &march()).await.unwrap_err();
        assert_eq!(err, StoreError::MissingVehicle(own.id));
    }
}
