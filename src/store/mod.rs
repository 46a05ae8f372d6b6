//! Payroll persistence.
//!
//! [`PayrollStore`] is everything the pipeline needs from storage:
//! read-only access to organisations, attendance and fleet sizes, and
//! a single atomic [`PayrollStore::commit_period`] that writes a
//! period, its entries and its total together.  The store enforces
//! that an organisation has at most one period per month window.
//!
//! [`SqliteStore`] is the durable implementation the service binary
//! runs on; it also keeps the job queue's records.  [`InMemoryStore`]
//! is a process-local double used by tests.

mod memory;
mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StoreError;
use crate::models::{
    AttendanceRecord, AttendanceRow, Driver, EntryDraft, NewPeriod, Organization, PayrollEntry,
    PayrollPeriod, PeriodBounds, ServiceProvider, Vehicle,
};
use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

/// A period and the entries committed with it.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedPeriod {
    pub period: PayrollPeriod,
    pub entries: Vec<PayrollEntry>,
}

#[async_trait]
pub trait PayrollStore: Send + Sync {
    async fn list_organizations(&self) -> Result<Vec<Organization>, StoreError>;

    /// The period of `organization_id` with exactly these bounds.
    async fn find_period(
        &self,
        organization_id: Uuid,
        bounds: &PeriodBounds,
    ) -> Result<Option<PayrollPeriod>, StoreError>;

    /// Attendance of the organisation dated inside `bounds`, joined
    /// with driver, vehicle and the vehicle's service provider.
    async fn attendance_for_period(
        &self,
        organization_id: Uuid,
        bounds: &PeriodBounds,
    ) -> Result<Vec<AttendanceRow>, StoreError>;

    /// Number of vehicles currently registered to a service provider.
    async fn count_provider_vehicles(&self, service_provider_id: Uuid) -> Result<u64, StoreError>;

    /// Create the period with a zero total, insert every entry, then
    /// set the total to the sum of the entries' net pay.  Either all
    /// of it is visible afterwards or none of it is.  Fails with
    /// [`StoreError::DuplicatePeriod`] when the window is taken.
    async fn commit_period(
        &self,
        period: NewPeriod,
        entries: Vec<EntryDraft>,
    ) -> Result<CommittedPeriod, StoreError>;

    async fn period_entries(&self, period_id: Uuid) -> Result<Vec<PayrollEntry>, StoreError>;

    async fn organization_periods(
        &self,
        organization_id: Uuid,
    ) -> Result<Vec<PayrollPeriod>, StoreError>;
}

/// Reference data a store is loaded with.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SeedData {
    pub organizations: Vec<Organization>,
    pub drivers: Vec<Driver>,
    pub service_providers: Vec<ServiceProvider>,
    pub vehicles: Vec<Vehicle>,
    pub attendance: Vec<AttendanceRecord>,
}

impl SeedData {
    /// Load seed data from a JSON file.
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VehicleType;
    use rust_decimal::Decimal;

    #[test]
    fn seed_data_parses_camel_case_json() {
        let json = r#"{
            "organizations": [{"id": "00000000-0000-0000-0000-000000000001", "name": "Acme"}],
            "vehicles": [{
                "id": "00000000-0000-0000-0000-000000000002",
                "organizationId": "00000000-0000-0000-0000-000000000001",
                "plateNumber": "AA-1",
                "type": "OUTSOURCED",
                "dailyRate": "75.50"
            }]
        }"#;
        let seed: SeedData = serde_json::from_str(json).unwrap();
        assert_eq!(seed.organizations[0].name, "Acme");
        assert_eq!(seed.vehicles[0].vehicle_type, VehicleType::Outsourced);
        assert_eq!(seed.vehicles[0].daily_rate, Some(Decimal::new(7550, 2)));
        assert!(seed.attendance.is_empty());
    }
}
