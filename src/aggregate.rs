//! Attendance aggregation.
//!
//! Attendance rows are attributed once, when they are partitioned,
//! to either a driver or a service provider.  Each group is then
//! summarised into the totals the rule engine consumes.  Nothing in
//! this module performs I/O.

use crate::error::RuleError;
use crate::models::{AttendanceRow, Driver, ServiceProvider, Vehicle, VehicleType};
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

/// Records below this many hours count as a short day.
pub const SHORT_DAY_HOURS: i64 = 8;

/// The compensation subject an attendance row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribution {
    /// In-house vehicle with a known driver.
    Driver(Uuid),
    /// Outsourced vehicle with a known service provider.
    ServiceProvider(Uuid),
    /// Neither; the row is left out of payroll.
    Unattributed,
}

/// Decide which subject a row is paid to.
pub fn classify(row: &AttendanceRow) -> Attribution {
    match row.vehicle.vehicle_type {
        VehicleType::InHouse => match &row.driver {
            Some(driver) if row.record.driver_id == Some(driver.id) => {
                Attribution::Driver(driver.id)
            }
            _ => Attribution::Unattributed,
        },
        VehicleType::Outsourced => match (row.vehicle.service_provider_id, &row.service_provider) {
            (Some(id), Some(provider)) if provider.id == id => Attribution::ServiceProvider(id),
            _ => Attribution::Unattributed,
        },
    }
}

/// All attendance of one driver in the period.
#[derive(Debug, Clone)]
pub struct DriverAttendance {
    pub driver: Driver,
    /// Vehicle of the driver's first record; the entry is filed
    /// against it.
    pub vehicle: Vehicle,
    pub rows: Vec<AttendanceRow>,
}

/// All attendance of one service provider's vehicles in the period.
#[derive(Debug, Clone)]
pub struct ProviderAttendance {
    pub provider: ServiceProvider,
    /// Vehicle of the provider's first record.  Its daily rate is the
    /// fee basis of last resort.
    pub vehicle: Vehicle,
    pub rows: Vec<AttendanceRow>,
}

/// Rows grouped per subject, in the order each subject first appears.
#[derive(Debug, Clone, Default)]
pub struct Partition {
    pub drivers: Vec<DriverAttendance>,
    pub providers: Vec<ProviderAttendance>,
    /// Rows that matched neither group.
    pub unattributed: usize,
}

pub fn partition(rows: Vec<AttendanceRow>) -> Partition {
    let mut out = Partition::default();
    let mut driver_index: HashMap<Uuid, usize> = HashMap::new();
    let mut provider_index: HashMap<Uuid, usize> = HashMap::new();

    for row in rows {
        match classify(&row) {
            Attribution::Driver(id) => match driver_index.get(&id) {
                Some(&i) => out.drivers[i].rows.push(row),
                None => {
                    // classify only yields Driver when the join is present
                    let Some(driver) = row.driver.clone() else {
                        out.unattributed += 1;
                        continue;
                    };
                    driver_index.insert(id, out.drivers.len());
                    out.drivers.push(DriverAttendance {
                        driver,
                        vehicle: row.vehicle.clone(),
                        rows: vec![row],
                    });
                }
            },
            Attribution::ServiceProvider(id) => match provider_index.get(&id) {
                Some(&i) => out.providers[i].rows.push(row),
                None => {
                    let Some(provider) = row.service_provider.clone() else {
                        out.unattributed += 1;
                        continue;
                    };
                    provider_index.insert(id, out.providers.len());
                    out.providers.push(ProviderAttendance {
                        provider,
                        vehicle: row.vehicle.clone(),
                        rows: vec![row],
                    });
                }
            },
            Attribution::Unattributed => out.unattributed += 1,
        }
    }
    out
}

/// Totals over one subject's attendance rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttendanceSummary {
    /// One per record.
    pub days_worked: u32,
    /// `None` when no record carried hours.
    pub hours_worked: Option<Decimal>,
    pub trips_completed: u32,
    pub kms_covered: Decimal,
    pub fuel_cost: Decimal,
    pub toll_cost: Decimal,
    /// Records with non-zero hours below [`SHORT_DAY_HOURS`].
    pub short_days: u32,
}

impl AttendanceSummary {
    pub fn expenses(&self) -> Decimal {
        self.fuel_cost + self.toll_cost
    }
}

/// Reject rows whose quantities cannot be right.
pub fn check_quantities(rows: &[AttendanceRow]) -> Result<(), RuleError> {
    let negative = |v: Option<Decimal>| v.is_some_and(|v| v < Decimal::ZERO);
    match rows.iter().map(|row| &row.record).find(|r| {
        negative(r.hours_worked)
            || negative(Some(r.kms_covered))
            || negative(r.fuel_cost)
            || negative(r.toll_cost)
    }) {
        Some(record) => Err(RuleError::NegativeAttendance(record.id)),
        None => Ok(()),
    }
}

pub fn summarise(rows: &[AttendanceRow]) -> AttendanceSummary {
    let short_day = Decimal::from(SHORT_DAY_HOURS);
    rows.iter().fold(AttendanceSummary::default(), |mut acc, row| {
        let record = &row.record;
        acc.days_worked = acc.days_worked.saturating_add(1);
        if let Some(hours) = record.hours_worked {
            acc.hours_worked = Some(acc.hours_worked.unwrap_or_default() + hours);
            if !hours.is_zero() && hours < short_day {
                acc.short_days = acc.short_days.saturating_add(1);
            }
        }
        acc.trips_completed = acc.trips_completed.saturating_add(record.trips_completed);
        acc.kms_covered += record.kms_covered;
        acc.fuel_cost += record.fuel_cost.unwrap_or_default();
        acc.toll_cost += record.toll_cost.unwrap_or_default();
        acc
    })
}
