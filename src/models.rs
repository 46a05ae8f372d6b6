//! Data models for the fleet payroll pipeline.
//!
//! The `models` module defines the serialisable records the pipeline
//! reads (organisations, drivers, service providers, vehicles and
//! attendance) and the records it writes (payroll periods and
//! entries).  Monetary values are [`Decimal`]s throughout; floating
//! point never touches an amount.

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A tenant of the fleet application.  Every other record is scoped
/// to exactly one organisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
}

/// A directly employed driver together with the compensation
/// parameters consumed by the salary rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Driver {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    /// Flat monthly salary.  Takes precedence over `hourly_rate`.
    #[serde(default)]
    pub base_salary: Option<Decimal>,
    #[serde(default)]
    pub hourly_rate: Option<Decimal>,
    /// Multiplier applied to overtime hours.  Defaults to 1.5.
    #[serde(default)]
    pub overtime_rate: Option<Decimal>,
}

/// A third-party company operating outsourced vehicles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceProvider {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub company_name: String,
    #[serde(default)]
    pub monthly_rate: Option<Decimal>,
    #[serde(default)]
    pub per_km_rate: Option<Decimal>,
    #[serde(default)]
    pub per_trip_rate: Option<Decimal>,
}

/// Whether a vehicle is run by the organisation's own drivers or by a
/// service provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VehicleType {
    InHouse,
    Outsourced,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub plate_number: String,
    #[serde(rename = "type")]
    pub vehicle_type: VehicleType,
    #[serde(default)]
    pub service_provider_id: Option<Uuid>,
    /// Fallback daily fee for outsourced vehicles whose provider has no
    /// other rate configured.
    #[serde(default)]
    pub daily_rate: Option<Decimal>,
}

/// One vehicle/driver/day attendance record, as captured upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub vehicle_id: Uuid,
    #[serde(default)]
    pub driver_id: Option<Uuid>,
    pub date: NaiveDate,
    #[serde(default)]
    pub hours_worked: Option<Decimal>,
    #[serde(default)]
    pub trips_completed: u32,
    #[serde(default)]
    pub kms_covered: Decimal,
    #[serde(default)]
    pub fuel_cost: Option<Decimal>,
    #[serde(default)]
    pub toll_cost: Option<Decimal>,
}

/// An attendance record joined with its driver, its vehicle and the
/// vehicle's service provider.
#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceRow {
    pub record: AttendanceRecord,
    pub driver: Option<Driver>,
    pub vehicle: Vehicle,
    pub service_provider: Option<ServiceProvider>,
}

/// The inclusive boundaries of one calendar month in a fixed local
/// offset.  `end` is the last millisecond of the month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodBounds {
    pub first_day: NaiveDate,
    pub last_day: NaiveDate,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl PeriodBounds {
    /// Compute the month window for `year`/`month` (1-based).  Returns
    /// `None` for months outside 1..=12 or dates chrono cannot
    /// represent.
    pub fn for_month(year: i32, month: u32, offset: FixedOffset) -> Option<Self> {
        let first_day = NaiveDate::from_ymd_opt(year, month, 1)?;
        let (next_year, next_month) = if month == 12 {
            (year.checked_add(1)?, 1)
        } else {
            (year, month + 1)
        };
        let last_day = NaiveDate::from_ymd_opt(next_year, next_month, 1)?.pred_opt()?;
        let start = offset
            .from_local_datetime(&first_day.and_hms_opt(0, 0, 0)?)
            .single()?
            .with_timezone(&Utc);
        let end = offset
            .from_local_datetime(&last_day.and_hms_milli_opt(23, 59, 59, 999)?)
            .single()?
            .with_timezone(&Utc);
        Some(Self {
            first_day,
            last_day,
            start,
            end,
        })
    }

    /// Whether an attendance date falls inside the month.
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.first_day <= date && date <= self.last_day
    }

    /// Human-readable period name, e.g. `"March 2025"`.
    pub fn name(&self) -> String {
        self.first_day.format("%B %Y").to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeriodStatus {
    Pending,
    Processed,
    Cancelled,
    Paid,
}

/// One organisation's payroll for one calendar month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayrollPeriod {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// Sum of the net pay of every entry in the period.
    pub total_amount: Decimal,
    pub status: PeriodStatus,
    pub created_at: DateTime<Utc>,
}

/// A period that has not been persisted yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPeriod {
    pub organization_id: Uuid,
    pub name: String,
    pub bounds: PeriodBounds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayrollType {
    /// Employed drivers.
    Salary,
    /// Service providers.
    ServiceFee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    Pending,
    Processed,
    Paid,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    BankTransfer,
    Cash,
    Check,
    MobileMoney,
}

/// Who an entry pays.  An entry references exactly one driver or
/// exactly one service provider, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "camelCase")]
pub enum Payee {
    Driver(Uuid),
    ServiceProvider(Uuid),
}

impl Payee {
    pub fn driver_id(&self) -> Option<Uuid> {
        match self {
            Payee::Driver(id) => Some(*id),
            Payee::ServiceProvider(_) => None,
        }
    }

    pub fn service_provider_id(&self) -> Option<Uuid> {
        match self {
            Payee::ServiceProvider(id) => Some(*id),
            Payee::Driver(_) => None,
        }
    }

    pub fn payroll_type(&self) -> PayrollType {
        match self {
            Payee::Driver(_) => PayrollType::Salary,
            Payee::ServiceProvider(_) => PayrollType::ServiceFee,
        }
    }
}

/// The monetary outcome of the rule engine for one subject.
///
/// Net pay is not stored here; it is always derived from the three
/// components by [`PayBreakdown::net_pay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayBreakdown {
    pub amount: Decimal,
    pub bonuses: Decimal,
    pub deductions: Decimal,
}

impl PayBreakdown {
    pub fn gross(&self) -> Decimal {
        self.amount + self.bonuses
    }

    pub fn net_pay(&self) -> Decimal {
        self.amount + self.bonuses - self.deductions
    }
}

/// Work performed by a subject during the period, copied onto the
/// entry for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkMetrics {
    pub days_worked: u32,
    /// `None` for service providers.
    pub hours_worked: Option<Decimal>,
    pub trips_completed: u32,
    pub kms_covered: Decimal,
}

/// A computed entry waiting to be committed with its period.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryDraft {
    pub payee: Payee,
    pub vehicle_id: Option<Uuid>,
    pub description: String,
    pub pay: PayBreakdown,
    pub metrics: WorkMetrics,
}

/// One subject's payroll line within a period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayrollEntry {
    pub id: Uuid,
    pub payroll_period_id: Uuid,
    pub organization_id: Uuid,
    pub payee: Payee,
    pub vehicle_id: Option<Uuid>,
    pub payroll_type: PayrollType,
    pub description: String,
    pub amount: Decimal,
    pub bonuses: Decimal,
    pub deductions: Decimal,
    pub net_pay: Decimal,
    #[serde(flatten)]
    pub metrics: WorkMetrics,
    pub payment_method: PaymentMethod,
    pub status: EntryStatus,
}

impl PayrollEntry {
    /// Materialise a draft as a pending bank-transfer entry of
    /// `period`.  This is the only constructor, so `net_pay` always
    /// agrees with the amounts.
    pub fn from_draft(period: &PayrollPeriod, draft: EntryDraft) -> Self {
        Self {
            id: Uuid::new_v4(),
            payroll_period_id: period.id,
            organization_id: period.organization_id,
            payroll_type: draft.payee.payroll_type(),
            payee: draft.payee,
            vehicle_id: draft.vehicle_id,
            description: draft.description,
            amount: draft.pay.amount,
            bonuses: draft.pay.bonuses,
            deductions: draft.pay.deductions,
            net_pay: draft.pay.net_pay(),
            metrics: draft.metrics,
            payment_method: PaymentMethod::BankTransfer,
            status: EntryStatus::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_bounds_are_inclusive() {
        let bounds = PeriodBounds::for_month(2024, 2, FixedOffset::east_opt(0).unwrap()).unwrap();
        assert_eq!(bounds.first_day, NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
        assert_eq!(bounds.last_day, NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        assert_eq!(bounds.end.to_rfc3339(), "2024-02-29T23:59:59.999+00:00");
        assert!(bounds.contains(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()));
        assert!(!bounds.contains(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()));
        assert_eq!(bounds.name(), "February 2024");
    }

    #[test]
    fn december_rolls_into_next_year() {
        let offset = FixedOffset::east_opt(3 * 3600).unwrap();
        let bounds = PeriodBounds::for_month(2025, 12, offset).unwrap();
        assert_eq!(bounds.last_day, NaiveDate::from_ymd_opt(2025, 12, 31).unwrap());
        // Local midnight at +03:00 is 21:00 UTC the previous day.
        assert_eq!(bounds.start.to_rfc3339(), "2025-11-30T21:00:00+00:00");
    }

    #[test]
    fn invalid_month_has_no_bounds() {
        let utc = FixedOffset::east_opt(0).unwrap();
        assert!(PeriodBounds::for_month(2025, 0, utc).is_none());
        assert!(PeriodBounds::for_month(2025, 13, utc).is_none());
    }

    #[test]
    fn payee_serialises_as_tagged_reference() {
        let id = Uuid::nil();
        let json = serde_json::to_value(Payee::ServiceProvider(id)).unwrap();
        assert_eq!(json["kind"], "serviceProvider");
        assert_eq!(Payee::Driver(id).payroll_type(), PayrollType::Salary);
        assert_eq!(Payee::Driver(id).service_provider_id(), None);
    }
}
