//! Compensation rule engine.
//!
//! The `rules` module turns one subject's [`AttendanceSummary`] into a
//! [`PayBreakdown`].  Drivers are paid a salary (flat or hourly with
//! overtime), service providers a fee (monthly, per kilometre, per
//! trip or per day).  Both paths are deterministic and perform no
//! I/O; the only external figure, a provider's fleet size, is passed
//! in by the caller.
//!
//! All arithmetic is done in [`Decimal`].  Amount, bonuses and
//! deductions are each rounded to cents before net pay is derived, so
//! the net pay of an entry is exactly `amount + bonuses - deductions`
//! and period totals never drift.

use crate::aggregate::AttendanceSummary;
use crate::error::RuleError;
use crate::models::{Driver, PayBreakdown, ServiceProvider, Vehicle};
use rust_decimal::{Decimal, RoundingStrategy};
use uuid::Uuid;

/// Hours per month paid at the regular rate.
pub const REGULAR_HOURS_PER_MONTH: i64 = 160;
/// Working days a full month of attendance is measured against.
pub const EXPECTED_WORKING_DAYS: i64 = 22;
/// Decimal places kept on every amount.
pub const MONEY_SCALE: u32 = 2;

const TRIP_BONUS_THRESHOLD: u32 = 50;
const PROVIDER_TRIP_BONUS_THRESHOLD: u32 = 200;
const LOW_UTILISATION_TRIPS_PER_VEHICLE: i64 = 20;

/// Round a monetary value to cents, halves away from zero.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// A driver's pay with the salary components broken out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverPay {
    pub base_pay: Decimal,
    pub overtime_pay: Decimal,
    /// `amount` is base plus overtime.
    pub breakdown: PayBreakdown,
}

/// Treat zero like an unset rate.
fn configured(rate: Option<Decimal>) -> Option<Decimal> {
    rate.filter(|r| !r.is_zero())
}

fn non_negative(
    subject: &'static str,
    id: Uuid,
    field: &'static str,
    value: Option<Decimal>,
) -> Result<(), RuleError> {
    match value {
        Some(v) if v < Decimal::ZERO => Err(RuleError::NegativeRate {
            subject,
            id,
            field,
        }),
        _ => Ok(()),
    }
}

/// Compute the monthly salary of an employed driver.
///
/// Base pay is the flat `base_salary` when one is set, otherwise
/// `hourly_rate` times the hours worked up to
/// [`REGULAR_HOURS_PER_MONTH`].  Hours beyond that are paid as
/// overtime at `hourly_rate * overtime_rate` (1.5 by default)
/// whenever an hourly rate is set, even alongside a flat salary.
///
/// Bonuses: 5 per trip above 50, 100 for an attendance rate of at
/// least 95%, and 50 when the average speed over the month exceeds
/// 10 km/h.  Deductions: 10% of gross plus 20 per short day.
pub fn compute_driver_pay(
    driver: &Driver,
    summary: &AttendanceSummary,
) -> Result<DriverPay, RuleError> {
    non_negative("driver", driver.id, "base salary", driver.base_salary)?;
    non_negative("driver", driver.id, "hourly rate", driver.hourly_rate)?;
    let overtime_rate = match configured(driver.overtime_rate) {
        Some(rate) if rate < Decimal::ZERO => {
            return Err(RuleError::InvalidOvertimeRate(driver.id))
        }
        Some(rate) => rate,
        None => Decimal::new(15, 1),
    };

    let hours = summary.hours_worked.unwrap_or_default();
    let regular_hours = Decimal::from(REGULAR_HOURS_PER_MONTH);
    let hourly_rate = configured(driver.hourly_rate);

    let base_pay = match (configured(driver.base_salary), hourly_rate) {
        (Some(salary), _) => salary,
        (None, Some(rate)) => rate * hours.min(regular_hours),
        (None, None) => Decimal::ZERO,
    };

    let overtime_pay = match hourly_rate {
        Some(rate) if hours > regular_hours => rate * (hours - regular_hours) * overtime_rate,
        _ => Decimal::ZERO,
    };

    let mut bonuses = Decimal::ZERO;
    if summary.trips_completed > TRIP_BONUS_THRESHOLD {
        bonuses += Decimal::from(summary.trips_completed - TRIP_BONUS_THRESHOLD) * Decimal::from(5);
    }
    let attendance_rate = Decimal::from(summary.days_worked) * Decimal::ONE_HUNDRED
        / Decimal::from(EXPECTED_WORKING_DAYS);
    if attendance_rate >= Decimal::from(95) {
        bonuses += Decimal::ONE_HUNDRED;
    }
    let avg_km_per_hour = if hours > Decimal::ZERO {
        summary.kms_covered / hours
    } else {
        Decimal::ZERO
    };
    if avg_km_per_hour > Decimal::TEN {
        bonuses += Decimal::from(50);
    }

    let gross = base_pay + overtime_pay + bonuses;
    let deductions = gross * Decimal::new(10, 2) + Decimal::from(summary.short_days) * Decimal::from(20);

    let base_pay = round_money(base_pay);
    let overtime_pay = round_money(overtime_pay);
    Ok(DriverPay {
        base_pay,
        overtime_pay,
        breakdown: PayBreakdown {
            amount: base_pay + overtime_pay,
            bonuses: round_money(bonuses),
            deductions: round_money(deductions),
        },
    })
}

/// Compute the monthly fee of a service provider.
///
/// `vehicle` is the vehicle whose `daily_rate` is the last-resort
/// basis; `fleet_size` is the number of vehicles currently registered
/// to the provider.
///
/// The fee starts from `monthly_rate`.  Per-kilometre and per-trip
/// rates become the basis only while nothing else has; once a basis
/// exists they are paid as bonuses instead.  Fuel and toll expenses
/// are reimbursed on top of the amount.  More than 200 trips earns a
/// 500 bonus.  Deductions are 2% of gross plus a 500 penalty when the
/// average trips per registered vehicle is above zero but below 20.
pub fn compute_provider_fee(
    provider: &ServiceProvider,
    vehicle: &Vehicle,
    summary: &AttendanceSummary,
    fleet_size: u64,
) -> Result<PayBreakdown, RuleError> {
    non_negative("service provider", provider.id, "monthly rate", provider.monthly_rate)?;
    non_negative("service provider", provider.id, "per-km rate", provider.per_km_rate)?;
    non_negative("service provider", provider.id, "per-trip rate", provider.per_trip_rate)?;
    non_negative("vehicle", vehicle.id, "daily rate", vehicle.daily_rate)?;

    let mut amount = configured(provider.monthly_rate).unwrap_or_default();
    let mut bonuses = Decimal::ZERO;

    let metered = [
        (provider.per_km_rate, summary.kms_covered),
        (provider.per_trip_rate, Decimal::from(summary.trips_completed)),
    ];
    for (rate, quantity) in metered {
        if let Some(rate) = configured(rate) {
            if amount.is_zero() {
                amount = rate * quantity;
            } else {
                bonuses += rate * quantity;
            }
        }
    }

    if amount.is_zero() {
        if let Some(daily) = configured(vehicle.daily_rate) {
            amount = daily * Decimal::from(summary.days_worked);
        }
    }

    amount += summary.expenses();

    if summary.trips_completed > PROVIDER_TRIP_BONUS_THRESHOLD {
        bonuses += Decimal::from(500);
    }

    let gross = amount + bonuses;
    let mut deductions = gross * Decimal::new(2, 2);

    let avg_trips_per_vehicle = if fleet_size > 0 {
        Decimal::from(summary.trips_completed) / Decimal::from(fleet_size)
    } else {
        Decimal::ZERO
    };
    if avg_trips_per_vehicle > Decimal::ZERO
        && avg_trips_per_vehicle < Decimal::from(LOW_UTILISATION_TRIPS_PER_VEHICLE)
    {
        deductions += Decimal::from(500);
    }

    Ok(PayBreakdown {
        amount: round_money(amount),
        bonuses: round_money(bonuses),
        deductions: round_money(deductions),
    })
}
