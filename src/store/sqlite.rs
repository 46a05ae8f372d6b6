//! SQLite-backed persistence.
//!
//! Reference data, payroll periods and entries, and the job queue's
//! records all live in one database.  Identifiers, amounts and enum
//! values are stored as text so reporting tools can read the tables
//! directly; amounts keep their exact decimal representation.

use super::{CommittedPeriod, PayrollStore, SeedData};
use crate::error::{QueueError, StoreError};
use crate::models::{
    AttendanceRecord, AttendanceRow, Driver, EntryDraft, NewPeriod, Organization, Payee,
    PayrollEntry, PayrollPeriod, PeriodBounds, PeriodStatus, ServiceProvider, Vehicle,
    WorkMetrics,
};
use crate::queue::{JobId, JobLog, StoredJob};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// [`PayrollStore`] and [`JobLog`] on a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    interrupt_before_total: Arc<AtomicBool>,
}

impl SqliteStore {
    /// Wrap an existing pool.  Call [`SqliteStore::migrate`] before use
    /// unless the schema is already in place.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            interrupt_before_total: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Open (creating if needed) the database file at `path` and bring
    /// its schema up to date.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Database {
                operation: "create_dir",
                details: format!("{}: {}", parent.display(), e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| StoreError::Database {
                operation: "connect",
                details: format!("{}: {}", path.display(), e),
            })?;

        let store = Self::new(pool);
        store.migrate().await?;
        info!(path = %path.display(), "SQLite store opened");
        Ok(store)
    }

    /// A private in-memory database, gone when the store is dropped.
    pub async fn in_memory() -> Result<Self, StoreError> {
        // A single connection that never expires, since every
        // connection to `sqlite::memory:` is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert or update reference data.  Rows are matched by id, so
    /// loading the same seed twice changes nothing.
    pub async fn load_seed(&self, seed: &SeedData) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for org in &seed.organizations {
            sqlx::query(
                r#"
                INSERT INTO organizations (id, name) VALUES (?, ?)
                ON CONFLICT(id) DO UPDATE SET name = excluded.name
                "#,
            )
            .bind(org.id.to_string())
            .bind(&org.name)
            .execute(&mut *tx)
            .await?;
        }

        for driver in &seed.drivers {
            sqlx::query(
                r#"
                INSERT INTO drivers
                    (id, organization_id, name, base_salary, hourly_rate, overtime_rate)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    organization_id = excluded.organization_id,
                    name = excluded.name,
                    base_salary = excluded.base_salary,
                    hourly_rate = excluded.hourly_rate,
                    overtime_rate = excluded.overtime_rate
                "#,
            )
            .bind(driver.id.to_string())
            .bind(driver.organization_id.to_string())
            .bind(&driver.name)
            .bind(decimal_text(driver.base_salary))
            .bind(decimal_text(driver.hourly_rate))
            .bind(decimal_text(driver.overtime_rate))
            .execute(&mut *tx)
            .await?;
        }

        for provider in &seed.service_providers {
            sqlx::query(
                r#"
                INSERT INTO service_providers
                    (id, organization_id, company_name, monthly_rate, per_km_rate, per_trip_rate)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    organization_id = excluded.organization_id,
                    company_name = excluded.company_name,
                    monthly_rate = excluded.monthly_rate,
                    per_km_rate = excluded.per_km_rate,
                    per_trip_rate = excluded.per_trip_rate
                "#,
            )
            .bind(provider.id.to_string())
            .bind(provider.organization_id.to_string())
            .bind(&provider.company_name)
            .bind(decimal_text(provider.monthly_rate))
            .bind(decimal_text(provider.per_km_rate))
            .bind(decimal_text(provider.per_trip_rate))
            .execute(&mut *tx)
            .await?;
        }

        for vehicle in &seed.vehicles {
            sqlx::query(
                r#"
                INSERT INTO vehicles
                    (id, organization_id, plate_number, vehicle_type, service_provider_id, daily_rate)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    organization_id = excluded.organization_id,
                    plate_number = excluded.plate_number,
                    vehicle_type = excluded.vehicle_type,
                    service_provider_id = excluded.service_provider_id,
                    daily_rate = excluded.daily_rate
                "#,
            )
            .bind(vehicle.id.to_string())
            .bind(vehicle.organization_id.to_string())
            .bind(&vehicle.plate_number)
            .bind(to_text(&vehicle.vehicle_type)?)
            .bind(vehicle.service_provider_id.map(|id| id.to_string()))
            .bind(decimal_text(vehicle.daily_rate))
            .execute(&mut *tx)
            .await?;
        }

        for record in &seed.attendance {
            upsert_attendance(&mut tx, record).await?;
        }

        tx.commit().await?;
        info!(
            organizations = seed.organizations.len(),
            attendance = seed.attendance.len(),
            "Seed data loaded"
        );
        Ok(())
    }

    /// Insert or update attendance records.
    pub async fn record_attendance(&self, records: &[AttendanceRecord]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            upsert_attendance(&mut tx, record).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Abort the next commit after its entries are inserted but before
    /// the period total is written.  The transaction is rolled back.
    pub fn interrupt_next_commit(&self) {
        self.interrupt_before_total.store(true, Ordering::SeqCst);
    }
}

async fn upsert_attendance(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    record: &AttendanceRecord,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO attendance_records
            (id, organization_id, vehicle_id, driver_id, date, hours_worked,
             trips_completed, kms_covered, fuel_cost, toll_cost)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            organization_id = excluded.organization_id,
            vehicle_id = excluded.vehicle_id,
            driver_id = excluded.driver_id,
            date = excluded.date,
            hours_worked = excluded.hours_worked,
            trips_completed = excluded.trips_completed,
            kms_covered = excluded.kms_covered,
            fuel_cost = excluded.fuel_cost,
            toll_cost = excluded.toll_cost
        "#,
    )
    .bind(record.id.to_string())
    .bind(record.organization_id.to_string())
    .bind(record.vehicle_id.to_string())
    .bind(record.driver_id.map(|id| id.to_string()))
    .bind(record.date)
    .bind(decimal_text(record.hours_worked))
    .bind(i64::from(record.trips_completed))
    .bind(record.kms_covered.to_string())
    .bind(decimal_text(record.fuel_cost))
    .bind(decimal_text(record.toll_cost))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn decimal_text(value: Option<Decimal>) -> Option<String> {
    value.map(|v| v.to_string())
}

/// The serde wire form of a value that serialises as a string.
fn to_text<T: Serialize>(value: &T) -> Result<String, StoreError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(text)) => Ok(text),
        Ok(other) => Ok(other.to_string()),
        Err(e) => Err(StoreError::Corrupt {
            table: "encode",
            details: e.to_string(),
        }),
    }
}

/// Parse a text column through the type's serde form.  Used for ids,
/// amounts and enum values alike.
fn from_text<T: DeserializeOwned>(table: &'static str, text: String) -> Result<T, StoreError> {
    serde_json::from_value(serde_json::Value::String(text)).map_err(|e| StoreError::Corrupt {
        table,
        details: e.to_string(),
    })
}

fn from_opt_text<T: DeserializeOwned>(
    table: &'static str,
    text: Option<String>,
) -> Result<Option<T>, StoreError> {
    text.map(|t| from_text(table, t)).transpose()
}

fn count(table: &'static str, value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|e| StoreError::Corrupt {
        table,
        details: e.to_string(),
    })
}

#[derive(sqlx::FromRow)]
struct OrganizationRow {
    id: String,
    name: String,
}

#[derive(sqlx::FromRow)]
struct PeriodRow {
    id: String,
    organization_id: String,
    name: String,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    total_amount: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<PeriodRow> for PayrollPeriod {
    type Error = StoreError;

    fn try_from(row: PeriodRow) -> Result<Self, StoreError> {
        const TABLE: &str = "payroll_periods";
        Ok(PayrollPeriod {
            id: from_text(TABLE, row.id)?,
            organization_id: from_text(TABLE, row.organization_id)?,
            name: row.name,
            start_date: row.start_date,
            end_date: row.end_date,
            total_amount: from_text(TABLE, row.total_amount)?,
            status: from_text(TABLE, row.status)?,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EntryRow {
    id: String,
    payroll_period_id: String,
    organization_id: String,
    driver_id: Option<String>,
    service_provider_id: Option<String>,
    vehicle_id: Option<String>,
    payroll_type: String,
    description: String,
    amount: String,
    bonuses: String,
    deductions: String,
    net_pay: String,
    days_worked: i64,
    hours_worked: Option<String>,
    trips_completed: i64,
    kms_covered: String,
    payment_method: String,
    status: String,
}

impl TryFrom<EntryRow> for PayrollEntry {
    type Error = StoreError;

    fn try_from(row: EntryRow) -> Result<Self, StoreError> {
        const TABLE: &str = "payroll_entries";
        let payee = match (row.driver_id, row.service_provider_id) {
            (Some(id), None) => Payee::Driver(from_text(TABLE, id)?),
            (None, Some(id)) => Payee::ServiceProvider(from_text(TABLE, id)?),
            _ => {
                return Err(StoreError::Corrupt {
                    table: TABLE,
                    details: format!("entry {} must reference one payee", row.id),
                })
            }
        };
        Ok(PayrollEntry {
            id: from_text(TABLE, row.id)?,
            payroll_period_id: from_text(TABLE, row.payroll_period_id)?,
            organization_id: from_text(TABLE, row.organization_id)?,
            payee,
            vehicle_id: from_opt_text(TABLE, row.vehicle_id)?,
            payroll_type: from_text(TABLE, row.payroll_type)?,
            description: row.description,
            amount: from_text(TABLE, row.amount)?,
            bonuses: from_text(TABLE, row.bonuses)?,
            deductions: from_text(TABLE, row.deductions)?,
            net_pay: from_text(TABLE, row.net_pay)?,
            metrics: WorkMetrics {
                days_worked: count(TABLE, row.days_worked)?,
                hours_worked: from_opt_text(TABLE, row.hours_worked)?,
                trips_completed: count(TABLE, row.trips_completed)?,
                kms_covered: from_text(TABLE, row.kms_covered)?,
            },
            payment_method: from_text(TABLE, row.payment_method)?,
            status: from_text(TABLE, row.status)?,
        })
    }
}

/// An attendance record with its left-joined vehicle, driver and
/// service provider columns.
#[derive(sqlx::FromRow)]
struct AttendanceJoinRow {
    id: String,
    organization_id: String,
    vehicle_id: String,
    driver_id: Option<String>,
    date: NaiveDate,
    hours_worked: Option<String>,
    trips_completed: i64,
    kms_covered: String,
    fuel_cost: Option<String>,
    toll_cost: Option<String>,

    v_id: Option<String>,
    v_organization_id: Option<String>,
    v_plate_number: Option<String>,
    v_vehicle_type: Option<String>,
    v_service_provider_id: Option<String>,
    v_daily_rate: Option<String>,

    d_id: Option<String>,
    d_organization_id: Option<String>,
    d_name: Option<String>,
    d_base_salary: Option<String>,
    d_hourly_rate: Option<String>,
    d_overtime_rate: Option<String>,

    sp_id: Option<String>,
    sp_organization_id: Option<String>,
    sp_company_name: Option<String>,
    sp_monthly_rate: Option<String>,
    sp_per_km_rate: Option<String>,
    sp_per_trip_rate: Option<String>,
}

impl TryFrom<AttendanceJoinRow> for AttendanceRow {
    type Error = StoreError;

    fn try_from(row: AttendanceJoinRow) -> Result<Self, StoreError> {
        const TABLE: &str = "attendance_records";
        let record = AttendanceRecord {
            id: from_text(TABLE, row.id)?,
            organization_id: from_text(TABLE, row.organization_id)?,
            vehicle_id: from_text(TABLE, row.vehicle_id)?,
            driver_id: from_opt_text(TABLE, row.driver_id)?,
            date: row.date,
            hours_worked: from_opt_text(TABLE, row.hours_worked)?,
            trips_completed: count(TABLE, row.trips_completed)?,
            kms_covered: from_text(TABLE, row.kms_covered)?,
            fuel_cost: from_opt_text(TABLE, row.fuel_cost)?,
            toll_cost: from_opt_text(TABLE, row.toll_cost)?,
        };

        let vehicle = match (row.v_id, row.v_organization_id, row.v_plate_number, row.v_vehicle_type) {
            (Some(id), Some(organization_id), Some(plate_number), Some(vehicle_type)) => Vehicle {
                id: from_text("vehicles", id)?,
                organization_id: from_text("vehicles", organization_id)?,
                plate_number,
                vehicle_type: from_text("vehicles", vehicle_type)?,
                service_provider_id: from_opt_text("vehicles", row.v_service_provider_id)?,
                daily_rate: from_opt_text("vehicles", row.v_daily_rate)?,
            },
            _ => return Err(StoreError::MissingVehicle(record.vehicle_id)),
        };

        let driver = match (row.d_id, row.d_organization_id, row.d_name) {
            (Some(id), Some(organization_id), Some(name)) => Some(Driver {
                id: from_text("drivers", id)?,
                organization_id: from_text("drivers", organization_id)?,
                name,
                base_salary: from_opt_text("drivers", row.d_base_salary)?,
                hourly_rate: from_opt_text("drivers", row.d_hourly_rate)?,
                overtime_rate: from_opt_text("drivers", row.d_overtime_rate)?,
            }),
            _ => None,
        };

        let service_provider = match (row.sp_id, row.sp_organization_id, row.sp_company_name) {
            (Some(id), Some(organization_id), Some(company_name)) => Some(ServiceProvider {
                id: from_text("service_providers", id)?,
                organization_id: from_text("service_providers", organization_id)?,
                company_name,
                monthly_rate: from_opt_text("service_providers", row.sp_monthly_rate)?,
                per_km_rate: from_opt_text("service_providers", row.sp_per_km_rate)?,
                per_trip_rate: from_opt_text("service_providers", row.sp_per_trip_rate)?,
            }),
            _ => None,
        };

        Ok(AttendanceRow {
            record,
            driver,
            vehicle,
            service_provider,
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl PayrollStore for SqliteStore {
    async fn list_organizations(&self) -> Result<Vec<Organization>, StoreError> {
        let rows: Vec<OrganizationRow> =
            sqlx::query_as("SELECT id, name FROM organizations ORDER BY rowid")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|row| {
                Ok(Organization {
                    id: from_text("organizations", row.id)?,
                    name: row.name,
                })
            })
            .collect()
    }

    async fn find_period(
        &self,
        organization_id: Uuid,
        bounds: &PeriodBounds,
    ) -> Result<Option<PayrollPeriod>, StoreError> {
        let row: Option<PeriodRow> = sqlx::query_as(
            r#"
            SELECT id, organization_id, name, start_date, end_date, total_amount, status, created_at
            FROM payroll_periods
            WHERE organization_id = ? AND start_date = ? AND end_date = ?
            "#,
        )
        .bind(organization_id.to_string())
        .bind(bounds.start)
        .bind(bounds.end)
        .fetch_optional(&self.pool)
        .await?;
        row.map(PayrollPeriod::try_from).transpose()
    }

    async fn attendance_for_period(
        &self,
        organization_id: Uuid,
        bounds: &PeriodBounds,
    ) -> Result<Vec<AttendanceRow>, StoreError> {
        let rows: Vec<AttendanceJoinRow> = sqlx::query_as(
            r#"
            SELECT a.id, a.organization_id, a.vehicle_id, a.driver_id, a.date, a.hours_worked,
                   a.trips_completed, a.kms_covered, a.fuel_cost, a.toll_cost,
                   v.id AS v_id, v.organization_id AS v_organization_id,
                   v.plate_number AS v_plate_number, v.vehicle_type AS v_vehicle_type,
                   v.service_provider_id AS v_service_provider_id, v.daily_rate AS v_daily_rate,
                   d.id AS d_id, d.organization_id AS d_organization_id, d.name AS d_name,
                   d.base_salary AS d_base_salary, d.hourly_rate AS d_hourly_rate,
                   d.overtime_rate AS d_overtime_rate,
                   sp.id AS sp_id, sp.organization_id AS sp_organization_id,
                   sp.company_name AS sp_company_name, sp.monthly_rate AS sp_monthly_rate,
                   sp.per_km_rate AS sp_per_km_rate, sp.per_trip_rate AS sp_per_trip_rate
            FROM attendance_records a
            LEFT JOIN vehicles v ON v.id = a.vehicle_id
            LEFT JOIN drivers d ON d.id = a.driver_id
            LEFT JOIN service_providers sp ON sp.id = v.service_provider_id
            WHERE a.organization_id = ? AND a.date >= ? AND a.date <= ?
            ORDER BY a.date, a.rowid
            "#,
        )
        .bind(organization_id.to_string())
        .bind(bounds.first_day)
        .bind(bounds.last_day)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AttendanceRow::try_from).collect()
    }

    async fn count_provider_vehicles(&self, service_provider_id: Uuid) -> Result<u64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM vehicles WHERE service_provider_id = ?")
                .bind(service_provider_id.to_string())
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    async fn commit_period(
        &self,
        period: NewPeriod,
        entries: Vec<EntryDraft>,
    ) -> Result<CommittedPeriod, StoreError> {
        let bounds = period.bounds;
        let mut row = PayrollPeriod {
            id: Uuid::new_v4(),
            organization_id: period.organization_id,
            name: period.name,
            start_date: bounds.start,
            end_date: bounds.end,
            total_amount: Decimal::ZERO,
            status: PeriodStatus::Pending,
            created_at: Utc::now(),
        };

        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO payroll_periods
                (id, organization_id, name, start_date, end_date, total_amount, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(row.id.to_string())
        .bind(row.organization_id.to_string())
        .bind(&row.name)
        .bind(row.start_date)
        .bind(row.end_date)
        .bind(row.total_amount.to_string())
        .bind(to_text(&row.status)?)
        .bind(row.created_at)
        .execute(&mut *tx)
        .await;
        if let Err(err) = inserted {
            if is_unique_violation(&err) {
                drop(tx);
                if let Some(existing) = self.find_period(row.organization_id, &bounds).await? {
                    return Err(StoreError::DuplicatePeriod {
                        existing: existing.id,
                    });
                }
            }
            return Err(err.into());
        }

        let created: Vec<PayrollEntry> = entries
            .into_iter()
            .map(|draft| PayrollEntry::from_draft(&row, draft))
            .collect();
        for (position, entry) in created.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO payroll_entries
                    (id, payroll_period_id, organization_id, driver_id, service_provider_id,
                     vehicle_id, payroll_type, description, amount, bonuses, deductions, net_pay,
                     days_worked, hours_worked, trips_completed, kms_covered, payment_method,
                     status, position)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(entry.id.to_string())
            .bind(entry.payroll_period_id.to_string())
            .bind(entry.organization_id.to_string())
            .bind(entry.payee.driver_id().map(|id| id.to_string()))
            .bind(entry.payee.service_provider_id().map(|id| id.to_string()))
            .bind(entry.vehicle_id.map(|id| id.to_string()))
            .bind(to_text(&entry.payroll_type)?)
            .bind(&entry.description)
            .bind(entry.amount.to_string())
            .bind(entry.bonuses.to_string())
            .bind(entry.deductions.to_string())
            .bind(entry.net_pay.to_string())
            .bind(i64::from(entry.metrics.days_worked))
            .bind(decimal_text(entry.metrics.hours_worked))
            .bind(i64::from(entry.metrics.trips_completed))
            .bind(entry.metrics.kms_covered.to_string())
            .bind(to_text(&entry.payment_method)?)
            .bind(to_text(&entry.status)?)
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }

        if self.interrupt_before_total.swap(false, Ordering::SeqCst) {
            // Dropping the transaction rolls back the period and entries.
            return Err(StoreError::Interrupted(
                "aborted before period total update".into(),
            ));
        }

        row.total_amount = created.iter().map(|e| e.net_pay).sum();
        sqlx::query("UPDATE payroll_periods SET total_amount = ? WHERE id = ?")
            .bind(row.total_amount.to_string())
            .bind(row.id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(CommittedPeriod {
            period: row,
            entries: created,
        })
    }

    async fn period_entries(&self, period_id: Uuid) -> Result<Vec<PayrollEntry>, StoreError> {
        let rows: Vec<EntryRow> = sqlx::query_as(
            r#"
            SELECT id, payroll_period_id, organization_id, driver_id, service_provider_id,
                   vehicle_id, payroll_type, description, amount, bonuses, deductions, net_pay,
                   days_worked, hours_worked, trips_completed, kms_covered, payment_method, status
            FROM payroll_entries
            WHERE payroll_period_id = ?
            ORDER BY position
            "#,
        )
        .bind(period_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(PayrollEntry::try_from).collect()
    }

    async fn organization_periods(
        &self,
        organization_id: Uuid,
    ) -> Result<Vec<PayrollPeriod>, StoreError> {
        let rows: Vec<PeriodRow> = sqlx::query_as(
            r#"
            SELECT id, organization_id, name, start_date, end_date, total_amount, status, created_at
            FROM payroll_periods
            WHERE organization_id = ?
            ORDER BY start_date
            "#,
        )
        .bind(organization_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(PayrollPeriod::try_from).collect()
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    queue: String,
    name: String,
    data: String,
    state: String,
    attempts_made: i64,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    retry_at: Option<DateTime<Utc>>,
    failed_reason: Option<String>,
    return_value: Option<String>,
}

fn json_column<T: DeserializeOwned>(text: &str) -> Result<T, StoreError> {
    serde_json::from_str(text).map_err(|e| StoreError::Corrupt {
        table: "jobs",
        details: e.to_string(),
    })
}

impl TryFrom<JobRow> for StoredJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, StoreError> {
        Ok(StoredJob {
            id: JobId(from_text("jobs", row.id)?),
            queue: row.queue,
            name: row.name,
            data: json_column(&row.data)?,
            state: from_text("jobs", row.state)?,
            attempts_made: count("jobs", row.attempts_made)?,
            created_at: row.created_at,
            processed_at: row.processed_at,
            finished_at: row.finished_at,
            retry_at: row.retry_at,
            failed_reason: row.failed_reason,
            return_value: row.return_value.as_deref().map(json_column).transpose()?,
        })
    }
}

#[async_trait]
impl JobLog for SqliteStore {
    async fn save_job(&self, job: &StoredJob) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            INSERT INTO jobs
                (id, queue, name, data, state, attempts_made, created_at, processed_at,
                 finished_at, retry_at, failed_reason, return_value)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                attempts_made = excluded.attempts_made,
                processed_at = excluded.processed_at,
                finished_at = excluded.finished_at,
                retry_at = excluded.retry_at,
                failed_reason = excluded.failed_reason,
                return_value = excluded.return_value
            "#,
        )
        .bind(job.id.to_string())
        .bind(&job.queue)
        .bind(&job.name)
        .bind(job.data.to_string())
        .bind(to_text(&job.state)?)
        .bind(i64::from(job.attempts_made))
        .bind(job.created_at)
        .bind(job.processed_at)
        .bind(job.finished_at)
        .bind(job.retry_at)
        .bind(job.failed_reason.as_deref())
        .bind(job.return_value.as_ref().map(|v| v.to_string()))
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn delete_jobs(&self, ids: &[JobId]) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        for id in ids {
            sqlx::query("DELETE FROM jobs WHERE id = ?")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from)?;
        }
        tx.commit().await.map_err(StoreError::from)?;
        Ok(())
    }

    async fn load_jobs(&self, queue: &str) -> Result<Vec<StoredJob>, QueueError> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            SELECT id, queue, name, data, state, attempts_made, created_at, processed_at,
                   finished_at, retry_at, failed_reason, return_value
            FROM jobs
            WHERE queue = ?
            ORDER BY created_at, rowid
            "#,
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(rows
            .into_iter()
            .map(StoredJob::try_from)
            .collect::<Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::fixtures;
    use crate::models::{PayrollType, VehicleType};
    use crate::store::memory::tests::{draft, march, new_period};

    fn seed() -> (SeedData, Uuid, Uuid) {
        let driver = fixtures::driver(Some(10));
        let mut provider = fixtures::provider();
        provider.monthly_rate = Some(Decimal::new(200050, 2));
        let own = fixtures::vehicle(VehicleType::InHouse, None);
        let hired = fixtures::vehicle(VehicleType::Outsourced, Some(provider.id));
        let spare = fixtures::vehicle(VehicleType::Outsourced, Some(provider.id));
        let mut april = fixtures::record(&own, Some(driver.id), 1, Some(8));
        april.date = NaiveDate::from_ymd_opt(2025, 4, 1).unwrap();
        let mut fuelled = fixtures::record(&hired, None, 3, None);
        fuelled.fuel_cost = Some(Decimal::new(1234, 2));

        let seed = SeedData {
            organizations: vec![Organization {
                id: fixtures::org(),
                name: "Acme Shuttles".into(),
            }],
            drivers: vec![driver.clone()],
            service_providers: vec![provider.clone()],
            vehicles: vec![own.clone(), hired, spare],
            attendance: vec![
                fixtures::record(&own, Some(driver.id), 3, Some(8)),
                fuelled,
                april,
            ],
        };
        (seed, driver.id, provider.id)
    }

    #[tokio::test]
    async fn seed_is_joined_and_filtered_by_month() {
        let store = SqliteStore::in_memory().await.unwrap();
        let (seed, driver_id, provider_id) = seed();
        store.load_seed(&seed).await.unwrap();
        // Loading twice is an upsert.
        store.load_seed(&seed).await.unwrap();

        let orgs = store.list_organizations().await.unwrap();
        assert_eq!(orgs, seed.organizations);

        let rows = store.attendance_for_period(fixtures::org(), &march()).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].record, seed.attendance[0]);
        assert_eq!(rows[0].driver.as_ref().map(|d| d.id), Some(driver_id));
        assert_eq!(rows[0].vehicle, seed.vehicles[0]);
        assert_eq!(rows[1].record.fuel_cost, Some(Decimal::new(1234, 2)));
        let provider = rows[1].service_provider.as_ref().unwrap();
        assert_eq!(provider.id, provider_id);
        assert_eq!(provider.monthly_rate, Some(Decimal::new(200050, 2)));
        assert_eq!(store.count_provider_vehicles(provider_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn attendance_on_unknown_vehicle_is_an_error() {
        let store = SqliteStore::in_memory().await.unwrap();
        let ghost = fixtures::vehicle(VehicleType::InHouse, None);
        store
            .record_attendance(&[fixtures::record(&ghost, None, 3, None)])
            .await
            .unwrap();
        let err = store.attendance_for_period(fixtures::org(), &march()).await.unwrap_err();
        assert_eq!(err, StoreError::MissingVehicle(ghost.id));
    }

    #[tokio::test]
    async fn commit_round_trips_period_and_entries() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut provider_fee = draft(300);
        provider_fee.payee = Payee::ServiceProvider(Uuid::new_v4());
        provider_fee.pay.deductions = Decimal::new(1999, 2);
        let committed = store
            .commit_period(new_period(), vec![draft(100), provider_fee])
            .await
            .unwrap();
        assert_eq!(committed.period.total_amount, Decimal::new(38051, 2));

        let found = store.find_period(fixtures::org(), &march()).await.unwrap().unwrap();
        assert_eq!(found, committed.period);
        let entries = store.period_entries(found.id).await.unwrap();
        assert_eq!(entries, committed.entries);
        assert_eq!(entries[1].payroll_type, PayrollType::ServiceFee);
        assert_eq!(entries[1].net_pay.to_string(), "280.51");
    }

    #[tokio::test]
    async fn unique_window_turns_a_second_commit_into_a_duplicate() {
        let store = SqliteStore::in_memory().await.unwrap();
        let first = store.commit_period(new_period(), vec![draft(5)]).await.unwrap();
        let err = store.commit_period(new_period(), vec![draft(1)]).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::DuplicatePeriod {
                existing: first.period.id
            }
        );
        let periods = store.organization_periods(fixtures::org()).await.unwrap();
        assert_eq!(periods.len(), 1);
        assert_eq!(store.period_entries(first.period.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn interrupted_commit_is_rolled_back() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.interrupt_next_commit();
        let err = store.commit_period(new_period(), vec![draft(10)]).await.unwrap_err();
        assert!(matches!(err, StoreError::Interrupted(_)));

        assert!(store.find_period(fixtures::org(), &march()).await.unwrap().is_none());
        let (entries,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM payroll_entries")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(entries, 0);

        store.commit_period(new_period(), vec![draft(10)]).await.unwrap();
    }

    #[tokio::test]
    async fn committed_payroll_survives_reopening_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("payroll.db");

        let committed = {
            let store = SqliteStore::from_path(&path).await.unwrap();
            let committed = store.commit_period(new_period(), vec![draft(216)]).await.unwrap();
            store.pool().close().await;
            committed
        };

        let reopened = SqliteStore::from_path(&path).await.unwrap();
        let periods = reopened.organization_periods(fixtures::org()).await.unwrap();
        assert_eq!(periods, vec![committed.period.clone()]);
        assert_eq!(
            reopened.period_entries(committed.period.id).await.unwrap(),
            committed.entries
        );
    }

    #[tokio::test]
    async fn job_log_upserts_and_deletes() {
        use crate::queue::JobState;

        let store = SqliteStore::in_memory().await.unwrap();
        let mut job = StoredJob {
            id: JobId(Uuid::new_v4()),
            queue: "payroll".into(),
            name: "monthly-payroll-generation".into(),
            data: serde_json::json!({ "name": "monthly-payroll-generation", "data": { "year": 2025, "month": 3 } }),
            state: JobState::Waiting,
            attempts_made: 0,
            created_at: Utc::now(),
            processed_at: None,
            finished_at: None,
            retry_at: None,
            failed_reason: None,
            return_value: None,
        };
        store.save_job(&job).await.unwrap();

        job.state = JobState::Failed;
        job.attempts_made = 3;
        job.failed_reason = Some("store unavailable".into());
        job.finished_at = Some(Utc::now());
        store.save_job(&job).await.unwrap();

        let loaded = store.load_jobs("payroll").await.unwrap();
        assert_eq!(loaded, vec![job.clone()]);
        assert!(store.load_jobs("other").await.unwrap().is_empty());

        store.delete_jobs(&[job.id]).await.unwrap();
        assert!(store.load_jobs("payroll").await.unwrap().is_empty());
    }
}
