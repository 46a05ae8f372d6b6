//! Error types for the payroll pipeline.
//!
//! Each layer has its own error enum.  [`PayrollError`] is what an
//! organisation job or a fan-out returns; it fails that one job and
//! leaves the queue's retry policy to decide what happens next.

use thiserror::Error;
use uuid::Uuid;

/// Malformed compensation parameters.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    /// A rate or salary was negative.
    #[error("{subject} {id} has a negative {field}")]
    NegativeRate {
        subject: &'static str,
        id: Uuid,
        field: &'static str,
    },

    /// The overtime multiplier was negative.
    #[error("driver {0} has a negative overtime rate")]
    InvalidOvertimeRate(Uuid),

    /// Attendance carried a negative quantity.
    #[error("attendance record {0} has negative hours, kilometres or costs")]
    NegativeAttendance(Uuid),
}

/// Persistence failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// A period for the same organisation and month already exists.
    #[error("payroll period already exists: {existing}")]
    DuplicatePeriod { existing: Uuid },

    /// An attendance record references a vehicle that does not exist.
    #[error("vehicle {0} referenced by attendance not found")]
    MissingVehicle(Uuid),

    /// The commit was aborted before completion; nothing was written.
    #[error("commit interrupted: {0}")]
    Interrupted(String),

    /// The backing store could not serve the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A query or migration failed.
    #[error("database error during '{operation}': {details}")]
    Database {
        operation: &'static str,
        details: String,
    },

    /// A stored row could not be read back into a record.
    #[error("corrupt {table} row: {details}")]
    Corrupt {
        table: &'static str,
        details: String,
    },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database {
            operation: "query",
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Database {
            operation: "migrate",
            details: err.to_string(),
        }
    }
}

/// Job queue failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The queue no longer accepts jobs.
    #[error("queue {0} is closed")]
    Closed(String),

    /// The job payload failed validation.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// The job log could not record or restore a job.
    #[error("job log error: {0}")]
    Persistence(String),
}

impl From<StoreError> for QueueError {
    fn from(err: StoreError) -> Self {
        QueueError::Persistence(err.to_string())
    }
}

/// Errors surfaced by an organisation payroll job or a fan-out.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PayrollError {
    #[error("compensation error: {0}")]
    Rule(#[from] RuleError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// The year/month pair does not describe a representable month.
    #[error("invalid payroll period {year}-{month}")]
    InvalidPeriod { year: i32, month: u32 },

    /// The blocking pricing task did not finish.
    #[error("pricing task failed: {0}")]
    Pricing(String),

    /// Some organisations could not be enqueued during a fan-out.
    #[error("failed to enqueue payroll for {failed} of {total} organisations")]
    PartialFanOut { failed: usize, total: usize },
}

/// Result type using [`PayrollError`].
pub type Result<T> = std::result::Result<T, PayrollError>;
