//! Persistence seams consumed by the polling engine.
//!
//! The engine only talks to storage through these traits. [`Store`](super::Store)
//! implements all of them on top of SQLite.

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::models::*;

/// Repository error types.
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("store lock poisoned")]
    Poisoned,
}

/// The roster of polled devices and their sub-resources.
pub trait DeviceDirectory: Send + Sync {
    /// All devices not in maintenance.
    fn list_pollable(&self) -> Result<Vec<Device>, RepositoryError>;

    fn list_all(&self) -> Result<Vec<Device>, RepositoryError>;

    fn get_device(&self, id: i64) -> Result<Option<Device>, RepositoryError>;

    /// Set the status and advance whichever timestamps are given. `None` leaves
    /// the stored timestamp untouched.
    ///
    /// A device in maintenance is left as it is and `false` is returned.
    fn update_device_status(
        &self,
        id: i64,
        status: DeviceStatus,
        last_poll_at: Option<DateTime<Utc>>,
        last_successful_poll_at: Option<DateTime<Utc>>,
    ) -> Result<bool, RepositoryError>;

    /// Mark the device offline, but only if it is not in maintenance and its
    /// last successful poll is still `observed_last_success`. Returns whether
    /// the row was written.
    fn demote_if_stale(
        &self,
        id: i64,
        observed_last_success: Option<DateTime<Utc>>,
    ) -> Result<bool, RepositoryError>;

    /// Store the error text of the latest failed poll, or clear it with `None`.
    fn record_poll_error(&self, id: i64, error: Option<&str>) -> Result<(), RepositoryError>;

    fn set_maintenance(&self, id: i64, enabled: bool) -> Result<(), RepositoryError>;

    /// Update a provisioned port. Returns `None` when the device has no port at `index`.
    fn update_port(
        &self,
        device_id: i64,
        index: u32,
        total_units: u32,
        active_units: u32,
        polled_at: DateTime<Utc>,
    ) -> Result<Option<ChildPort>, RepositoryError>;

    /// Update a provisioned unit. `last_seen_at` of `None` keeps the stored value.
    fn update_unit(
        &self,
        port_id: i64,
        serial: &str,
        status: UnitStatus,
        signal_quality: SignalQuality,
        rx_power_dbm: Option<f64>,
        last_seen_at: Option<DateTime<Utc>>,
    ) -> Result<Option<SubscriberUnit>, RepositoryError>;

    /// Every unit on every port of the device.
    fn list_units(&self, device_id: i64) -> Result<Vec<SubscriberUnit>, RepositoryError>;
}

/// Append-only time-series storage.
pub trait MetricsRepository: Send + Sync {
    fn append(&self, sample: &MetricSample) -> Result<(), RepositoryError>;

    /// Newest samples first.
    fn latest(
        &self,
        device_id: i64,
        kind: MetricKind,
        limit: usize,
    ) -> Result<Vec<MetricSample>, RepositoryError>;
}

/// Durable alarm history backing the dedup ledger.
pub trait AlarmStore: Send + Sync {
    fn insert_alarm(&self, alarm: &NewAlarm) -> Result<Alarm, RepositoryError>;

    fn clear_alarm(&self, id: i64, cleared_at: DateTime<Utc>) -> Result<(), RepositoryError>;

    fn open_alarms(&self) -> Result<Vec<Alarm>, RepositoryError>;

    fn list_alarms(
        &self,
        device_id: Option<i64>,
        open_only: bool,
    ) -> Result<Vec<Alarm>, RepositoryError>;
}
