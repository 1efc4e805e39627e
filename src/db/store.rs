//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use super::models::*;
use super::repository::*;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const DEVICE_COLUMNS: &str =
    "id, name, address, credential_ref, status, last_poll_at, last_successful_poll_at, last_error";

const ALARM_COLUMNS: &str =
    "id, device_id, unit_id, severity, kind, message, raised_at, cleared_at";

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        Self::with_connection(Connection::open(path)?)
    }

    /// A private store that lives as long as the process.
    pub fn open_in_memory() -> Result<Self, RepositoryError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, RepositoryError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), RepositoryError> {
        let conn = self.conn()?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| RepositoryError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, RepositoryError> {
        self.conn.lock().map_err(|_| RepositoryError::Poisoned)
    }

    // --- Provisioning ---

    /// Add a new device and return its ID.
    pub fn add_device(&self, device: &mut Device) -> Result<i64, RepositoryError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO devices (name, address, credential_ref, status) VALUES (?1, ?2, ?3, ?4)",
            params![
                device.name,
                device.address,
                device.credential_ref,
                device.status.as_str(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        device.id = id;
        Ok(id)
    }

    /// Provision a port on a device.
    pub fn add_port(&self, device_id: i64, index: u32, total_units: u32) -> Result<i64, RepositoryError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO child_ports (device_id, port_index, total_units) VALUES (?1, ?2, ?3)",
            params![device_id, index, total_units],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Provision a subscriber unit on a port.
    pub fn add_unit(&self, port_id: i64, serial: &str) -> Result<i64, RepositoryError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO subscriber_units (port_id, serial) VALUES (?1, ?2)",
            params![port_id, serial],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Get all ports of a device ordered by index.
    pub fn get_ports(&self, device_id: i64) -> Result<Vec<ChildPort>, RepositoryError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, device_id, port_index, total_units, active_units, status, last_poll_at
             FROM child_ports WHERE device_id = ?1 ORDER BY port_index",
        )?;
        let ports = stmt
            .query_map(params![device_id], port_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(ports)
    }

    fn device_exists(conn: &Connection, id: i64) -> SqlResult<bool> {
        conn.query_row("SELECT EXISTS(SELECT 1 FROM devices WHERE id = ?1)", params![id], |row| {
            row.get(0)
        })
    }

    fn find_port(conn: &Connection, device_id: i64, index: u32) -> SqlResult<Option<ChildPort>> {
        conn.query_row(
            "SELECT id, device_id, port_index, total_units, active_units, status, last_poll_at
             FROM child_ports WHERE device_id = ?1 AND port_index = ?2",
            params![device_id, index],
            port_from_row,
        )
        .optional()
    }

    fn find_unit(conn: &Connection, port_id: i64, serial: &str) -> SqlResult<Option<SubscriberUnit>> {
        conn.query_row(
            "SELECT id, port_id, serial, status, signal_quality, rx_power_dbm, last_seen_at
             FROM subscriber_units WHERE port_id = ?1 AND serial = ?2",
            params![port_id, serial],
            unit_from_row,
        )
        .optional()
    }
}

impl DeviceDirectory for Store {
    fn list_pollable(&self) -> Result<Vec<Device>, RepositoryError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM devices WHERE status != ?1 ORDER BY id",
            DEVICE_COLUMNS
        ))?;
        let devices = stmt
            .query_map(params![DeviceStatus::Maintenance.as_str()], device_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(devices)
    }

    fn list_all(&self) -> Result<Vec<Device>, RepositoryError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM devices ORDER BY id", DEVICE_COLUMNS))?;
        let devices = stmt
            .query_map([], device_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(devices)
    }

    fn get_device(&self, id: i64) -> Result<Option<Device>, RepositoryError> {
        let conn = self.conn()?;
        let device = conn
            .query_row(
                &format!("SELECT {} FROM devices WHERE id = ?1", DEVICE_COLUMNS),
                params![id],
                device_from_row,
            )
            .optional()?;
        Ok(device)
    }

    fn update_device_status(
        &self,
        id: i64,
        status: DeviceStatus,
        last_poll_at: Option<DateTime<Utc>>,
        last_successful_poll_at: Option<DateTime<Utc>>,
    ) -> Result<bool, RepositoryError> {
        let conn = self.conn()?;
        // Maintenance is only ever lifted through set_maintenance.
        let changed = conn.execute(
            "UPDATE devices SET status = ?1,
                last_poll_at = COALESCE(?2, last_poll_at),
                last_successful_poll_at = COALESCE(?3, last_successful_poll_at)
             WHERE id = ?4 AND status != ?5",
            params![
                status.as_str(),
                last_poll_at.map(format_db_time),
                last_successful_poll_at.map(format_db_time),
                id,
                DeviceStatus::Maintenance.as_str(),
            ],
        )?;
        if changed == 0 && !Self::device_exists(&conn, id)? {
            return Err(RepositoryError::NotFound);
        }
        Ok(changed > 0)
    }

    fn demote_if_stale(
        &self,
        id: i64,
        observed_last_success: Option<DateTime<Utc>>,
    ) -> Result<bool, RepositoryError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE devices SET status = ?1
             WHERE id = ?2 AND status != ?3 AND last_successful_poll_at IS ?4",
            params![
                DeviceStatus::Offline.as_str(),
                id,
                DeviceStatus::Maintenance.as_str(),
                observed_last_success.map(format_db_time),
            ],
        )?;
        Ok(changed > 0)
    }

    fn record_poll_error(&self, id: i64, error: Option<&str>) -> Result<(), RepositoryError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE devices SET last_error = ?1 WHERE id = ?2",
            params![error, id],
        )?;
        Ok(())
    }

    fn set_maintenance(&self, id: i64, enabled: bool) -> Result<(), RepositoryError> {
        // Lifting maintenance leaves the device unverified until its next good poll.
        let status = if enabled {
            DeviceStatus::Maintenance
        } else {
            DeviceStatus::Warning
        };
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE devices SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        if changed == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    fn update_port(
        &self,
        device_id: i64,
        index: u32,
        total_units: u32,
        active_units: u32,
        polled_at: DateTime<Utc>,
    ) -> Result<Option<ChildPort>, RepositoryError> {
        let conn = self.conn()?;
        let status = PortStatus::from_active_units(active_units);
        let changed = conn.execute(
            "UPDATE child_ports SET total_units = ?1, active_units = ?2, status = ?3, last_poll_at = ?4
             WHERE device_id = ?5 AND port_index = ?6",
            params![
                total_units,
                active_units,
                status.as_str(),
                format_db_time(polled_at),
                device_id,
                index,
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        Ok(Self::find_port(&conn, device_id, index)?)
    }

    fn update_unit(
        &self,
        port_id: i64,
        serial: &str,
        status: UnitStatus,
        signal_quality: SignalQuality,
        rx_power_dbm: Option<f64>,
        last_seen_at: Option<DateTime<Utc>>,
    ) -> Result<Option<SubscriberUnit>, RepositoryError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE subscriber_units SET status = ?1, signal_quality = ?2, rx_power_dbm = ?3,
                last_seen_at = COALESCE(?4, last_seen_at)
             WHERE port_id = ?5 AND serial = ?6",
            params![
                status.as_str(),
                signal_quality.as_str(),
                rx_power_dbm,
                last_seen_at.map(format_db_time),
                port_id,
                serial,
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        Ok(Self::find_unit(&conn, port_id, serial)?)
    }

    fn list_units(&self, device_id: i64) -> Result<Vec<SubscriberUnit>, RepositoryError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT u.id, u.port_id, u.serial, u.status, u.signal_quality, u.rx_power_dbm, u.last_seen_at
             FROM subscriber_units u
             JOIN child_ports p ON u.port_id = p.id
             WHERE p.device_id = ?1
             ORDER BY u.id",
        )?;
        let units = stmt
            .query_map(params![device_id], unit_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(units)
    }
}

impl MetricsRepository for Store {
    fn append(&self, sample: &MetricSample) -> Result<(), RepositoryError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO metric_samples (device_id, captured_at, kind, value) VALUES (?1, ?2, ?3, ?4)",
            params![
                sample.device_id,
                format_db_time(sample.captured_at),
                sample.kind.as_str(),
                sample.value,
            ],
        )?;
        Ok(())
    }

    fn latest(
        &self,
        device_id: i64,
        kind: MetricKind,
        limit: usize,
    ) -> Result<Vec<MetricSample>, RepositoryError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT device_id, captured_at, kind, value FROM metric_samples
             WHERE device_id = ?1 AND kind = ?2
             ORDER BY captured_at DESC, id DESC LIMIT ?3",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let samples = stmt
            .query_map(params![device_id, kind.as_str(), limit], |row| {
                Ok(MetricSample {
                    device_id: row.get(0)?,
                    captured_at: required_time(row, 1)?,
                    kind: parse_column(row, 2)?,
                    value: row.get(3)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(samples)
    }
}

impl AlarmStore for Store {
    fn insert_alarm(&self, alarm: &NewAlarm) -> Result<Alarm, RepositoryError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO alarms (device_id, unit_id, severity, kind, message, raised_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                alarm.subject.device_id,
                alarm.subject.unit_id,
                alarm.severity.as_str(),
                alarm.kind.as_str(),
                alarm.message,
                format_db_time(alarm.raised_at),
            ],
        )?;
        Ok(Alarm {
            id: conn.last_insert_rowid(),
            device_id: alarm.subject.device_id,
            unit_id: alarm.subject.unit_id,
            severity: alarm.severity,
            kind: alarm.kind,
            message: alarm.message.clone(),
            raised_at: alarm.raised_at,
            cleared_at: None,
        })
    }

    fn clear_alarm(&self, id: i64, cleared_at: DateTime<Utc>) -> Result<(), RepositoryError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE alarms SET cleared_at = ?1 WHERE id = ?2 AND cleared_at IS NULL",
            params![format_db_time(cleared_at), id],
        )?;
        if changed == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    fn open_alarms(&self) -> Result<Vec<Alarm>, RepositoryError> {
        self.list_alarms(None, true)
    }

    fn list_alarms(
        &self,
        device_id: Option<i64>,
        open_only: bool,
    ) -> Result<Vec<Alarm>, RepositoryError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM alarms
             WHERE (?1 IS NULL OR device_id = ?1) AND (?2 = 0 OR cleared_at IS NULL)
             ORDER BY raised_at DESC, id DESC",
            ALARM_COLUMNS
        ))?;
        let alarms = stmt
            .query_map(params![device_id, open_only], alarm_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(alarms)
    }
}

fn device_from_row(row: &Row<'_>) -> SqlResult<Device> {
    Ok(Device {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        credential_ref: row.get(3)?,
        status: parse_column(row, 4)?,
        last_poll_at: optional_time(row, 5)?,
        last_successful_poll_at: optional_time(row, 6)?,
        last_error: row.get(7)?,
    })
}

fn port_from_row(row: &Row<'_>) -> SqlResult<ChildPort> {
    Ok(ChildPort {
        id: row.get(0)?,
        device_id: row.get(1)?,
        index: row.get(2)?,
        total_units: row.get(3)?,
        active_units: row.get(4)?,
        status: parse_column(row, 5)?,
        last_poll_at: optional_time(row, 6)?,
    })
}

fn unit_from_row(row: &Row<'_>) -> SqlResult<SubscriberUnit> {
    Ok(SubscriberUnit {
        id: row.get(0)?,
        port_id: row.get(1)?,
        serial: row.get(2)?,
        status: parse_column(row, 3)?,
        signal_quality: parse_column(row, 4)?,
        rx_power_dbm: row.get(5)?,
        last_seen_at: optional_time(row, 6)?,
    })
}

fn alarm_from_row(row: &Row<'_>) -> SqlResult<Alarm> {
    Ok(Alarm {
        id: row.get(0)?,
        device_id: row.get(1)?,
        unit_id: row.get(2)?,
        severity: parse_column(row, 3)?,
        kind: parse_column(row, 4)?,
        message: row.get(5)?,
        raised_at: required_time(row, 6)?,
        cleared_at: optional_time(row, 7)?,
    })
}

/// Read a text column into one of the model enums.
fn parse_column<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> SqlResult<T> {
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn optional_time(row: &Row<'_>, idx: usize) -> SqlResult<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    match text {
        None => Ok(None),
        Some(s) => parse_db_time(&s).map(Some).ok_or_else(|| bad_time(idx, &s)),
    }
}

fn required_time(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    parse_db_time(&text).ok_or_else(|| bad_time(idx, &text))
}

fn bad_time(idx: usize, text: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unparsable timestamp: {}", text).into(),
    )
}

fn format_db_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
