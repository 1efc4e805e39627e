//! Configuration module for ponwatch.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::telemetry::MetricClass;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Polling period per metric class plus the watchdog period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollIntervals {
    pub status: Duration,
    pub cpu_memory: Duration,
    pub traffic: Duration,
    pub temperature: Duration,
    pub watchdog: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            status: Duration::from_secs(60),
            cpu_memory: Duration::from_secs(30),
            traffic: Duration::from_secs(300),
            temperature: Duration::from_secs(120),
            watchdog: Duration::from_secs(300),
        }
    }
}

impl PollIntervals {
    pub fn for_class(&self, class: MetricClass) -> Duration {
        match class {
            MetricClass::Status => self.status,
            MetricClass::CpuMemory => self.cpu_memory,
            MetricClass::Traffic => self.traffic,
            MetricClass::Temperature => self.temperature,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for class in MetricClass::ALL {
            if self.for_class(class).is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "{} interval must be greater than zero",
                    class
                )));
            }
        }
        if self.watchdog.is_zero() {
            return Err(ConfigError::Invalid(
                "watchdog interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which telemetry client the host wires in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryMode {
    Simulated,
    Http,
}

impl FromStr for TelemetryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simulated" => Ok(TelemetryMode::Simulated),
            "http" => Ok(TelemetryMode::Http),
            other => Err(format!("unknown telemetry mode: {}", other)),
        }
    }
}

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// HTTP port for the admin server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "ponwatch.db")
    pub db_path: String,
    pub telemetry: TelemetryMode,
    /// Devices polled concurrently within one sweep (default: 5)
    pub batch_size: usize,
    /// Bound on every telemetry call (default: 8s)
    pub poll_timeout: Duration,
    pub intervals: PollIntervals,
    /// Age of the last successful poll after which a device is offline (default: 10m)
    pub stale_after: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "ponwatch.db".to_string(),
            telemetry: TelemetryMode::Simulated,
            batch_size: 5,
            poll_timeout: Duration::from_secs(8),
            intervals: PollIntervals::default(),
            stale_after: Duration::from_secs(600),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PONWATCH_HTTP_PORT`: HTTP port (default: 8080)
    /// - `PONWATCH_DB_PATH`: Database file path (default: "ponwatch.db")
    /// - `PONWATCH_TELEMETRY`: `simulated` or `http` (default: simulated)
    /// - `PONWATCH_BATCH_SIZE`: concurrent polls per batch (default: 5)
    /// - `PONWATCH_POLL_TIMEOUT_SECS`: telemetry call timeout (default: 8)
    /// - `PONWATCH_STATUS_INTERVAL_SECS` (60), `PONWATCH_CPU_MEMORY_INTERVAL_SECS` (30),
    ///   `PONWATCH_TRAFFIC_INTERVAL_SECS` (300), `PONWATCH_TEMPERATURE_INTERVAL_SECS` (120),
    ///   `PONWATCH_WATCHDOG_INTERVAL_SECS` (300)
    /// - `PONWATCH_STALE_AFTER_SECS`: offline threshold (default: 600)
    ///
    /// Unparsable values are ignored and the default kept.
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        let parsed = |key: &str| -> Option<u64> { lookup(key).and_then(|v| v.trim().parse().ok()) };
        let secs = |key: &str| parsed(key).map(Duration::from_secs);

        if let Some(port) = lookup("PONWATCH_HTTP_PORT").and_then(|v| v.parse().ok()) {
            cfg.http_port = port;
        }
        if let Some(db_path) = lookup("PONWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Some(mode) = lookup("PONWATCH_TELEMETRY").and_then(|v| v.parse().ok()) {
            cfg.telemetry = mode;
        }
        if let Some(batch_size) = parsed("PONWATCH_BATCH_SIZE") {
            cfg.batch_size = batch_size as usize;
        }
        if let Some(timeout) = secs("PONWATCH_POLL_TIMEOUT_SECS") {
            cfg.poll_timeout = timeout;
        }
        if let Some(d) = secs("PONWATCH_STATUS_INTERVAL_SECS") {
            cfg.intervals.status = d;
        }
        if let Some(d) = secs("PONWATCH_CPU_MEMORY_INTERVAL_SECS") {
            cfg.intervals.cpu_memory = d;
        }
        if let Some(d) = secs("PONWATCH_TRAFFIC_INTERVAL_SECS") {
            cfg.intervals.traffic = d;
        }
        if let Some(d) = secs("PONWATCH_TEMPERATURE_INTERVAL_SECS") {
            cfg.intervals.temperature = d;
        }
        if let Some(d) = secs("PONWATCH_WATCHDOG_INTERVAL_SECS") {
            cfg.intervals.watchdog = d;
        }
        if let Some(d) = secs("PONWATCH_STALE_AFTER_SECS") {
            cfg.stale_after = d;
        }

        cfg
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.intervals.validate()?;
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch size must be at least 1".to_string()));
        }
        if self.poll_timeout.is_zero() {
            return Err(ConfigError::Invalid("poll timeout must be greater than zero".to_string()));
        }
        if self.stale_after.is_zero() {
            return Err(ConfigError::Invalid("stale-after must be greater than zero".to_string()));
        }
        Ok(())
    }
}
