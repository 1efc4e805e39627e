//! Telemetry module for device interrogation.
//!
//! The engine polls devices through the [`TelemetryClient`] trait. Two clients
//! ship with the crate: a simulated one and an HTTP/JSON one.

mod http;
mod simulated;

pub use http::*;
pub use simulated::*;

use crate::db::{Device, MetricKind, SignalQuality, UnitStatus};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Telemetry error types.
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("telemetry timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed response: {0}")]
    Protocol(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// A category of telemetry polled on its own cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricClass {
    Status,
    CpuMemory,
    Traffic,
    Temperature,
}

impl MetricClass {
    pub const ALL: [MetricClass; 4] = [
        MetricClass::Status,
        MetricClass::CpuMemory,
        MetricClass::Traffic,
        MetricClass::Temperature,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricClass::Status => "status",
            MetricClass::CpuMemory => "cpu_memory",
            MetricClass::Traffic => "traffic",
            MetricClass::Temperature => "temperature",
        }
    }

    /// Sample kinds a poll of this class produces.
    pub fn kinds(&self) -> &'static [MetricKind] {
        match self {
            MetricClass::Status => &[MetricKind::Uptime],
            MetricClass::CpuMemory => &[MetricKind::CpuUsage, MetricKind::MemoryUsage],
            MetricClass::Traffic => &[MetricKind::TrafficIn, MetricKind::TrafficOut],
            MetricClass::Temperature => &[MetricKind::Temperature],
        }
    }

    /// Whether polling this class also walks ports and subscriber units.
    pub fn enumerates_ports(&self) -> bool {
        matches!(self, MetricClass::Status)
    }
}

impl fmt::Display for MetricClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricClass::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown metric class: {}", s))
    }
}

/// A raw reading as reported by a device, before it is stamped into a sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub kind: MetricKind,
    pub value: f64,
}

/// Port state as reported by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortReading {
    pub index: u32,
    pub total_units: u32,
    pub active_units: u32,
    /// `None` when the device cannot enumerate units on this port.
    #[serde(default)]
    pub units: Option<Vec<UnitReading>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitReading {
    pub serial: String,
    pub status: UnitStatus,
    pub signal_quality: SignalQuality,
    #[serde(default)]
    pub rx_power_dbm: Option<f64>,
}

/// Read-only access to one device's telemetry.
#[async_trait]
pub trait TelemetryClient: Send + Sync {
    /// Fetch the readings of a single metric class.
    async fn fetch_metrics(
        &self,
        device: &Device,
        class: MetricClass,
    ) -> Result<Vec<Reading>, TelemetryError>;

    /// Enumerate the device's ports and, where supported, their units.
    async fn fetch_ports(&self, device: &Device) -> Result<Vec<PortReading>, TelemetryError>;
}
