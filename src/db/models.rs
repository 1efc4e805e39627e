//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum stored as text.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {}: {}", stringify!($name), other)),
                }
            }
        }
    };
}

/// Rolled-up health of a polled device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Warning,
    Offline,
    /// Administrator-only. Suspends polling and alarm evaluation.
    Maintenance,
}

text_enum!(DeviceStatus {
    Online => "online",
    Warning => "warning",
    Offline => "offline",
    Maintenance => "maintenance",
});

/// A polled network access element (an OLT).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub credential_ref: String,
    pub status: DeviceStatus,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_successful_poll_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for Device {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            address: String::new(),
            credential_ref: String::new(),
            status: DeviceStatus::Online,
            last_poll_at: None,
            last_successful_poll_at: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortStatus {
    Online,
    Offline,
}

text_enum!(PortStatus {
    Online => "online",
    Offline => "offline",
});

impl PortStatus {
    /// A port with no active subscriber units is considered down.
    pub fn from_active_units(active_units: u32) -> Self {
        if active_units == 0 {
            PortStatus::Offline
        } else {
            PortStatus::Online
        }
    }
}

/// A physical port on a device aggregating subscriber units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildPort {
    pub id: i64,
    pub device_id: i64,
    pub index: u32,
    pub total_units: u32,
    pub active_units: u32,
    pub status: PortStatus,
    pub last_poll_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Online,
    Offline,
    LossOfSignal,
    Degraded,
    Disabled,
    Pending,
}

text_enum!(UnitStatus {
    Online => "online",
    Offline => "offline",
    LossOfSignal => "loss_of_signal",
    Degraded => "degraded",
    Disabled => "disabled",
    Pending => "pending",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Unknown,
}

text_enum!(SignalQuality {
    Excellent => "excellent",
    Good => "good",
    Fair => "fair",
    Poor => "poor",
    Unknown => "unknown",
});

/// An end-customer unit (ONU) attached to a port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberUnit {
    pub id: i64,
    pub port_id: i64,
    pub serial: String,
    pub status: UnitStatus,
    pub signal_quality: SignalQuality,
    pub rx_power_dbm: Option<f64>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Uptime,
    CpuUsage,
    MemoryUsage,
    TrafficIn,
    TrafficOut,
    Temperature,
}

text_enum!(MetricKind {
    Uptime => "uptime",
    CpuUsage => "cpu_usage",
    MemoryUsage => "memory_usage",
    TrafficIn => "traffic_in",
    TrafficOut => "traffic_out",
    Temperature => "temperature",
});

/// A single immutable reading. Never updated once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub device_id: i64,
    pub captured_at: DateTime<Utc>,
    pub kind: MetricKind,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

text_enum!(Severity {
    Info => "info",
    Warning => "warning",
    Critical => "critical",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmKind {
    HighTemperature,
    HighCpu,
    LossOfSignal,
    PoorSignal,
    UnitOffline,
    Offline,
}

text_enum!(AlarmKind {
    HighTemperature => "HIGH_TEMPERATURE",
    HighCpu => "HIGH_CPU",
    LossOfSignal => "LOSS_OF_SIGNAL",
    PoorSignal => "POOR_SIGNAL",
    UnitOffline => "UNIT_OFFLINE",
    Offline => "OFFLINE",
});

/// What an alarm is about: the device itself or one of its units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlarmSubject {
    pub device_id: i64,
    pub unit_id: Option<i64>,
}

impl AlarmSubject {
    pub fn device(device_id: i64) -> Self {
        Self {
            device_id,
            unit_id: None,
        }
    }

    pub fn unit(device_id: i64, unit_id: i64) -> Self {
        Self {
            device_id,
            unit_id: Some(unit_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub id: i64,
    pub device_id: i64,
    pub unit_id: Option<i64>,
    pub severity: Severity,
    pub kind: AlarmKind,
    pub message: String,
    pub raised_at: DateTime<Utc>,
    pub cleared_at: Option<DateTime<Utc>>,
}

impl Alarm {
    pub fn subject(&self) -> AlarmSubject {
        AlarmSubject {
            device_id: self.device_id,
            unit_id: self.unit_id,
        }
    }
}

/// An alarm that has not been persisted yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlarm {
    pub subject: AlarmSubject,
    pub severity: Severity,
    pub kind: AlarmKind,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}
