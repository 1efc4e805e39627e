//! Threshold rules mapping the latest readings to alarm conditions.
//!
//! Every function here is pure: it only looks at its arguments and never
//! touches storage. An [`Evaluation`] with no verdict means the condition is
//! not met and any open alarm for that subject and kind should be cleared.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::db::{
    AlarmKind, AlarmSubject, MetricKind, MetricSample, Severity, SignalQuality, SubscriberUnit,
    UnitStatus,
};

/// Rule thresholds. Values strictly above a bound trip it.
#[derive(Debug, Clone)]
pub struct AlarmThresholds {
    pub temperature_warning: f64,
    pub temperature_critical: f64,
    pub cpu_warning: f64,
    pub cpu_critical: f64,
    pub unit_offline_after: ChronoDuration,
}

impl Default for AlarmThresholds {
    fn default() -> Self {
        Self {
            temperature_warning: 55.0,
            temperature_critical: 70.0,
            cpu_warning: 80.0,
            cpu_critical: 90.0,
            unit_offline_after: ChronoDuration::hours(24),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub severity: Severity,
    pub message: String,
}

/// The outcome of one rule for one subject in one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub subject: AlarmSubject,
    pub kind: AlarmKind,
    pub verdict: Option<Verdict>,
}

impl Evaluation {
    pub fn met(subject: AlarmSubject, kind: AlarmKind, severity: Severity, message: String) -> Self {
        Self {
            subject,
            kind,
            verdict: Some(Verdict { severity, message }),
        }
    }

    pub fn not_met(subject: AlarmSubject, kind: AlarmKind) -> Self {
        Self {
            subject,
            kind,
            verdict: None,
        }
    }

    pub fn is_met(&self) -> bool {
        self.verdict.is_some()
    }
}

fn tier(value: f64, warning: f64, critical: f64) -> Option<Severity> {
    if value > critical {
        Some(Severity::Critical)
    } else if value > warning {
        Some(Severity::Warning)
    } else {
        None
    }
}

/// Evaluate a device-level sample. Kinds without a rule yield `None`.
pub fn evaluate_sample(sample: &MetricSample, thresholds: &AlarmThresholds) -> Option<Evaluation> {
    let subject = AlarmSubject::device(sample.device_id);
    let (kind, severity, message) = match sample.kind {
        MetricKind::Temperature => (
            AlarmKind::HighTemperature,
            tier(
                sample.value,
                thresholds.temperature_warning,
                thresholds.temperature_critical,
            ),
            format!("Device temperature {:.1}°C", sample.value),
        ),
        MetricKind::CpuUsage => (
            AlarmKind::HighCpu,
            tier(sample.value, thresholds.cpu_warning, thresholds.cpu_critical),
            format!("Device CPU usage {:.1}%", sample.value),
        ),
        _ => return None,
    };

    Some(match severity {
        Some(severity) => Evaluation::met(subject, kind, severity, message),
        None => Evaluation::not_met(subject, kind),
    })
}

/// Evaluate every unit rule for one subscriber unit.
pub fn evaluate_unit(
    device_id: i64,
    unit: &SubscriberUnit,
    now: DateTime<Utc>,
    thresholds: &AlarmThresholds,
) -> Vec<Evaluation> {
    let subject = AlarmSubject::unit(device_id, unit.id);

    if unit.status == UnitStatus::Disabled {
        return vec![
            Evaluation::not_met(subject, AlarmKind::LossOfSignal),
            Evaluation::not_met(subject, AlarmKind::PoorSignal),
            Evaluation::not_met(subject, AlarmKind::UnitOffline),
        ];
    }

    let loss_of_signal = if unit.status == UnitStatus::LossOfSignal {
        Evaluation::met(
            subject,
            AlarmKind::LossOfSignal,
            Severity::Critical,
            format!("Unit {} lost optical signal", unit.serial),
        )
    } else {
        Evaluation::not_met(subject, AlarmKind::LossOfSignal)
    };

    let poor_signal = match unit.signal_quality {
        SignalQuality::Poor | SignalQuality::Fair => Evaluation::met(
            subject,
            AlarmKind::PoorSignal,
            Severity::Warning,
            match unit.rx_power_dbm {
                Some(dbm) => format!(
                    "Unit {} signal is {} ({:.1} dBm)",
                    unit.serial, unit.signal_quality, dbm
                ),
                None => format!("Unit {} signal is {}", unit.serial, unit.signal_quality),
            },
        ),
        _ => Evaluation::not_met(subject, AlarmKind::PoorSignal),
    };

    let long_offline = unit.status == UnitStatus::Offline
        && unit
            .last_seen_at
            .map_or(true, |seen| now - seen > thresholds.unit_offline_after);
    let unit_offline = if long_offline {
        Evaluation::met(
            subject,
            AlarmKind::UnitOffline,
            Severity::Warning,
            match unit.last_seen_at {
                Some(seen) => format!(
                    "Unit {} offline since {}",
                    unit.serial,
                    seen.format("%Y-%m-%d %H:%M")
                ),
                None => format!("Unit {} offline and never seen", unit.serial),
            },
        )
    } else {
        Evaluation::not_met(subject, AlarmKind::UnitOffline)
    };

    vec![loss_of_signal, poor_signal, unit_offline]
}

/// Evaluate device staleness for the watchdog.
pub fn evaluate_staleness(
    device_id: i64,
    last_successful_poll_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    max_age: ChronoDuration,
) -> Evaluation {
    let subject = AlarmSubject::device(device_id);
    match last_successful_poll_at {
        Some(last) if now - last <= max_age => Evaluation::not_met(subject, AlarmKind::Offline),
        Some(last) => Evaluation::met(
            subject,
            AlarmKind::Offline,
            Severity::Critical,
            format!(
                "No successful poll for {} minutes",
                (now - last).num_minutes()
            ),
        ),
        None => Evaluation::met(
            subject,
            AlarmKind::Offline,
            Severity::Critical,
            "Device has never been polled successfully".to_string(),
        ),
    }
}
