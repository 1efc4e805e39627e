//! Simulated telemetry for lab setups without reachable hardware.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use super::{MetricClass, PortReading, Reading, TelemetryClient, TelemetryError, UnitReading};
use crate::db::{Device, MetricKind, SignalQuality, UnitStatus};

/// Produces plausible random readings for every device.
#[derive(Debug, Clone)]
pub struct SimulatedClient {
    pub ports_per_device: u32,
    pub units_per_port: u32,
}

impl Default for SimulatedClient {
    fn default() -> Self {
        Self {
            ports_per_device: 4,
            units_per_port: 8,
        }
    }
}

impl SimulatedClient {
    fn unit_serial(device_id: i64, port: u32, n: u32) -> String {
        format!("SIM{:04}{:02}{:03}", device_id, port, n)
    }

    /// Port indices and unit serials reported for a device, in reporting order.
    /// Provision from this so every reading finds its row.
    pub fn layout(&self, device_id: i64) -> Vec<(u32, Vec<String>)> {
        (1..=self.ports_per_device)
            .map(|index| {
                let serials = (1..=self.units_per_port)
                    .map(|n| Self::unit_serial(device_id, index, n))
                    .collect();
                (index, serials)
            })
            .collect()
    }

    fn reading(kind: MetricKind) -> Reading {
        let mut rng = rand::thread_rng();
        let value = match kind {
            MetricKind::Uptime => rng.gen_range(3_600.0..8_640_000.0),
            MetricKind::CpuUsage => rng.gen_range(5.0..95.0),
            MetricKind::MemoryUsage => rng.gen_range(20.0..85.0),
            MetricKind::TrafficIn | MetricKind::TrafficOut => rng.gen_range(1.0e6..1.0e10),
            MetricKind::Temperature => rng.gen_range(35.0..75.0),
        };
        Reading { kind, value }
    }

    fn unit(serial: String) -> UnitReading {
        let mut rng = rand::thread_rng();
        let rx_power_dbm: f64 = rng.gen_range(-30.0..-14.0);
        let (status, signal_quality) = match rng.gen_range(0..100) {
            0..=2 => (UnitStatus::LossOfSignal, SignalQuality::Unknown),
            3..=7 => (UnitStatus::Offline, SignalQuality::Unknown),
            _ => (UnitStatus::Online, signal_from_power(rx_power_dbm)),
        };
        UnitReading {
            serial,
            status,
            signal_quality,
            rx_power_dbm: (status == UnitStatus::Online).then_some(rx_power_dbm),
        }
    }
}

/// Grade received optical power the way GPON class B+ budgets do.
pub fn signal_from_power(rx_power_dbm: f64) -> SignalQuality {
    if rx_power_dbm >= -20.0 {
        SignalQuality::Excellent
    } else if rx_power_dbm >= -24.0 {
        SignalQuality::Good
    } else if rx_power_dbm >= -27.0 {
        SignalQuality::Fair
    } else {
        SignalQuality::Poor
    }
}

#[async_trait]
impl TelemetryClient for SimulatedClient {
    async fn fetch_metrics(
        &self,
        _device: &Device,
        class: MetricClass,
    ) -> Result<Vec<Reading>, TelemetryError> {
        // Jitter so a batch doesn't answer in lockstep
        let jitter = rand::random::<u64>() % 100;
        tokio::time::sleep(Duration::from_millis(jitter)).await;

        Ok(class.kinds().iter().map(|k| Self::reading(*k)).collect())
    }

    async fn fetch_ports(&self, device: &Device) -> Result<Vec<PortReading>, TelemetryError> {
        let ports = self
            .layout(device.id)
            .into_iter()
            .map(|(index, serials)| {
                let units: Vec<UnitReading> = serials.into_iter().map(Self::unit).collect();
                let active_units = units
                    .iter()
                    .filter(|u| u.status == UnitStatus::Online)
                    .count() as u32;
                PortReading {
                    index,
                    total_units: self.units_per_port,
                    active_units,
                    units: Some(units),
                }
            })
            .collect();
        Ok(ports)
    }
}
