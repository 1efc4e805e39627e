//! One poll cycle for one device.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::clock::Clock;
use crate::alarm::{evaluate_sample, evaluate_unit, AlarmEvent, AlarmThresholds, DedupLedger, Evaluation};
use crate::db::{
    AlarmKind, Device, DeviceDirectory, DeviceStatus, MetricSample, MetricsRepository,
    RepositoryError, UnitStatus,
};
use crate::telemetry::{MetricClass, PortReading, TelemetryClient, TelemetryError};

/// Poll error types.
#[derive(Error, Debug)]
pub enum PollError {
    #[error("device {0} not found")]
    DeviceNotFound(i64),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// What a completed poll cycle did.
#[derive(Debug, Clone)]
pub struct PollReport {
    pub device_id: i64,
    pub class: MetricClass,
    pub status: DeviceStatus,
    pub samples_written: usize,
    pub ports_updated: usize,
    pub alarm_events: Vec<AlarmEvent>,
}

impl PollReport {
    fn new(device_id: i64, class: MetricClass, status: DeviceStatus) -> Self {
        Self {
            device_id,
            class,
            status,
            samples_written: 0,
            ports_updated: 0,
            alarm_events: Vec::new(),
        }
    }

    /// The device is in maintenance and was left untouched.
    pub fn is_suspended(&self) -> bool {
        self.status == DeviceStatus::Maintenance
    }
}

/// Executes poll cycles against the injected collaborators.
pub struct DevicePoller {
    directory: Arc<dyn DeviceDirectory>,
    telemetry: Arc<dyn TelemetryClient>,
    metrics: Arc<dyn MetricsRepository>,
    ledger: Arc<DedupLedger>,
    clock: Arc<dyn Clock>,
    thresholds: AlarmThresholds,
    timeout: Duration,
}

impl DevicePoller {
    pub fn new(
        directory: Arc<dyn DeviceDirectory>,
        telemetry: Arc<dyn TelemetryClient>,
        metrics: Arc<dyn MetricsRepository>,
        ledger: Arc<DedupLedger>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            directory,
            telemetry,
            metrics,
            ledger,
            clock,
            thresholds: AlarmThresholds::default(),
            timeout,
        }
    }

    /// Poll one device for one metric class and record the outcome.
    ///
    /// Every failure after the device was found has already been recorded on
    /// the device (status, `last_poll_at`, `last_error`) when this returns.
    pub async fn poll_device(
        &self,
        device_id: i64,
        class: MetricClass,
    ) -> Result<PollReport, PollError> {
        let device = match self.directory.get_device(device_id)? {
            Some(d) => d,
            None => {
                tracing::warn!("Poller: device {} not found", device_id);
                return Err(PollError::DeviceNotFound(device_id));
            }
        };

        if device.status == DeviceStatus::Maintenance {
            tracing::debug!("Poller: {} is in maintenance, skipping", device.name);
            return Ok(PollReport::new(device.id, class, DeviceStatus::Maintenance));
        }

        let result = match self.run_cycle(&device, class).await {
            Ok(report) => self.record_success(&device, report),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            self.record_failure(&device, e);
        }
        result
    }

    async fn run_cycle(&self, device: &Device, class: MetricClass) -> Result<PollReport, PollError> {
        let now = self.clock.now();
        let mut report = PollReport::new(device.id, class, DeviceStatus::Online);

        let readings = self
            .bounded(self.telemetry.fetch_metrics(device, class))
            .await?;

        let kinds = class.kinds();
        for reading in readings {
            if !kinds.contains(&reading.kind) {
                tracing::debug!(
                    "Poller: dropping {} reading from {}, not part of {}",
                    reading.kind,
                    device.name,
                    class
                );
                continue;
            }
            self.metrics.append(&MetricSample {
                device_id: device.id,
                captured_at: now,
                kind: reading.kind,
                value: reading.value,
            })?;
            report.samples_written += 1;
        }

        let mut units_polled = false;
        if class.enumerates_ports() {
            let ports = self.bounded(self.telemetry.fetch_ports(device)).await?;
            for port in &ports {
                if self.apply_port(device, port, now)? {
                    report.ports_updated += 1;
                    units_polled |= port.units.is_some();
                }
            }
        }

        let mut evaluations: Vec<Evaluation> = Vec::new();
        for kind in kinds {
            if let Some(latest) = self.metrics.latest(device.id, *kind, 1)?.into_iter().next() {
                evaluations.extend(evaluate_sample(&latest, &self.thresholds));
            }
        }
        if units_polled {
            for unit in self.directory.list_units(device.id)? {
                evaluations.extend(evaluate_unit(device.id, &unit, now, &self.thresholds));
            }
        }

        for evaluation in &evaluations {
            report.alarm_events.extend(self.ledger.reconcile(evaluation, now)?);
        }

        Ok(report)
    }

    /// Returns false when the port is not provisioned.
    fn apply_port(
        &self,
        device: &Device,
        port: &PortReading,
        now: DateTime<Utc>,
    ) -> Result<bool, PollError> {
        let stored = self.directory.update_port(
            device.id,
            port.index,
            port.total_units,
            port.active_units,
            now,
        )?;

        let stored = match stored {
            Some(p) => p,
            None => {
                tracing::debug!("Poller: {} reported unprovisioned port {}", device.name, port.index);
                return Ok(false);
            }
        };

        if let Some(units) = &port.units {
            for unit in units {
                let seen = matches!(unit.status, UnitStatus::Online | UnitStatus::Degraded).then_some(now);
                let updated = self.directory.update_unit(
                    stored.id,
                    &unit.serial,
                    unit.status,
                    unit.signal_quality,
                    unit.rx_power_dbm,
                    seen,
                )?;
                if updated.is_none() {
                    tracing::debug!(
                        "Poller: {} port {} reported unprovisioned unit {}",
                        device.name,
                        port.index,
                        unit.serial
                    );
                }
            }
        }

        Ok(true)
    }

    fn record_success(&self, device: &Device, mut report: PollReport) -> Result<PollReport, PollError> {
        let now = self.clock.now();

        // Active non-offline alarms on the device itself hold it at warning.
        let degraded = self
            .ledger
            .open_device_alarms(device.id)
            .iter()
            .any(|a| a.kind != AlarmKind::Offline);
        let status = if degraded {
            DeviceStatus::Warning
        } else {
            DeviceStatus::Online
        };

        let applied = self
            .directory
            .update_device_status(device.id, status, Some(now), Some(now))?;
        if !applied {
            tracing::debug!("Poller: {} entered maintenance mid-poll, status kept", device.name);
            report.status = DeviceStatus::Maintenance;
            return Ok(report);
        }
        if device.last_error.is_some() {
            self.directory.record_poll_error(device.id, None)?;
        }

        tracing::debug!(
            "Poller: {} {} ok ({} samples, {} ports, {} alarm events) -> {}",
            device.name,
            report.class,
            report.samples_written,
            report.ports_updated,
            report.alarm_events.len(),
            status
        );

        report.status = status;
        Ok(report)
    }

    fn record_failure(&self, device: &Device, error: &PollError) {
        let now = self.clock.now();

        tracing::warn!("Poller: poll of {} failed: {}", device.name, error);

        if let Err(e) = self
            .directory
            .update_device_status(device.id, DeviceStatus::Warning, Some(now), None)
        {
            tracing::error!("Poller: failed to record status for {}: {}", device.name, e);
        }
        if let Err(e) = self
            .directory
            .record_poll_error(device.id, Some(&error.to_string()))
        {
            tracing::error!("Poller: failed to record error for {}: {}", device.name, e);
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, TelemetryError>>,
    ) -> Result<T, TelemetryError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TelemetryError::Timeout(self.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AlarmStore, ChildPort, MetricKind, PortStatus, Severity, SignalQuality, Store};
    use crate::telemetry::UnitReading;
    use crate::testing::{Fixture, FakeClient};
    use chrono::Duration as ChronoDuration;

    #[tokio::test(start_paused = true)]
    async fn test_successful_poll_stamps_both_timestamps() {
        let fx = Fixture::new(FakeClient::default());
        let id = fx.add_device("olt-1");
        fx.client.set_reading(id, MetricKind::CpuUsage, 35.0);
        fx.client.set_reading(id, MetricKind::MemoryUsage, 41.0);

        let report = fx.poller.poll_device(id, MetricClass::CpuMemory).await.unwrap();
        assert_eq!(report.samples_written, 2);
        assert_eq!(report.status, DeviceStatus::Online);

        let device = fx.device(id);
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.last_poll_at, Some(fx.clock.now()));
        assert_eq!(device.last_successful_poll_at, Some(fx.clock.now()));
        assert!(device.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_poll_keeps_last_success() {
        let fx = Fixture::new(FakeClient::default());
        let id = fx.add_device("olt-1");
        fx.client.set_reading(id, MetricKind::Uptime, 100.0);
        fx.poller.poll_device(id, MetricClass::Status).await.unwrap();
        let first_success = fx.clock.now();

        fx.clock.advance(ChronoDuration::seconds(60));
        fx.client.fail(id);
        let result = fx.poller.poll_device(id, MetricClass::Status).await;
        assert!(matches!(result, Err(PollError::Telemetry(_))));

        let device = fx.device(id);
        assert_eq!(device.status, DeviceStatus::Warning);
        assert_eq!(device.last_poll_at, Some(fx.clock.now()));
        assert_eq!(device.last_successful_poll_at, Some(first_success));
        assert!(device.last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_poll_of_offline_device_goes_to_warning() {
        let fx = Fixture::new(FakeClient::default());
        let id = fx.add_device("olt-1");
        fx.store
            .update_device_status(id, DeviceStatus::Offline, None, None)
            .unwrap();

        fx.client.fail(id);
        let result = fx.poller.poll_device(id, MetricClass::Status).await;
        assert!(result.is_err());

        let device = fx.device(id);
        assert_eq!(device.status, DeviceStatus::Warning);
        assert_eq!(device.last_poll_at, Some(fx.clock.now()));
        assert!(device.last_successful_poll_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_set_mid_poll_is_kept() {
        let fx = Fixture::new(FakeClient::with_delay(Duration::from_millis(100)));
        let id = fx.add_device("olt-1");
        fx.client.set_reading(id, MetricKind::CpuUsage, 30.0);

        let poller = fx.poller.clone();
        let poll = tokio::spawn(async move { poller.poll_device(id, MetricClass::CpuMemory).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        fx.store.set_maintenance(id, true).unwrap();

        let report = poll.await.unwrap().unwrap();
        assert!(report.is_suspended());

        let device = fx.device(id);
        assert_eq!(device.status, DeviceStatus::Maintenance);
        assert!(device.last_successful_poll_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_poll_after_maintenance_is_kept() {
        let fx = Fixture::new(FakeClient::with_delay(Duration::from_millis(100)));
        let id = fx.add_device("olt-1");
        fx.client.fail(id);

        let poller = fx.poller.clone();
        let poll = tokio::spawn(async move { poller.poll_device(id, MetricClass::CpuMemory).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        fx.store.set_maintenance(id, true).unwrap();

        assert!(poll.await.unwrap().is_err());
        assert_eq!(fx.device(id).status, DeviceStatus::Maintenance);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let fx = Fixture::new(FakeClient::default());
        let id = fx.add_device("olt-1");
        fx.client.hang(MetricClass::Traffic);

        let result = fx.poller.poll_device(id, MetricClass::Traffic).await;
        assert!(matches!(
            result,
            Err(PollError::Telemetry(TelemetryError::Timeout(_)))
        ));
        assert_eq!(fx.device(id).status, DeviceStatus::Warning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_device_is_not_fatal() {
        let fx = Fixture::new(FakeClient::default());
        let result = fx.poller.poll_device(404, MetricClass::Status).await;
        assert!(matches!(result, Err(PollError::DeviceNotFound(404))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_requested_class_is_written() {
        let fx = Fixture::new(FakeClient::default());
        let id = fx.add_device("olt-1");
        fx.client.set_reading(id, MetricKind::Temperature, 80.0);
        fx.client.set_reading(id, MetricKind::CpuUsage, 20.0);

        let report = fx.poller.poll_device(id, MetricClass::CpuMemory).await.unwrap();
        assert_eq!(report.samples_written, 1);
        assert!(fx.store.latest(id, MetricKind::Temperature, 1).unwrap().is_empty());
        assert!(report.alarm_events.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_temperature_escalation_then_recovery() {
        let fx = Fixture::new(FakeClient::default());
        let id = fx.add_device("olt-1");

        fx.client.set_reading(id, MetricKind::Temperature, 60.0);
        let report = fx.poller.poll_device(id, MetricClass::Temperature).await.unwrap();
        assert_eq!(report.status, DeviceStatus::Warning);
        assert_eq!(fx.device(id).status, DeviceStatus::Warning);

        fx.clock.advance(ChronoDuration::seconds(120));
        fx.client.set_reading(id, MetricKind::Temperature, 75.0);
        fx.poller.poll_device(id, MetricClass::Temperature).await.unwrap();

        let open = fx.store.open_alarms().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].kind, AlarmKind::HighTemperature);
        assert_eq!(open[0].severity, Severity::Critical);

        // Same reading again: nothing new
        fx.clock.advance(ChronoDuration::seconds(120));
        let report = fx.poller.poll_device(id, MetricClass::Temperature).await.unwrap();
        assert!(report.alarm_events.is_empty());

        fx.clock.advance(ChronoDuration::seconds(120));
        fx.client.set_reading(id, MetricKind::Temperature, 42.0);
        let report = fx.poller.poll_device(id, MetricClass::Temperature).await.unwrap();
        assert!(matches!(&report.alarm_events[..], [AlarmEvent::Cleared(_)]));
        assert_eq!(report.status, DeviceStatus::Online);

        let history = fx.store.list_alarms(Some(id), false).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|a| a.cleared_at.is_some()));
        assert_eq!(fx.sink.raised().len(), 2);
        assert_eq!(fx.sink.cleared().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_leaves_alarms_open() {
        let fx = Fixture::new(FakeClient::default());
        let id = fx.add_device("olt-1");
        fx.client.set_reading(id, MetricKind::CpuUsage, 95.0);
        fx.poller.poll_device(id, MetricClass::CpuMemory).await.unwrap();

        fx.client.fail(id);
        let _ = fx.poller.poll_device(id, MetricClass::CpuMemory).await;
        assert_eq!(fx.store.open_alarms().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_port_follows_active_units_without_alarms() {
        let fx = Fixture::new(FakeClient::default());
        let id = fx.add_device("olt-1");
        fx.store.add_port(id, 1, 64).unwrap();
        fx.client.set_reading(id, MetricKind::Uptime, 1.0);

        let port = |active| PortReading {
            index: 1,
            total_units: 64,
            active_units: active,
            units: None,
        };

        fx.client.set_ports(id, vec![port(0)]);
        let report = fx.poller.poll_device(id, MetricClass::Status).await.unwrap();
        assert_eq!(report.ports_updated, 1);
        let stored: Vec<ChildPort> = fx.store.get_ports(id).unwrap();
        assert_eq!(stored[0].status, PortStatus::Offline);

        fx.clock.advance(ChronoDuration::seconds(60));
        fx.client.set_ports(id, vec![port(12)]);
        fx.poller.poll_device(id, MetricClass::Status).await.unwrap();
        let stored = fx.store.get_ports(id).unwrap();
        assert_eq!(stored[0].status, PortStatus::Online);
        assert_eq!(stored[0].active_units, 12);
        assert_eq!(stored[0].last_poll_at, Some(fx.clock.now()));

        assert!(fx.store.open_alarms().unwrap().is_empty());
        assert_eq!(fx.device(id).status, DeviceStatus::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unit_alarms_raise_and_clear() {
        let fx = Fixture::new(FakeClient::default());
        let id = fx.add_device("olt-1");
        let port_id = fx.store.add_port(id, 1, 64).unwrap();
        let unit_id = fx.store.add_unit(port_id, "ALCL0001").unwrap();

        let report_unit = |status, signal_quality| PortReading {
            index: 1,
            total_units: 64,
            active_units: 1,
            units: Some(vec![UnitReading {
                serial: "ALCL0001".to_string(),
                status,
                signal_quality,
                rx_power_dbm: None,
            }]),
        };

        fx.client.set_ports(id, vec![report_unit(UnitStatus::LossOfSignal, SignalQuality::Unknown)]);
        fx.poller.poll_device(id, MetricClass::Status).await.unwrap();

        let open = fx.store.open_alarms().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].kind, AlarmKind::LossOfSignal);
        assert_eq!(open[0].unit_id, Some(unit_id));
        // Unit alarms do not hold the device at warning
        assert_eq!(fx.device(id).status, DeviceStatus::Online);

        fx.client.set_ports(id, vec![report_unit(UnitStatus::Online, SignalQuality::Excellent)]);
        fx.poller.poll_device(id, MetricClass::Status).await.unwrap();
        assert!(fx.store.open_alarms().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_device_is_untouched() {
        let fx = Fixture::new(FakeClient::default());
        let id = fx.add_device("olt-1");
        fx.store.set_maintenance(id, true).unwrap();

        let report = fx.poller.poll_device(id, MetricClass::Status).await.unwrap();
        assert!(report.is_suspended());
        assert!(fx.client.calls().is_empty());
        assert!(fx.device(id).last_poll_at.is_none());
    }

    #[test]
    fn test_store_satisfies_poller_seams() {
        fn assert_seams<T: DeviceDirectory + MetricsRepository + AlarmStore>() {}
        assert_seams::<Store>();
    }
}
