//! Staleness watchdog.
//!
//! Demotes devices whose last successful poll is too old and keeps the single
//! `OFFLINE` alarm per device in step with that. It never promotes a device;
//! only a successful poll does.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use serde::Serialize;

use super::clock::Clock;
use crate::alarm::{evaluate_staleness, AlarmEvent, DedupLedger};
use crate::db::{Device, DeviceDirectory, DeviceStatus, RepositoryError};

/// Outcome of one watchdog pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub checked: usize,
    pub demoted: usize,
    pub alarms_raised: usize,
    pub alarms_cleared: usize,
    pub errors: usize,
}

pub struct StalenessWatchdog {
    directory: Arc<dyn DeviceDirectory>,
    ledger: Arc<DedupLedger>,
    clock: Arc<dyn Clock>,
    max_age: ChronoDuration,
}

impl StalenessWatchdog {
    pub fn new(
        directory: Arc<dyn DeviceDirectory>,
        ledger: Arc<DedupLedger>,
        clock: Arc<dyn Clock>,
        max_age: ChronoDuration,
    ) -> Self {
        Self {
            directory,
            ledger,
            clock,
            max_age,
        }
    }

    /// Sweep every non-maintenance device once.
    pub fn run_health_check(&self) -> HealthReport {
        let mut report = HealthReport::default();

        let devices = match self.directory.list_all() {
            Ok(d) => d,
            Err(e) => {
                tracing::error!("Watchdog: failed to list devices: {}", e);
                report.errors += 1;
                return report;
            }
        };

        for device in devices {
            if device.status == DeviceStatus::Maintenance {
                continue;
            }
            report.checked += 1;

            if let Err(e) = self.check_device(&device, &mut report) {
                tracing::error!("Watchdog: check of {} failed: {}", device.name, e);
                report.errors += 1;
            }
        }

        if report.demoted > 0 || report.alarms_cleared > 0 {
            tracing::info!(
                "Watchdog: checked {} devices, {} demoted, {} alarms raised, {} cleared",
                report.checked,
                report.demoted,
                report.alarms_raised,
                report.alarms_cleared
            );
        }

        report
    }

    fn check_device(&self, device: &Device, report: &mut HealthReport) -> Result<(), RepositoryError> {
        let now = self.clock.now();
        let mut evaluation =
            evaluate_staleness(device.id, device.last_successful_poll_at, now, self.max_age);

        if evaluation.is_met() {
            // Conditional on the snapshot: a poll or a maintenance toggle that
            // landed since list_all() wins.
            if self.directory.demote_if_stale(device.id, device.last_successful_poll_at)? {
                if device.status != DeviceStatus::Offline {
                    tracing::warn!("Watchdog: {} is stale, marking offline", device.name);
                    report.demoted += 1;
                }
            } else {
                let current = match self.directory.get_device(device.id)? {
                    Some(d) if d.status != DeviceStatus::Maintenance => d,
                    _ => {
                        tracing::debug!("Watchdog: {} changed during the sweep, skipping", device.name);
                        return Ok(());
                    }
                };
                tracing::debug!("Watchdog: {} was polled during the sweep, re-evaluating", device.name);
                evaluation =
                    evaluate_staleness(current.id, current.last_successful_poll_at, now, self.max_age);
            }
        }

        for event in self.ledger.reconcile(&evaluation, now)? {
            match event {
                AlarmEvent::Raised(_) => report.alarms_raised += 1,
                AlarmEvent::Cleared(_) => report.alarms_cleared += 1,
            }
        }

        Ok(())
    }
}
