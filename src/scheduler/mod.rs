//! Scheduler module driving fleet sweeps and the staleness watchdog.

mod clock;
mod poller;
mod watchdog;

pub use clock::*;
pub use poller::*;
pub use watchdog::*;

use crate::config::{ConfigError, PollIntervals};
use crate::db::DeviceDirectory;
use crate::telemetry::MetricClass;

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

/// Totals for one sweep of one metric class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub class: MetricClass,
    /// The class was already sweeping, nothing was polled.
    pub skipped: bool,
    pub devices: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub suspended: usize,
}

impl SweepReport {
    fn new(class: MetricClass) -> Self {
        Self {
            class,
            skipped: false,
            devices: 0,
            succeeded: 0,
            failed: 0,
            suspended: 0,
        }
    }
}

/// Runs sweeps. Cloned into every timer task.
#[derive(Clone)]
struct Sweeper {
    directory: Arc<dyn DeviceDirectory>,
    poller: Arc<DevicePoller>,
    batch_size: usize,
    // One permit per class: a class never sweeps twice at once
    busy: Arc<HashMap<MetricClass, Arc<Semaphore>>>,
}

impl Sweeper {
    fn try_claim(&self, class: MetricClass) -> Option<OwnedSemaphorePermit> {
        self.busy.get(&class)?.clone().try_acquire_owned().ok()
    }

    async fn poll_fleet(&self, class: MetricClass) -> SweepReport {
        match self.try_claim(class) {
            Some(permit) => self.sweep(class, permit).await,
            None => {
                tracing::warn!("Scheduler: {} sweep already running, skipping", class);
                SweepReport {
                    skipped: true,
                    ..SweepReport::new(class)
                }
            }
        }
    }

    async fn sweep(&self, class: MetricClass, _permit: OwnedSemaphorePermit) -> SweepReport {
        let mut report = SweepReport::new(class);

        let devices = match self.directory.list_pollable() {
            Ok(d) => d,
            Err(e) => {
                tracing::error!("Scheduler: failed to load devices for {} sweep: {}", class, e);
                return report;
            }
        };
        report.devices = devices.len();

        for batch in devices.chunks(self.batch_size.max(1)) {
            let mut polls = JoinSet::new();
            for device in batch {
                let poller = self.poller.clone();
                let id = device.id;
                polls.spawn(async move { (id, poller.poll_device(id, class).await) });
            }

            while let Some(joined) = polls.join_next().await {
                match joined {
                    Ok((_, Ok(poll))) if poll.is_suspended() => report.suspended += 1,
                    Ok((_, Ok(_))) => report.succeeded += 1,
                    Ok((id, Err(e))) => {
                        tracing::debug!("Scheduler: device {} failed {} poll: {}", id, class, e);
                        report.failed += 1;
                    }
                    Err(e) => {
                        tracing::error!("Scheduler: {} poll task aborted: {}", class, e);
                        report.failed += 1;
                    }
                }
            }
        }

        tracing::info!(
            "Scheduler: {} sweep done: {} devices, {} ok, {} failed",
            class,
            report.devices,
            report.succeeded,
            report.failed
        );

        report
    }
}

/// Owns the per-class timers and the watchdog timer.
pub struct FleetScheduler {
    sweeper: Sweeper,
    watchdog: Arc<StalenessWatchdog>,
    stop: Mutex<Option<broadcast::Sender<()>>>,
}

impl FleetScheduler {
    pub fn new(
        directory: Arc<dyn DeviceDirectory>,
        poller: Arc<DevicePoller>,
        watchdog: Arc<StalenessWatchdog>,
        batch_size: usize,
    ) -> Self {
        let busy = MetricClass::ALL
            .into_iter()
            .map(|class| (class, Arc::new(Semaphore::new(1))))
            .collect();

        Self {
            sweeper: Sweeper {
                directory,
                poller,
                batch_size,
                busy: Arc::new(busy),
            },
            watchdog,
            stop: Mutex::new(None),
        }
    }

    /// Start one timer per metric class plus the watchdog timer.
    ///
    /// Starting a running scheduler is a no-op.
    pub async fn start(&self, intervals: &PollIntervals) -> Result<(), ConfigError> {
        intervals.validate()?;
        if self.sweeper.batch_size == 0 {
            return Err(ConfigError::Invalid("batch size must be at least 1".to_string()));
        }

        let mut stop = self.stop.lock().await;
        if stop.is_some() {
            tracing::debug!("Scheduler: already running");
            return Ok(());
        }

        let (tx, _) = broadcast::channel(1);

        for class in MetricClass::ALL {
            let period = intervals.for_class(class);
            tracing::info!("Scheduler: polling {} every {:?}", class, period);
            tokio::spawn(run_class_timer(
                self.sweeper.clone(),
                class,
                period,
                tx.subscribe(),
            ));
        }

        tracing::info!("Scheduler: watchdog every {:?}", intervals.watchdog);
        tokio::spawn(run_watchdog_timer(
            self.watchdog.clone(),
            intervals.watchdog,
            tx.subscribe(),
        ));

        *stop = Some(tx);
        Ok(())
    }

    /// Stop all timers. Sweeps already running are left to finish.
    pub async fn stop(&self) {
        let mut stop = self.stop.lock().await;
        if let Some(tx) = stop.take() {
            let _ = tx.send(());
            tracing::info!("Scheduler: stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.stop.lock().await.is_some()
    }

    /// Sweep one metric class now. Never fails; per-device failures are counted.
    pub async fn poll_fleet(&self, class: MetricClass) -> SweepReport {
        self.sweeper.poll_fleet(class).await
    }

    /// Run the staleness watchdog now.
    pub fn run_health_check(&self) -> HealthReport {
        self.watchdog.run_health_check()
    }
}

async fn run_class_timer(
    sweeper: Sweeper,
    class: MetricClass,
    period: Duration,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {
                let permit = match sweeper.try_claim(class) {
                    Some(p) => p,
                    None => {
                        tracing::warn!("Scheduler: previous {} sweep still running, skipping tick", class);
                        continue;
                    }
                };

                let sweeper = sweeper.clone();
                tokio::spawn(async move {
                    sweeper.sweep(class, permit).await;
                });
            }
        }
    }
}

async fn run_watchdog_timer(
    watchdog: Arc<StalenessWatchdog>,
    period: Duration,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {
                watchdog.run_health_check();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DeviceStatus, MetricKind};
    use crate::testing::{FakeClient, Fixture};

    fn intervals() -> PollIntervals {
        PollIntervals::default()
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_never_exceeds_batch_size() {
        let fx = Fixture::new(FakeClient::with_delay(Duration::from_millis(50)));
        for i in 0..23 {
            fx.add_device(&format!("olt-{}", i));
        }

        let report = fx.scheduler(5).poll_fleet(MetricClass::CpuMemory).await;

        assert_eq!(report.devices, 23);
        assert_eq!(report.succeeded, 23);
        assert_eq!(fx.client.calls().len(), 23);
        assert_eq!(fx.client.max_in_flight(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failing_device_does_not_stop_the_sweep() {
        let fx = Fixture::new(FakeClient::default());
        let ids: Vec<i64> = (0..7).map(|i| fx.add_device(&format!("olt-{}", i))).collect();
        fx.client.fail(ids[2]);

        let report = fx.scheduler(3).poll_fleet(MetricClass::Status).await;

        assert_eq!(report.succeeded, 6);
        assert_eq!(report.failed, 1);
        assert_eq!(fx.device(ids[2]).status, DeviceStatus::Warning);
        assert_eq!(fx.device(ids[6]).status, DeviceStatus::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_devices_are_not_swept() {
        let fx = Fixture::new(FakeClient::default());
        let active = fx.add_device("active");
        let parked = fx.add_device("parked");
        fx.store.set_maintenance(parked, true).unwrap();

        let report = fx.scheduler(5).poll_fleet(MetricClass::Status).await;

        assert_eq!(report.devices, 1);
        assert_eq!(fx.client.calls(), vec![(active, MetricClass::Status)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_class_is_skipped_not_queued() {
        let fx = Fixture::with_timeout(FakeClient::default(), Duration::from_secs(3600));
        fx.add_device("olt-1");
        fx.client.hang(MetricClass::Traffic);
        let scheduler = Arc::new(fx.scheduler(5));

        let background = scheduler.clone();
        tokio::spawn(async move { background.poll_fleet(MetricClass::Traffic).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = scheduler.poll_fleet(MetricClass::Traffic).await;
        assert!(second.skipped);
        assert_eq!(fx.client.calls_for(MetricClass::Traffic), 1);

        // Another class is unaffected
        let other = scheduler.poll_fleet(MetricClass::Temperature).await;
        assert!(!other.skipped);
        assert_eq!(other.succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_class_does_not_block_other_timers() {
        let fx = Fixture::with_timeout(FakeClient::default(), Duration::from_secs(3600));
        let id = fx.add_device("olt-1");
        fx.client.set_reading(id, MetricKind::CpuUsage, 12.0);
        fx.client.hang(MetricClass::Traffic);
        let scheduler = fx.scheduler(5);

        scheduler.start(&intervals()).await.unwrap();
        // cpu/memory fires at 0s, 30s, 60s and 90s
        tokio::time::sleep(Duration::from_secs(95)).await;

        assert_eq!(fx.client.calls_for(MetricClass::CpuMemory), 4);
        assert_eq!(fx.client.calls_for(MetricClass::Traffic), 1);
        assert_eq!(fx.client.calls_for(MetricClass::Status), 2);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_prevents_new_sweeps_and_is_idempotent() {
        let fx = Fixture::new(FakeClient::default());
        fx.add_device("olt-1");
        let scheduler = fx.scheduler(5);

        scheduler.stop().await;
        assert!(!scheduler.is_running().await);

        scheduler.start(&intervals()).await.unwrap();
        scheduler.start(&intervals()).await.unwrap();
        assert!(scheduler.is_running().await);
        tokio::time::sleep(Duration::from_secs(1)).await;
        let before = fx.client.calls().len();
        assert_eq!(before, 4);

        scheduler.stop().await;
        scheduler.stop().await;
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(fx.client.calls().len(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_intervals_fail_at_start() {
        let fx = Fixture::new(FakeClient::default());
        let scheduler = fx.scheduler(5);

        let bad = PollIntervals {
            traffic: Duration::ZERO,
            ..PollIntervals::default()
        };
        assert!(matches!(scheduler.start(&bad).await, Err(ConfigError::Invalid(_))));
        assert!(!scheduler.is_running().await);

        let zero_batch = fx.scheduler(0);
        assert!(zero_batch.start(&intervals()).await.is_err());
    }
}
