//! Shared fakes for engine tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use crate::alarm::{DedupLedger, RecordingSink};
use crate::db::{Device, DeviceDirectory, MetricKind, Store};
use crate::scheduler::{DevicePoller, FleetScheduler, ManualClock, StalenessWatchdog};
use crate::telemetry::{MetricClass, PortReading, Reading, TelemetryClient, TelemetryError};

/// Scripted telemetry client that also measures how many calls overlap.
#[derive(Default)]
pub struct FakeClient {
    readings: Mutex<HashMap<i64, HashMap<MetricKind, f64>>>,
    ports: Mutex<HashMap<i64, Vec<PortReading>>>,
    failing: Mutex<HashSet<i64>>,
    hanging: Mutex<HashSet<MetricClass>>,
    calls: Mutex<Vec<(i64, MetricClass)>>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeClient {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn set_reading(&self, device_id: i64, kind: MetricKind, value: f64) {
        self.readings
            .lock()
            .unwrap()
            .entry(device_id)
            .or_default()
            .insert(kind, value);
    }

    pub fn set_ports(&self, device_id: i64, ports: Vec<PortReading>) {
        self.ports.lock().unwrap().insert(device_id, ports);
    }

    pub fn fail(&self, device_id: i64) {
        self.failing.lock().unwrap().insert(device_id);
    }

    /// Calls for this class never complete.
    pub fn hang(&self, class: MetricClass) {
        self.hanging.lock().unwrap().insert(class);
    }

    pub fn calls(&self) -> Vec<(i64, MetricClass)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, class: MetricClass) -> usize {
        self.calls().iter().filter(|(_, c)| *c == class).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TelemetryClient for FakeClient {
    async fn fetch_metrics(
        &self,
        device: &Device,
        class: MetricClass,
    ) -> Result<Vec<Reading>, TelemetryError> {
        self.calls.lock().unwrap().push((device.id, class));

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let hang = self.hanging.lock().unwrap().contains(&class);
        if hang {
            std::future::pending::<()>().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.lock().unwrap().contains(&device.id) {
            return Err(TelemetryError::Network("connection refused".to_string()));
        }

        let readings = self
            .readings
            .lock()
            .unwrap()
            .get(&device.id)
            .map(|m| m.iter().map(|(kind, value)| Reading { kind: *kind, value: *value }).collect())
            .unwrap_or_default();
        Ok(readings)
    }

    async fn fetch_ports(&self, device: &Device) -> Result<Vec<PortReading>, TelemetryError> {
        if self.failing.lock().unwrap().contains(&device.id) {
            return Err(TelemetryError::Network("connection refused".to_string()));
        }
        Ok(self
            .ports
            .lock()
            .unwrap()
            .get(&device.id)
            .cloned()
            .unwrap_or_default())
    }
}

/// An engine wired to an in-memory store, a manual clock and a fake client.
pub struct Fixture {
    pub store: Arc<Store>,
    pub client: Arc<FakeClient>,
    pub clock: Arc<ManualClock>,
    pub sink: Arc<RecordingSink>,
    pub ledger: Arc<DedupLedger>,
    pub poller: Arc<DevicePoller>,
}

impl Fixture {
    pub fn new(client: FakeClient) -> Self {
        Self::with_timeout(client, Duration::from_secs(8))
    }

    pub fn with_timeout(client: FakeClient, timeout: Duration) -> Self {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let client = Arc::new(client);
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap(),
        ));
        let sink = Arc::new(RecordingSink::default());
        let ledger = Arc::new(DedupLedger::load(store.clone(), sink.clone()).unwrap());
        let poller = Arc::new(DevicePoller::new(
            store.clone(),
            client.clone(),
            store.clone(),
            ledger.clone(),
            clock.clone(),
            timeout,
        ));

        Self {
            store,
            client,
            clock,
            sink,
            ledger,
            poller,
        }
    }

    pub fn add_device(&self, name: &str) -> i64 {
        let mut device = Device {
            name: name.to_string(),
            address: format!("{}.lab", name),
            ..Default::default()
        };
        self.store.add_device(&mut device).unwrap()
    }

    pub fn device(&self, id: i64) -> Device {
        self.store.get_device(id).unwrap().unwrap()
    }

    pub fn watchdog(&self, max_age: chrono::Duration) -> Arc<StalenessWatchdog> {
        Arc::new(StalenessWatchdog::new(
            self.store.clone(),
            self.ledger.clone(),
            self.clock.clone(),
            max_age,
        ))
    }

    pub fn scheduler(&self, batch_size: usize) -> FleetScheduler {
        FleetScheduler::new(
            self.store.clone(),
            self.poller.clone(),
            self.watchdog(chrono::Duration::minutes(10)),
            batch_size,
        )
    }
}
