//! ponwatch - OLT/ONU telemetry polling and alarm engine.

use ponwatch::alarm::{DedupLedger, LogSink};
use ponwatch::config::{EngineConfig, TelemetryMode};
use ponwatch::db::{self, DeviceDirectory, Store};
use ponwatch::scheduler::{DevicePoller, FleetScheduler, StalenessWatchdog, SystemClock};
use ponwatch::telemetry::{HttpClient, SimulatedClient, TelemetryClient};
use ponwatch::web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("ponwatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = EngineConfig::load();
    cfg.validate()?;
    tracing::info!("Starting ponwatch on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let simulated = SimulatedClient::default();
    let telemetry: Arc<dyn TelemetryClient> = match cfg.telemetry {
        TelemetryMode::Simulated => Arc::new(simulated.clone()),
        TelemetryMode::Http => Arc::new(HttpClient::new(cfg.poll_timeout)?),
    };

    // Add a sample device if none exist
    if store.list_all()?.is_empty() && cfg.telemetry == TelemetryMode::Simulated {
        tracing::info!("Adding sample device: lab-olt-1");
        let mut device = db::Device {
            name: "lab-olt-1".to_string(),
            address: "127.0.0.1".to_string(),
            ..Default::default()
        };
        let device_id = store.add_device(&mut device)?;
        for (index, serials) in simulated.layout(device_id) {
            let port_id = store.add_port(device_id, index, simulated.units_per_port)?;
            for serial in &serials {
                store.add_unit(port_id, serial)?;
            }
        }
    }

    let clock = Arc::new(SystemClock);
    let ledger = Arc::new(DedupLedger::load(store.clone(), Arc::new(LogSink))?);
    let poller = Arc::new(DevicePoller::new(
        store.clone(),
        telemetry,
        store.clone(),
        ledger.clone(),
        clock.clone(),
        cfg.poll_timeout,
    ));
    let watchdog = Arc::new(StalenessWatchdog::new(
        store.clone(),
        ledger,
        clock,
        chrono::Duration::from_std(cfg.stale_after)?,
    ));

    // Start scheduler
    let scheduler = Arc::new(FleetScheduler::new(
        store.clone(),
        poller,
        watchdog,
        cfg.batch_size,
    ));
    scheduler.start(&cfg.intervals).await?;

    // Start web server
    let server = Server::new(cfg, store, scheduler);
    server.start().await?;

    Ok(())
}
