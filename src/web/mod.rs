//! Admin web server module.

mod handlers;

pub use handlers::*;

use crate::config::EngineConfig;
use crate::db::Store;
use crate::scheduler::FleetScheduler;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: EngineConfig,
    pub store: Arc<Store>,
    pub scheduler: Arc<FleetScheduler>,
}

/// Admin server exposing the engine's control operations.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(config: EngineConfig, store: Arc<Store>, scheduler: Arc<FleetScheduler>) -> Self {
        Self {
            state: AppState {
                config,
                store,
                scheduler,
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/api/status", get(handlers::handle_status))
            .route("/api/devices", get(handlers::handle_get_devices))
            .route("/api/devices", post(handlers::handle_create_device))
            .route("/api/devices/{id}/maintenance", put(handlers::handle_set_maintenance))
            .route("/api/devices/{id}/ports", get(handlers::handle_get_ports))
            .route("/api/devices/{id}/units", get(handlers::handle_get_units))
            .route("/api/devices/{id}/samples", get(handlers::handle_get_samples))
            .route("/api/alarms", get(handlers::handle_get_alarms))
            // Control
            .route("/api/poll/{class}", post(handlers::handle_poll_now))
            .route("/api/health-check", post(handlers::handle_health_check))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(DefaultBodyLimit::max(64 * 1024))
            .with_state(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Admin server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}
