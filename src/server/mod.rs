//! HTTP and WebSocket surface
//!
//! - `GET /ws`: relay socket
//! - `POST /api/device/:device`: start or stop a local device
//! - `GET /api/status`, `GET /api/permissions`, `GET /health`

mod routes;
mod ws;

pub use routes::StatusReport;

use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use crate::bridge::{BridgeStatusHandle, BridgeTap, VirtualBridge};
use crate::config::RelayConfig;
use crate::device::{DeviceDriver, DeviceManager};
use crate::errors::{RelayError, RelayResult};
use crate::permissions::PermissionGate;
use crate::relay::{Forwarders, Registry, RelayHub};

/// Shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<RelayHub>,
    pub bridge: Option<BridgeStatusHandle>,
    pub outbound_queue: usize,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            name: crate::NAME,
            version: crate::VERSION,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            driver: self.hub.devices.driver_name().to_string(),
            devices: self.hub.devices.snapshot(),
            connections: self.hub.registry.connections(),
            stats: self.hub.registry.stats(),
            bridge: self.bridge.as_ref().map(BridgeStatusHandle::snapshot),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/api/device/:device", post(routes::device_command))
        .route("/api/status", get(routes::status))
        .route("/api/permissions", get(routes::permissions))
        .route("/health", get(routes::health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// The assembled relay: hub, device manager, background threads and router.
pub struct RelayServer {
    config: RelayConfig,
    state: AppState,
    forwarders: Option<Forwarders>,
    bridge: Option<Arc<Mutex<VirtualBridge>>>,
    bridge_tap: Option<BridgeTap>,
}

impl RelayServer {
    /// Build with the permission file named by the config (or the per-user
    /// default).
    pub fn new(config: RelayConfig, driver: Arc<dyn DeviceDriver>) -> RelayResult<Self> {
        let gate = Arc::new(PermissionGate::open(config.permissions.file.as_deref()));
        Self::with_gate(config, driver, gate)
    }

    pub fn with_gate(
        config: RelayConfig,
        driver: Arc<dyn DeviceDriver>,
        gate: Arc<PermissionGate>,
    ) -> RelayResult<Self> {
        config.validate()?;

        let devices = Arc::new(DeviceManager::new(driver, config.device_manager_config()));
        let registry = Arc::new(Registry::new(config.network.max_connections));
        let hub = Arc::new(RelayHub::new(registry.clone(), gate, devices.clone()));
        let forwarders = Forwarders::start(registry.clone(), devices, config.bridge.tap_capacity)?;

        let (bridge, bridge_tap) = if config.bridge.enabled {
            let bridge = Arc::new(Mutex::new(VirtualBridge::from_config(&config.bridge)));
            let tap = BridgeTap::spawn(&registry, bridge.clone(), config.bridge.tap_capacity)?;
            (Some(bridge), Some(tap))
        } else {
            log::info!("Virtual device bridge disabled");
            (None, None)
        };

        let state = AppState {
            hub,
            bridge: bridge
                .as_ref()
                .map(|b| b.lock().unwrap_or_else(PoisonError::into_inner).status_handle()),
            outbound_queue: config.network.outbound_queue,
            started_at: Utc::now(),
        };

        Ok(Self {
            config,
            state,
            forwarders: Some(forwarders),
            bridge,
            bridge_tap,
        })
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Bind the configured address. Failure here is fatal.
    pub async fn bind(&self) -> RelayResult<TcpListener> {
        let addr = self.config.bind_address();
        TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayError::Server(format!("Failed to bind to {}: {}", addr, e)))
    }

    /// Serve until `shutdown` resolves, then stop every device and thread.
    pub async fn run<F>(mut self, listener: TcpListener, shutdown: F) -> RelayResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local = listener
            .local_addr()
            .map_err(|e| RelayError::Server(format!("Listener has no address: {}", e)))?;
        log::info!("NodeFlow relay listening on ws://{}/ws", local);

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| RelayError::Server(format!("Server error: {}", e)));

        log::info!("Shutting down");
        self.shutdown_background();
        let devices = self.state.hub.devices.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || devices.stop_all()).await {
            log::warn!("Device shutdown task failed: {}", e);
        }
        result
    }

    fn shutdown_background(&mut self) {
        if let Some(mut forwarders) = self.forwarders.take() {
            forwarders.shutdown();
        }
        if let Some(mut tap) = self.bridge_tap.take() {
            tap.stop();
        }
        self.state.hub.registry.close_taps();
        if let Some(bridge) = &self.bridge {
            bridge.lock().unwrap_or_else(PoisonError::into_inner).close();
        }
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.shutdown_background();
    }
}
