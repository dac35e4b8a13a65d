//! Wires the connection core together
//!
//! One [`AppController`] owns the registry, the event broker, the connection
//! manager task and the background monitor. Only the manager task touches the radio.

use std::sync::Arc;

use log::info;

use crate::bluetooth::{
    ConnectionHandle, ConnectionManager, EventBroker, EventEmitter, ManagerParts, Radio,
};
use crate::config::AppConfig;
use crate::monitor::{AppLifecycle, BackgroundMonitor, MonitorParts};
use crate::permissions::{PermissionGate, PermissionProvider};
use crate::registry::DeviceRegistry;

/// Application-level owner of the connection core
pub struct AppController {
    connection: ConnectionHandle,
    monitor: BackgroundMonitor,
    registry: Arc<DeviceRegistry>,
    events: Arc<EventBroker>,
}

impl AppController {
    /// Build the core with the registry stored where the config says
    pub fn new(config: &AppConfig, radio: Arc<dyn Radio>, permissions: Box<dyn PermissionProvider>) -> Self {
        let registry = Arc::new(DeviceRegistry::open(config.registry.path.clone()));
        Self::with_registry(config, radio, permissions, registry)
    }

    pub fn with_registry(
        config: &AppConfig,
        radio: Arc<dyn Radio>,
        permissions: Box<dyn PermissionProvider>,
        registry: Arc<DeviceRegistry>,
    ) -> Self {
        let events = Arc::new(EventBroker::new());
        let emitter: Arc<dyn EventEmitter> = events.clone();
        let gate = Arc::new(PermissionGate::new(
            permissions,
            config.bluetooth.requires_location_permission,
        ));

        let connection = ConnectionManager::spawn(
            config.bluetooth.clone(),
            ManagerParts {
                radio,
                registry: Arc::clone(&registry),
                permissions: gate,
                emitter: Arc::clone(&emitter),
            },
        );
        let monitor = BackgroundMonitor::new(
            config.monitor.clone(),
            MonitorParts {
                registry: Arc::clone(&registry),
                connection: connection.clone(),
                emitter,
            },
        );
        info!("Connection core ready");

        Self {
            connection,
            monitor,
            registry,
            events,
        }
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn monitor(&self) -> &BackgroundMonitor {
        &self.monitor
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventBroker> {
        &self.events
    }

    /// Forward an app foreground/background transition to the monitor
    pub async fn set_app_state(&self, app: AppLifecycle) {
        self.monitor.set_app_state(app).await;
    }

    /// Stop the monitor and the manager task
    pub async fn shutdown(&self) {
        self.monitor.stop().await;
        self.connection.shutdown().await;
        info!("Connection core shut down");
    }
}
