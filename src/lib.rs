// Root module exports
pub mod app_controller;
pub mod bluetooth;
pub mod config;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod permissions;
pub mod registry;

// Re-exports for convenience
pub use app_controller::AppController;
pub use bluetooth::{
    ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionState, EventBroker,
    EventEmitter, EventFilter, EventStatus, PeripheralIdentity,
};
pub use config::AppConfig;
pub use error::{LinkError, Result};
pub use logging::init_logger;
pub use monitor::{AppLifecycle, BackgroundMonitor};
pub use permissions::{DesktopPermissions, PermissionGate, PermissionProvider};
pub use registry::DeviceRegistry;
