//! Error types for navlink
//!
//! Every radio, registry and permission failure is folded into [`LinkError`]
//! before it reaches a caller. The connection manager converts these into state
//! transitions and events, so none of them escape as unhandled faults.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

/// Failures surfaced by the connection core
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// A required radio or location permission was refused
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    /// The platform radio is off or missing
    #[error("Bluetooth radio unavailable: {0}")]
    RadioUnavailable(String),

    /// A scan ran to its ceiling without a connection being made
    #[error("Scan timed out")]
    ScanTimeout,

    /// The link could not be opened or dropped while being set up
    #[error("Link failure: {0}")]
    LinkFailure(String),

    /// Service or characteristic enumeration failed
    #[error("Service discovery failed: {0}")]
    ServiceDiscoveryFailure(String),

    /// The data service exposes no characteristic that accepts writes
    #[error("No writable characteristic on the data service")]
    NoWritableCharacteristic,

    /// The peripheral is held by another central
    #[error("Peripheral is already connected elsewhere")]
    AlreadyConnectedElsewhere,

    /// The device registry could not be read or written
    #[error("Device registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// The operation needs a connected session
    #[error("No peripheral connected")]
    NotConnected,

    /// The connection manager task is no longer running
    #[error("Connection manager stopped")]
    ManagerStopped,
}

/// Result type alias
pub type Result<T> = std::result::Result<T, LinkError>;

impl LinkError {
    /// Whether the user can retry the operation that produced this error
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::ManagerStopped)
    }

    /// Short machine-readable reason, used as event details
    pub fn reason(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission denied",
            Self::RadioUnavailable(_) => "radio unavailable",
            Self::ScanTimeout => "scan timeout",
            Self::LinkFailure(_) => "link failure",
            Self::ServiceDiscoveryFailure(_) => "service discovery failure",
            Self::NoWritableCharacteristic => "no writable characteristic",
            Self::AlreadyConnectedElsewhere => "already connected elsewhere",
            Self::RegistryUnavailable(_) => "registry unavailable",
            Self::NotConnected => "not connected",
            Self::ManagerStopped => "manager stopped",
        }
    }

    /// Get a user-friendly message for this error
    pub fn user_message(&self) -> String {
        match self {
            Self::PermissionDenied =>
                "Bluetooth permission was denied. Grant access in system settings and try again.".into(),
            Self::RadioUnavailable(_) =>
                "Bluetooth is turned off or not available. Turn it on and try again.".into(),
            Self::ScanTimeout =>
                "No supported device was found nearby.".into(),
            Self::LinkFailure(_) | Self::ServiceDiscoveryFailure(_) | Self::NoWritableCharacteristic =>
                "Could not connect to the device. Make sure it is switched on and nearby, then try again.".into(),
            Self::AlreadyConnectedElsewhere =>
                "The device is connected to another phone or computer. Disconnect it there first.".into(),
            Self::RegistryUnavailable(_) =>
                "Saved devices could not be loaded. Known devices will not reconnect automatically.".into(),
            Self::NotConnected =>
                "No device is connected.".into(),
            Self::ManagerStopped =>
                "The Bluetooth service stopped. Restart the application.".into(),
        }
    }
}

impl From<btleplug::Error> for LinkError {
    fn from(error: btleplug::Error) -> Self {
        match error {
            btleplug::Error::PermissionDenied => Self::PermissionDenied,
            btleplug::Error::DeviceNotFound => Self::LinkFailure("device not found".to_string()),
            btleplug::Error::NotConnected => Self::LinkFailure("not connected".to_string()),
            btleplug::Error::TimedOut(d) => Self::LinkFailure(format!("timed out after {:?}", d)),
            other => Self::LinkFailure(other.to_string()),
        }
    }
}

/// Where an error or log line originated
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// Component name
    pub component: String,
    /// Operation being performed
    pub operation: String,
    /// Extra key/value detail
    pub metadata: HashMap<String, String>,
}

impl ErrorContext {
    /// Create a new context
    pub fn new(component: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            operation: operation.into(),
            metadata: HashMap::new(),
        }
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}::{}", self.component, self.operation)?;
        let mut keys: Vec<_> = self.metadata.keys().collect();
        keys.sort();
        for key in keys {
            write!(f, " {}={}", key, self.metadata[key])?;
        }
        write!(f, "] ")
    }
}
