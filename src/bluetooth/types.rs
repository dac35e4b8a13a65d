//! Shared data structures for the bluetooth module.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default ATT MTU before any negotiation
pub const DEFAULT_MTU: u16 = 23;

/// Stable identity of a peripheral
///
/// `id` is the only correlation key across scans; the display name may be
/// missing or change between advertisements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeripheralIdentity {
    pub id: String,
    pub display_name: Option<String>,
}

impl PeripheralIdentity {
    pub fn new(id: impl Into<String>, display_name: Option<String>) -> Self {
        Self { id: id.into(), display_name }
    }

    /// Name to show the user, falling back to the id
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }
}

impl PartialEq for PeripheralIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeripheralIdentity {}

impl std::hash::Hash for PeripheralIdentity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for PeripheralIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// A single advertisement seen while scanning
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub peripheral: PeripheralIdentity,
    pub rssi: Option<i16>,
}

impl Advertisement {
    pub fn new(id: impl Into<String>, name: Option<&str>) -> Self {
        Self {
            peripheral: PeripheralIdentity::new(id, name.map(str::to_string)),
            rssi: None,
        }
    }
}

/// A peripheral surfaced by the current scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryCandidate {
    pub peripheral: PeripheralIdentity,
    pub matches_known_model: bool,
}

/// Connection state machine states
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Disconnecting,
    Failed(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Scanning => write!(f, "scanning"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnecting => write!(f, "disconnecting"),
            Self::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// Read-only view of the manager, published on every transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    /// Peripheral of the current or pending session
    pub peripheral: Option<PeripheralIdentity>,
    /// Identifies the session; bumps every time a new attempt starts
    pub session_epoch: u64,
    pub negotiated_mtu: Option<u16>,
}

impl ConnectionSnapshot {
    pub fn idle(session_epoch: u64) -> Self {
        Self {
            state: ConnectionState::Idle,
            peripheral: None,
            session_epoch,
            negotiated_mtu: None,
        }
    }

    /// The connected peripheral, if the session is connected
    pub fn connected_peripheral(&self) -> Option<&PeripheralIdentity> {
        match self.state {
            ConnectionState::Connected => self.peripheral.as_ref(),
            _ => None,
        }
    }
}

/// GATT characteristic property flags that matter here
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharProps {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharProps {
    pub fn is_writable(&self) -> bool {
        self.write || self.write_without_response
    }

    pub fn can_subscribe(&self) -> bool {
        self.notify || self.indicate
    }
}

/// An enumerated GATT characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub properties: CharProps,
}

/// An enumerated GATT service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

/// Expand a 16-bit SIG-assigned UUID
pub const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb)
}

/// Services every peripheral carries that are never the data service
pub const STANDARD_SERVICES: [Uuid; 4] = [
    sig_uuid(0x1800), // Generic Access
    sig_uuid(0x1801), // Generic Attribute
    sig_uuid(0x180A), // Device Information
    sig_uuid(0x180F), // Battery
];
