//! BLE discovery, connection and streaming

mod adapter;
pub mod events;
pub mod filter;
pub mod manager;
mod peripheral;
pub mod radio;
pub mod session;
pub mod state;
pub mod stream;
pub mod types;

pub use adapter::{normalize_peripheral_id, BtleplugRadio};
pub use peripheral::BtleplugLink;

pub use events::{
    receiver_to_stream, ConnectionEvent, EventBroker, EventEmitter, EventFilter, EventStatus,
    LogEmitter, SubscriberId,
};
pub use filter::{ModelFilter, ScanFilter};
pub use manager::{ConnectionHandle, ConnectionManager, ManagerParts};
pub use radio::{Link, Radio};
pub use stream::{decode_payload, InboundMessage, MessageLog};
pub use types::{
    Advertisement, CharProps, ConnectionSnapshot, ConnectionState, DiscoveryCandidate,
    GattCharacteristic, GattService, PeripheralIdentity, DEFAULT_MTU,
};
