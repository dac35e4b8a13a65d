//! Radio seam
//!
//! The connection manager and the background monitor only talk to hardware
//! through these traits. [`crate::bluetooth::BtleplugRadio`] is the real
//! backend; tests substitute a scripted radio.

use async_trait::async_trait;
use tokio::sync::mpsc::Receiver;

use crate::bluetooth::types::{Advertisement, GattCharacteristic, GattService, PeripheralIdentity};
use crate::error::Result;

/// The central's radio
#[async_trait]
pub trait Radio: Send + Sync {
    /// Start scanning; advertisements arrive on the returned channel until
    /// `stop_scan` is called or the receiver is dropped
    async fn scan(&self) -> Result<Receiver<Advertisement>>;

    /// Stop any scan in progress
    async fn stop_scan(&self) -> Result<()>;

    /// Open a link to a peripheral seen in a scan
    async fn connect(&self, peripheral: &PeripheralIdentity) -> Result<Box<dyn Link>>;
}

/// An open link to one peripheral
#[async_trait]
pub trait Link: Send + Sync {
    fn identity(&self) -> &PeripheralIdentity;

    /// Enumerate services and their characteristics
    async fn discover_services(&self) -> Result<Vec<GattService>>;

    /// Subscribe to value changes; the channel closes when the link drops
    async fn subscribe(&self, characteristic: &GattCharacteristic) -> Result<Receiver<Vec<u8>>>;

    /// Write one value
    async fn write(&self, characteristic: &GattCharacteristic, data: &[u8], with_response: bool) -> Result<()>;

    /// Ask for a larger MTU; returns the negotiated value
    async fn request_mtu(&self, mtu: u16) -> Result<u16>;

    /// Ask the radio whether the link is still up
    async fn is_connected(&self) -> Result<bool>;

    async fn disconnect(&self) -> Result<()>;
}
