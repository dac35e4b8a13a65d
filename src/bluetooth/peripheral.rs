//! btleplug link to one peripheral

use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use btleplug::api::{CentralEvent, CharPropFlags, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use futures::{Stream, StreamExt};
use log::{debug, info};
use tokio::sync::mpsc::{channel, Receiver};

use crate::bluetooth::adapter::RadioState;
use crate::bluetooth::radio::Link;
use crate::bluetooth::types::{CharProps, GattCharacteristic, GattService, PeripheralIdentity};
use crate::error::{LinkError, Result};

const NOTIFICATION_BUFFER: usize = 100;

type CentralEvents = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

/// [`Link`] backed by a btleplug peripheral
pub struct BtleplugLink {
    identity: PeripheralIdentity,
    peripheral: Peripheral,
    /// Adapter events, handed to the notification task on subscribe
    events: Mutex<Option<CentralEvents>>,
    radio_state: Arc<Mutex<RadioState>>,
}

impl BtleplugLink {
    pub(crate) fn new(
        identity: PeripheralIdentity,
        peripheral: Peripheral,
        events: CentralEvents,
        radio_state: Arc<Mutex<RadioState>>,
    ) -> Self {
        Self {
            identity,
            peripheral,
            events: Mutex::new(Some(events)),
            radio_state,
        }
    }

    fn find_characteristic(&self, target: &GattCharacteristic) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == target.uuid && c.service_uuid == target.service_uuid)
            .ok_or_else(|| LinkError::LinkFailure(format!("characteristic {} not found", target.uuid)))
    }
}

fn convert_properties(flags: CharPropFlags) -> CharProps {
    CharProps {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

#[async_trait]
impl Link for BtleplugLink {
    fn identity(&self) -> &PeripheralIdentity {
        &self.identity
    }

    async fn discover_services(&self) -> Result<Vec<GattService>> {
        self.peripheral
            .discover_services()
            .await
            .map_err(|e| LinkError::ServiceDiscoveryFailure(e.to_string()))?;

        Ok(self
            .peripheral
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| GattCharacteristic {
                        uuid: c.uuid,
                        service_uuid: c.service_uuid,
                        properties: convert_properties(c.properties),
                    })
                    .collect(),
            })
            .collect())
    }

    async fn subscribe(&self, target: &GattCharacteristic) -> Result<Receiver<Vec<u8>>> {
        let characteristic = self.find_characteristic(target)?;
        debug!("Subscribing to {} on {}", characteristic.uuid, self.identity.id);
        self.peripheral.subscribe(&characteristic).await?;

        let mut notifications = self.peripheral.notifications().await?;
        let mut events = self
            .events
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or_else(|| LinkError::LinkFailure("already subscribed".to_string()))?;

        let (tx, rx) = channel(NOTIFICATION_BUFFER);
        let uuid = characteristic.uuid;
        let peripheral_id = self.peripheral.id();
        let label = self.identity.id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    notification = notifications.next() => match notification {
                        Some(n) if n.uuid == uuid => {
                            if tx.send(n.value).await.is_err() {
                                break;
                            }
                        }
                        Some(_) => {}
                        None => break,
                    },
                    event = events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => break,
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            debug!("Notification forwarding for {} ended", label);
        });

        Ok(rx)
    }

    async fn write(&self, target: &GattCharacteristic, data: &[u8], with_response: bool) -> Result<()> {
        let characteristic = self.find_characteristic(target)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral.write(&characteristic, data, write_type).await?;
        Ok(())
    }

    async fn request_mtu(&self, _mtu: u16) -> Result<u16> {
        // btleplug negotiates internally and does not expose the result
        Err(LinkError::LinkFailure("MTU negotiation is not exposed by this backend".to_string()))
    }

    async fn is_connected(&self) -> Result<bool> {
        Ok(self.peripheral.is_connected().await?)
    }

    async fn disconnect(&self) -> Result<()> {
        if let Ok(mut state) = self.radio_state.lock() {
            state.open_links.remove(&self.identity.id);
        }
        if self.peripheral.is_connected().await.unwrap_or(true) {
            self.peripheral.disconnect().await?;
            info!("Disconnected from {}", self.identity);
        }
        Ok(())
    }
}
