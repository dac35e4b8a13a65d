//! Connection establishment and outbound writes
//!
//! Establishment is all-or-nothing: open link, enumerate services, pick the data
//! characteristic, subscribe, then try for a larger MTU. If any required step
//! fails the link is closed again and the attempt fails as a unit.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::mpsc::Receiver;
use uuid::Uuid;

use crate::bluetooth::radio::{Link, Radio};
use crate::bluetooth::types::{
    GattCharacteristic, GattService, PeripheralIdentity, DEFAULT_MTU, STANDARD_SERVICES,
};
use crate::error::{LinkError, Result};
use crate::logging::PerformanceLogger;

/// ATT header bytes taken out of every write
const ATT_OVERHEAD: u16 = 3;

/// Knobs for an establishment attempt
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Service carrying the data characteristic; guessed when absent
    pub data_service: Option<Uuid>,
    pub preferred_mtu: u16,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            data_service: None,
            preferred_mtu: 247,
        }
    }
}

/// Result of a successful establishment
pub struct Established {
    pub link: Arc<dyn Link>,
    pub characteristic: GattCharacteristic,
    pub mtu: u16,
    pub notifications: Receiver<Vec<u8>>,
}

impl std::fmt::Debug for Established {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Established")
            .field("peripheral", self.link.identity())
            .field("characteristic", &self.characteristic.uuid)
            .field("mtu", &self.mtu)
            .finish()
    }
}

/// Run the establishment sequence against `peripheral`
pub async fn establish(
    radio: &dyn Radio,
    peripheral: &PeripheralIdentity,
    options: &SessionOptions,
) -> Result<Established> {
    let perf = PerformanceLogger::new("Session", "establish");

    info!("Opening link to {}", peripheral);
    let link: Arc<dyn Link> = Arc::from(radio.connect(peripheral).await?);

    match prepare(link.as_ref(), options).await {
        Ok((characteristic, notifications, mtu)) => {
            perf.finish_with_context(&peripheral.id);
            Ok(Established {
                link,
                characteristic,
                mtu,
                notifications,
            })
        }
        Err(e) => {
            warn!("Establishment with {} failed: {}", peripheral.id, e);
            if let Err(close_err) = link.disconnect().await {
                debug!("Closing half-open link to {} failed: {}", peripheral.id, close_err);
            }
            Err(e)
        }
    }
}

async fn prepare(
    link: &dyn Link,
    options: &SessionOptions,
) -> Result<(GattCharacteristic, Receiver<Vec<u8>>, u16)> {
    let services = link.discover_services().await.map_err(|e| match e {
        LinkError::ServiceDiscoveryFailure(_) => e,
        other => LinkError::ServiceDiscoveryFailure(other.to_string()),
    })?;
    debug!("{} exposes {} services", link.identity().id, services.len());

    let characteristic = select_data_characteristic(&services, options.data_service)?;
    info!(
        "Using characteristic {} on service {}",
        characteristic.uuid, characteristic.service_uuid
    );

    let notifications = link.subscribe(&characteristic).await.map_err(|e| match e {
        LinkError::LinkFailure(_) => e,
        other => LinkError::LinkFailure(format!("subscribe failed: {}", other)),
    })?;

    let mtu = negotiate_mtu(link, options.preferred_mtu).await;
    Ok((characteristic, notifications, mtu))
}

/// Best-effort MTU negotiation; any failure keeps the default
async fn negotiate_mtu(link: &dyn Link, preferred: u16) -> u16 {
    if preferred <= DEFAULT_MTU {
        return DEFAULT_MTU;
    }
    match link.request_mtu(preferred).await {
        Ok(mtu) if mtu >= DEFAULT_MTU => {
            debug!("Negotiated MTU {}", mtu);
            mtu.min(preferred)
        }
        Ok(mtu) => {
            warn!("Peripheral offered MTU {} below the minimum, keeping {}", mtu, DEFAULT_MTU);
            DEFAULT_MTU
        }
        Err(e) => {
            debug!("MTU negotiation unavailable ({}), keeping {}", e, DEFAULT_MTU);
            DEFAULT_MTU
        }
    }
}

/// Pick the characteristic used for data exchange
///
/// With a configured data service only that service is considered. Otherwise
/// every non-standard service is, in discovery order. A characteristic that
/// can both be written and subscribed to wins over one that is only writable.
pub fn select_data_characteristic(
    services: &[GattService],
    data_service: Option<Uuid>,
) -> Result<GattCharacteristic> {
    if services.is_empty() {
        return Err(LinkError::ServiceDiscoveryFailure(
            "peripheral exposes no services".to_string(),
        ));
    }

    let candidates: Vec<&GattService> = match data_service {
        Some(uuid) => {
            let service = services.iter().find(|s| s.uuid == uuid).ok_or_else(|| {
                LinkError::ServiceDiscoveryFailure(format!("data service {} not found", uuid))
            })?;
            vec![service]
        }
        None => services
            .iter()
            .filter(|s| !STANDARD_SERVICES.contains(&s.uuid))
            .collect(),
    };

    let writable = || {
        candidates
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .filter(|c| c.properties.is_writable())
    };

    writable()
        .find(|c| c.properties.can_subscribe())
        .or_else(|| writable().next())
        .cloned()
        .ok_or(LinkError::NoWritableCharacteristic)
}

/// Largest payload that fits one write at this MTU
pub fn chunk_size(mtu: u16) -> usize {
    usize::from(mtu.saturating_sub(ATT_OVERHEAD).max(1))
}

/// Write `text` to the data characteristic, split to fit the MTU
pub async fn write_text(
    link: &dyn Link,
    characteristic: &GattCharacteristic,
    mtu: u16,
    text: &str,
) -> Result<()> {
    let with_response = characteristic.properties.write;
    for chunk in text.as_bytes().chunks(chunk_size(mtu)) {
        link.write(characteristic, chunk, with_response).await?;
    }
    debug!("Wrote {} bytes to {}", text.len(), link.identity().id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::types::{sig_uuid, CharProps};

    const DATA_SERVICE: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e_24dc_ca9e);

    fn ch(service: Uuid, n: u128, properties: CharProps) -> GattCharacteristic {
        GattCharacteristic {
            uuid: Uuid::from_u128(n),
            service_uuid: service,
            properties,
        }
    }

    fn write_only() -> CharProps {
        CharProps { write: true, ..CharProps::default() }
    }

    fn write_notify() -> CharProps {
        CharProps { write_without_response: true, notify: true, ..CharProps::default() }
    }

    #[test]
    fn test_prefers_write_and_notify() {
        let services = vec![
            GattService {
                uuid: sig_uuid(0x180F),
                characteristics: vec![ch(sig_uuid(0x180F), 1, write_notify())],
            },
            GattService {
                uuid: DATA_SERVICE,
                characteristics: vec![
                    ch(DATA_SERVICE, 2, write_only()),
                    ch(DATA_SERVICE, 3, write_notify()),
                ],
            },
        ];

        let selected = select_data_characteristic(&services, None).unwrap();
        assert_eq!(selected.uuid, Uuid::from_u128(3));
    }

    #[test]
    fn test_falls_back_to_first_writable() {
        let services = vec![GattService {
            uuid: DATA_SERVICE,
            characteristics: vec![
                ch(DATA_SERVICE, 1, CharProps { read: true, ..CharProps::default() }),
                ch(DATA_SERVICE, 2, write_only()),
            ],
        }];
        let selected = select_data_characteristic(&services, Some(DATA_SERVICE)).unwrap();
        assert_eq!(selected.uuid, Uuid::from_u128(2));
    }

    #[test]
    fn test_selection_errors() {
        assert!(matches!(
            select_data_characteristic(&[], None),
            Err(LinkError::ServiceDiscoveryFailure(_))
        ));

        let read_only = vec![GattService {
            uuid: DATA_SERVICE,
            characteristics: vec![ch(DATA_SERVICE, 1, CharProps { read: true, notify: true, ..CharProps::default() })],
        }];
        assert_eq!(
            select_data_characteristic(&read_only, None),
            Err(LinkError::NoWritableCharacteristic)
        );
        assert!(matches!(
            select_data_characteristic(&read_only, Some(Uuid::from_u128(9))),
            Err(LinkError::ServiceDiscoveryFailure(_))
        ));
    }

    #[test]
    fn test_chunk_size() {
        assert_eq!(chunk_size(DEFAULT_MTU), 20);
        assert_eq!(chunk_size(247), 244);
        assert_eq!(chunk_size(0), 1);
    }
}
