//! btleplug radio backend
//!
//! Uses the first adapter the platform reports. Peripherals seen while scanning
//! are cached by identity so a later `connect` can find them again.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{BDAddr, Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use tokio::sync::mpsc::{channel, Receiver};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::bluetooth::peripheral::BtleplugLink;
use crate::bluetooth::radio::{Link, Radio};
use crate::bluetooth::types::{Advertisement, PeripheralIdentity};
use crate::error::{ErrorContext, LinkError, Result};

const ADVERTISEMENT_BUFFER: usize = 64;
const ADAPTER_ATTEMPTS: u32 = 3;

lazy_static! {
    static ref MAC_ADDRESS: Option<Regex> = Regex::new(r"^(?i)[0-9a-f]{2}(:[0-9a-f]{2}){5}$").ok();
}

/// Canonical form of a user-supplied peripheral id
///
/// MAC addresses are upper-cased to match what the backend reports; platform
/// ids are left alone.
pub fn normalize_peripheral_id(input: &str) -> String {
    let trimmed = input.trim();
    if MAC_ADDRESS.as_ref().is_some_and(|re| re.is_match(trimmed)) {
        trimmed.to_uppercase()
    } else {
        trimmed.to_string()
    }
}

/// Stable id of a btleplug peripheral: its MAC, or the platform id where the
/// MAC is hidden
pub(crate) fn peripheral_key(peripheral: &Peripheral) -> String {
    let address = peripheral.address();
    if address == BDAddr::default() {
        format!("{:?}", peripheral.id())
    } else {
        address.to_string()
    }
}

/// Shared bookkeeping between the radio and the links it opened
#[derive(Default)]
pub(crate) struct RadioState {
    pub(crate) peripherals: HashMap<String, Peripheral>,
    pub(crate) open_links: HashSet<String>,
}

/// [`Radio`] backed by btleplug
pub struct BtleplugRadio {
    adapter: Adapter,
    state: Arc<Mutex<RadioState>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugRadio {
    /// Open the first available adapter, retrying briefly while the platform
    /// stack comes up
    pub async fn new() -> Result<Self> {
        let ctx = ErrorContext::new("BtleplugRadio", "new");
        let mut last_error = LinkError::RadioUnavailable("no Bluetooth adapter found".to_string());

        for attempt in 1..=ADAPTER_ATTEMPTS {
            match Self::first_adapter().await {
                Ok(adapter) => {
                    match adapter.adapter_info().await {
                        Ok(description) => info!("{}Using adapter {}", ctx, description),
                        Err(_) => info!("{}Using default adapter", ctx),
                    }
                    return Ok(Self {
                        adapter,
                        state: Arc::new(Mutex::new(RadioState::default())),
                        scan_task: Mutex::new(None),
                    });
                }
                Err(e) => {
                    warn!("{}Adapter not ready (attempt {}/{}): {}", ctx, attempt, ADAPTER_ATTEMPTS, e);
                    last_error = e;
                    if attempt < ADAPTER_ATTEMPTS {
                        sleep(Duration::from_millis(100 * 5_u64.pow(attempt))).await;
                    }
                }
            }
        }
        Err(last_error)
    }

    async fn first_adapter() -> Result<Adapter> {
        let manager = Manager::new()
            .await
            .map_err(|e| LinkError::RadioUnavailable(e.to_string()))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| LinkError::RadioUnavailable(e.to_string()))?;
        adapters
            .into_iter()
            .next()
            .ok_or_else(|| LinkError::RadioUnavailable("no Bluetooth adapter found".to_string()))
    }

    fn abort_scan_task(&self) {
        if let Ok(mut slot) = self.scan_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }

    async fn lookup(&self, id: &str) -> Result<Peripheral> {
        let cached = self
            .state
            .lock()
            .ok()
            .and_then(|state| state.peripherals.get(id).cloned());
        if let Some(peripheral) = cached {
            return Ok(peripheral);
        }

        // Not seen in a scan by this process; the platform may still know it
        for peripheral in self.adapter.peripherals().await? {
            if peripheral_key(&peripheral) == id {
                return Ok(peripheral);
            }
        }
        Err(LinkError::LinkFailure(format!("peripheral {} has not been discovered", id)))
    }
}

#[async_trait]
impl Radio for BtleplugRadio {
    async fn scan(&self) -> Result<Receiver<Advertisement>> {
        self.abort_scan_task();

        let mut events = self.adapter.events().await?;
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| match LinkError::from(e) {
                LinkError::PermissionDenied => LinkError::PermissionDenied,
                other => LinkError::RadioUnavailable(other.to_string()),
            })?;
        debug!("Radio scan started");

        let (tx, rx) = channel(ADVERTISEMENT_BUFFER);
        let adapter = self.adapter.clone();
        let state = Arc::clone(&self.state);
        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = tx.closed() => break,
                    event = events.next() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let properties = match peripheral.properties().await {
                    Ok(Some(properties)) => properties,
                    Ok(None) => continue,
                    Err(e) => {
                        debug!("No properties for {:?}: {}", id, e);
                        continue;
                    }
                };

                let key = peripheral_key(&peripheral);
                let advertisement = Advertisement {
                    peripheral: PeripheralIdentity::new(key.clone(), properties.local_name),
                    rssi: properties.rssi,
                };
                if let Ok(mut state) = state.lock() {
                    state.peripherals.insert(key, peripheral);
                }
                if tx.send(advertisement).await.is_err() {
                    break;
                }
            }
            debug!("Advertisement forwarding ended");
        });

        if let Ok(mut slot) = self.scan_task.lock() {
            *slot = Some(task);
        }
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<()> {
        self.abort_scan_task();
        self.adapter.stop_scan().await?;
        debug!("Radio scan stopped");
        Ok(())
    }

    async fn connect(&self, target: &PeripheralIdentity) -> Result<Box<dyn Link>> {
        let peripheral = self.lookup(&target.id).await?;

        let owned = self
            .state
            .lock()
            .map(|state| state.open_links.contains(&target.id))
            .unwrap_or(false);
        if !owned && peripheral.is_connected().await? {
            return Err(LinkError::AlreadyConnectedElsewhere);
        }

        if !owned {
            peripheral.connect().await?;
        }
        if let Ok(mut state) = self.state.lock() {
            state.open_links.insert(target.id.clone());
        }

        let events = self.adapter.events().await?;
        Ok(Box::new(BtleplugLink::new(
            target.clone(),
            peripheral,
            events,
            Arc::clone(&self.state),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_mac_addresses() {
        assert_eq!(normalize_peripheral_id(" aa:bb:cc:00:11:22 "), "AA:BB:CC:00:11:22");
        assert_eq!(normalize_peripheral_id("AA:01"), "AA:01");
        assert_eq!(
            normalize_peripheral_id("PeripheralId(4f2a)"),
            "PeripheralId(4f2a)"
        );
    }
}
