//! Scripted radio and helpers shared by the integration tests
//!
//! The mock radio replays a configurable set of advertisements on every scan
//! and hands out links whose liveness and notifications the test controls.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mockall::mock;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use uuid::Uuid;

use navlink::bluetooth::{
    Advertisement, CharProps, ConnectionEvent, ConnectionHandle, ConnectionManager, EventEmitter,
    EventStatus, GattCharacteristic, GattService, Link, ManagerParts, PeripheralIdentity, Radio,
};
use navlink::config::AppConfig;
use navlink::error::{LinkError, Result};
use navlink::permissions::{PermissionGate, PermissionProvider};
use navlink::registry::DeviceRegistry;

pub const DATA_SERVICE: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e_24dc_ca9e);
pub const DATA_CHAR: Uuid = Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e_24dc_ca9e);

mock! {
    pub Permissions {}

    #[async_trait]
    impl PermissionProvider for Permissions {
        async fn request_scan_permission(&self) -> bool;
        async fn request_connect_permission(&self) -> bool;
        async fn request_location_permission(&self) -> bool;
    }
}

/// Provider that answers every prompt the same way
pub fn permissions(granted: bool) -> MockPermissions {
    let mut provider = MockPermissions::new();
    provider.expect_request_scan_permission().returning(move || granted);
    provider.expect_request_connect_permission().returning(move || granted);
    provider.expect_request_location_permission().returning(move || granted);
    provider
}

/// Provider whose scan prompt gives `answers` in order, then keeps granting
pub fn permissions_answering(answers: Vec<bool>) -> MockPermissions {
    let mut answers = answers.into_iter();
    let mut provider = MockPermissions::new();
    provider
        .expect_request_scan_permission()
        .returning(move || answers.next().unwrap_or(true));
    provider.expect_request_connect_permission().returning(|| true);
    provider.expect_request_location_permission().returning(|| true);
    provider
}

/// How a link answers liveness queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
    Fails,
    Hangs,
}

/// Test-side controls for one peripheral's link
pub struct LinkControl {
    liveness: Mutex<Liveness>,
    notifications: Mutex<Option<Sender<Vec<u8>>>>,
    writes: Mutex<Vec<(Vec<u8>, bool)>>,
    disconnects: AtomicUsize,
}

impl LinkControl {
    fn new() -> Self {
        Self {
            liveness: Mutex::new(Liveness::Alive),
            notifications: Mutex::new(None),
            writes: Mutex::new(Vec::new()),
            disconnects: AtomicUsize::new(0),
        }
    }

    pub fn set_liveness(&self, liveness: Liveness) {
        *self.liveness.lock().unwrap() = liveness;
    }

    /// Deliver a notification value; false if nobody is subscribed
    pub async fn notify(&self, value: &[u8]) -> bool {
        let sender = self.notifications.lock().unwrap().clone();
        match sender {
            Some(sender) => sender.send(value.to_vec()).await.is_ok(),
            None => false,
        }
    }

    /// Simulate the radio dropping the link
    pub fn drop_link(&self) {
        self.notifications.lock().unwrap().take();
        self.set_liveness(Liveness::Dead);
    }

    pub fn writes(&self) -> Vec<(Vec<u8>, bool)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

/// How a peripheral behaves when connected to
#[derive(Clone)]
pub struct PeripheralScript {
    pub services: Vec<GattService>,
    pub connect_error: Option<LinkError>,
    pub discovery_error: Option<LinkError>,
    pub mtu: std::result::Result<u16, LinkError>,
    /// Never finish opening the link
    pub hang_on_connect: bool,
}

impl PeripheralScript {
    /// A peripheral exposing one write+notify data characteristic
    pub fn data_device() -> Self {
        Self {
            services: vec![GattService {
                uuid: DATA_SERVICE,
                characteristics: vec![GattCharacteristic {
                    uuid: DATA_CHAR,
                    service_uuid: DATA_SERVICE,
                    properties: CharProps {
                        write: true,
                        notify: true,
                        ..CharProps::default()
                    },
                }],
            }],
            connect_error: None,
            discovery_error: None,
            mtu: Ok(185),
            hang_on_connect: false,
        }
    }
}

struct PeripheralEntry {
    script: PeripheralScript,
    control: Arc<LinkControl>,
}

#[derive(Default)]
struct RadioInner {
    advertisements: Vec<Advertisement>,
    scan_error: Option<LinkError>,
    active_scan: Option<Sender<Advertisement>>,
    peripherals: HashMap<String, PeripheralEntry>,
    scans: usize,
    stops: usize,
    connects: Vec<String>,
}

/// Scripted [`Radio`]
#[derive(Default)]
pub struct MockRadio {
    inner: Mutex<RadioInner>,
}

impl MockRadio {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Advertise `id` on every scan from now on
    pub fn advertise(&self, id: &str, name: &str) {
        let advertisement = Advertisement::new(id, Some(name));
        let mut inner = self.inner.lock().unwrap();
        if let Some(scan) = &inner.active_scan {
            let _ = scan.try_send(advertisement.clone());
        }
        inner.advertisements.push(advertisement);
    }

    /// Stop advertising `id`
    pub fn go_silent(&self, id: &str) {
        self.inner
            .lock()
            .unwrap()
            .advertisements
            .retain(|a| a.peripheral.id != id);
    }

    /// Register a connectable peripheral and return its link controls
    pub fn add_peripheral(&self, id: &str, script: PeripheralScript) -> Arc<LinkControl> {
        let control = Arc::new(LinkControl::new());
        self.inner.lock().unwrap().peripherals.insert(
            id.to_string(),
            PeripheralEntry {
                script,
                control: Arc::clone(&control),
            },
        );
        control
    }

    pub fn fail_scans(&self, error: LinkError) {
        self.inner.lock().unwrap().scan_error = Some(error);
    }

    pub fn scan_count(&self) -> usize {
        self.inner.lock().unwrap().scans
    }

    pub fn stop_count(&self) -> usize {
        self.inner.lock().unwrap().stops
    }

    pub fn connects(&self) -> Vec<String> {
        self.inner.lock().unwrap().connects.clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.lock().unwrap().active_scan.is_some()
    }
}

#[async_trait]
impl Radio for MockRadio {
    async fn scan(&self) -> Result<Receiver<Advertisement>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(error) = inner.scan_error.clone() {
            return Err(error);
        }
        inner.scans += 1;
        let (tx, rx) = channel(64);
        for advertisement in &inner.advertisements {
            let _ = tx.try_send(advertisement.clone());
        }
        inner.active_scan = Some(tx);
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.stops += 1;
        inner.active_scan = None;
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralIdentity) -> Result<Box<dyn Link>> {
        let (script, control) = {
            let mut inner = self.inner.lock().unwrap();
            inner.connects.push(peripheral.id.clone());
            match inner.peripherals.get(&peripheral.id) {
                Some(entry) => (entry.script.clone(), Arc::clone(&entry.control)),
                None => return Err(LinkError::LinkFailure("device not found".into())),
            }
        };
        if script.hang_on_connect {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if let Some(error) = script.connect_error {
            return Err(error);
        }
        control.set_liveness(Liveness::Alive);
        Ok(Box::new(MockLink {
            identity: peripheral.clone(),
            script,
            control,
        }))
    }
}

struct MockLink {
    identity: PeripheralIdentity,
    script: PeripheralScript,
    control: Arc<LinkControl>,
}

#[async_trait]
impl Link for MockLink {
    fn identity(&self) -> &PeripheralIdentity {
        &self.identity
    }

    async fn discover_services(&self) -> Result<Vec<GattService>> {
        match &self.script.discovery_error {
            Some(error) => Err(error.clone()),
            None => Ok(self.script.services.clone()),
        }
    }

    async fn subscribe(&self, _characteristic: &GattCharacteristic) -> Result<Receiver<Vec<u8>>> {
        let (tx, rx) = channel(16);
        *self.control.notifications.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn write(&self, _characteristic: &GattCharacteristic, data: &[u8], with_response: bool) -> Result<()> {
        self.control.writes.lock().unwrap().push((data.to_vec(), with_response));
        Ok(())
    }

    async fn request_mtu(&self, _mtu: u16) -> Result<u16> {
        self.script.mtu.clone()
    }

    async fn is_connected(&self) -> Result<bool> {
        let liveness = *self.control.liveness.lock().unwrap();
        match liveness {
            Liveness::Alive => Ok(true),
            Liveness::Dead => Ok(false),
            Liveness::Fails => Err(LinkError::LinkFailure("liveness query failed".into())),
            Liveness::Hangs => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(true)
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.control.disconnects.fetch_add(1, Ordering::SeqCst);
        self.control.notifications.lock().unwrap().take();
        Ok(())
    }
}

/// Emitter that keeps every event
#[derive(Default)]
pub struct RecordingEmitter {
    events: Mutex<Vec<ConnectionEvent>>,
}

impl RecordingEmitter {
    pub fn events(&self) -> Vec<ConnectionEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<EventStatus> {
        self.events().into_iter().map(|e| e.status).collect()
    }

    pub fn count(&self, status: EventStatus) -> usize {
        self.statuses().into_iter().filter(|s| *s == status).count()
    }
}

impl EventEmitter for RecordingEmitter {
    fn emit(&self, event: ConnectionEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Configuration with timings short enough for tests
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.bluetooth.scan_timeout_ms = 400;
    config.bluetooth.health_query_timeout_ms = 100;
    config.monitor.sweep_interval_ms = 200;
    config.monitor.sweep_scan_ms = 60;
    config.monitor.health_interval_ms = 50;
    config
}

/// A running manager on a mock radio
pub struct Harness {
    pub config: AppConfig,
    pub radio: Arc<MockRadio>,
    pub registry: Arc<DeviceRegistry>,
    pub events: Arc<RecordingEmitter>,
    pub connection: ConnectionHandle,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_parts(test_config(), Arc::new(DeviceRegistry::in_memory()), true)
    }

    pub fn with_parts(config: AppConfig, registry: Arc<DeviceRegistry>, granted: bool) -> Self {
        Self::with_provider(config, registry, permissions(granted))
    }

    pub fn with_provider(config: AppConfig, registry: Arc<DeviceRegistry>, provider: MockPermissions) -> Self {
        let radio = MockRadio::new();
        let events = Arc::new(RecordingEmitter::default());
        let connection = ConnectionManager::spawn(
            config.bluetooth.clone(),
            ManagerParts {
                radio: radio.clone(),
                registry: Arc::clone(&registry),
                permissions: Arc::new(PermissionGate::new(Box::new(provider), false)),
                emitter: events.clone(),
            },
        );
        Self {
            config,
            radio,
            registry,
            events,
            connection,
        }
    }
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
