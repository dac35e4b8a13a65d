//! Registry of previously connected peripherals
//!
//! Records are created on the first successful connection and soft-deleted by
//! `forget`. All mutations are read-modify-write under one async lock, so the
//! foreground manager and the background monitor can share a registry without
//! losing updates. Storage failures surface as
//! [`LinkError::RegistryUnavailable`]; they are never turned into "not known".

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::bluetooth::PeripheralIdentity;
use crate::error::{LinkError, Result};

/// Registry entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredDevice {
    pub peripheral: PeripheralIdentity,
    pub last_connected_at: DateTime<Utc>,
    pub connection_count: u32,
    pub is_active: bool,
}

/// On-disk layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    devices: Vec<RegisteredDevice>,
}

const REGISTRY_FORMAT_VERSION: u32 = 1;

/// What `record_successful_connection` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// First connection, or first since the peripheral was forgotten
    Paired,
    /// Existing active record updated
    Reconnected,
}

/// Backing store for registry records
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Read every record
    async fn load(&self) -> std::io::Result<Vec<RegisteredDevice>>;

    /// Replace every record
    async fn save(&self, devices: &[RegisteredDevice]) -> std::io::Result<()>;
}

/// JSON file store, written through a temp file and rename
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RegistryStore for JsonFileStore {
    async fn load(&self) -> std::io::Result<Vec<RegisteredDevice>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<Vec<RegisteredDevice>> {
            if !path.exists() {
                return Ok(Vec::new());
            }
            let raw = fs::read_to_string(&path)?;
            let file: RegistryFile = serde_json::from_str(&raw)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            if file.version > REGISTRY_FORMAT_VERSION {
                warn!("Registry file version {} is newer than supported", file.version);
            }
            Ok(file.devices)
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
    }

    async fn save(&self, devices: &[RegisteredDevice]) -> std::io::Result<()> {
        let path = self.path.clone();
        let file = RegistryFile {
            version: REGISTRY_FORMAT_VERSION,
            devices: devices.to_vec(),
        };
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string_pretty(&file)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            let tmp = path.with_extension("json.tmp");
            fs::write(&tmp, json)?;
            fs::rename(&tmp, &path)
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
    }
}

/// Volatile store
#[derive(Default)]
pub struct MemoryStore {
    devices: StdMutex<Vec<RegisteredDevice>>,
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn load(&self) -> std::io::Result<Vec<RegisteredDevice>> {
        Ok(self.devices.lock().map(|d| d.clone()).unwrap_or_default())
    }

    async fn save(&self, devices: &[RegisteredDevice]) -> std::io::Result<()> {
        if let Ok(mut slot) = self.devices.lock() {
            *slot = devices.to_vec();
        }
        Ok(())
    }
}

/// Durable registry of known peripherals
pub struct DeviceRegistry {
    store: Box<dyn RegistryStore>,
    /// Records as last read from or written to the store
    cache: Mutex<Option<Vec<RegisteredDevice>>>,
}

impl DeviceRegistry {
    pub fn new(store: Box<dyn RegistryStore>) -> Self {
        Self { store, cache: Mutex::new(None) }
    }

    /// Registry backed by a JSON file
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::new(Box::new(JsonFileStore::new(path)))
    }

    /// Registry that forgets everything on exit
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStore::default()))
    }

    /// True if an active record exists for this peripheral
    pub async fn is_known(&self, peripheral: &PeripheralIdentity) -> Result<bool> {
        let mut cache = self.cache.lock().await;
        let devices = self.loaded(&mut cache).await?;
        Ok(devices.iter().any(|d| d.is_active && d.peripheral.id == peripheral.id))
    }

    /// Create or refresh the record after a completed connection sequence
    pub async fn record_successful_connection(&self, peripheral: &PeripheralIdentity) -> Result<RecordOutcome> {
        let mut cache = self.cache.lock().await;
        let mut devices = self.loaded(&mut cache).await?.clone();
        let now = Utc::now();

        let outcome = match devices.iter_mut().find(|d| d.peripheral.id == peripheral.id) {
            Some(record) => {
                let outcome = if record.is_active { RecordOutcome::Reconnected } else { RecordOutcome::Paired };
                record.connection_count = record.connection_count.saturating_add(1);
                record.last_connected_at = now;
                record.is_active = true;
                if peripheral.display_name.is_some() {
                    record.peripheral.display_name = peripheral.display_name.clone();
                }
                outcome
            }
            None => {
                devices.push(RegisteredDevice {
                    peripheral: peripheral.clone(),
                    last_connected_at: now,
                    connection_count: 1,
                    is_active: true,
                });
                RecordOutcome::Paired
            }
        };

        self.commit(&mut cache, devices).await?;
        info!("Recorded connection to {} ({:?})", peripheral, outcome);
        Ok(outcome)
    }

    /// Soft-delete the record; returns whether an active record existed
    pub async fn forget(&self, peripheral: &PeripheralIdentity) -> Result<bool> {
        let mut cache = self.cache.lock().await;
        let mut devices = self.loaded(&mut cache).await?.clone();

        let Some(record) = devices.iter_mut().find(|d| d.is_active && d.peripheral.id == peripheral.id) else {
            debug!("Forget requested for unknown peripheral {}", peripheral.id);
            return Ok(false);
        };
        record.is_active = false;

        self.commit(&mut cache, devices).await?;
        info!("Forgot {}", peripheral);
        Ok(true)
    }

    /// Identities of every active record
    pub async fn list_active(&self) -> Result<HashSet<PeripheralIdentity>> {
        let mut cache = self.cache.lock().await;
        let devices = self.loaded(&mut cache).await?;
        Ok(devices.iter().filter(|d| d.is_active).map(|d| d.peripheral.clone()).collect())
    }

    /// Look up a record, active or not
    pub async fn get(&self, id: &str) -> Result<Option<RegisteredDevice>> {
        let mut cache = self.cache.lock().await;
        let devices = self.loaded(&mut cache).await?;
        Ok(devices.iter().find(|d| d.peripheral.id == id).cloned())
    }

    /// Every active record, most recently connected first
    pub async fn list_records(&self) -> Result<Vec<RegisteredDevice>> {
        let mut cache = self.cache.lock().await;
        let mut devices: Vec<_> = self.loaded(&mut cache).await?.iter().filter(|d| d.is_active).cloned().collect();
        devices.sort_by(|a, b| b.last_connected_at.cmp(&a.last_connected_at));
        Ok(devices)
    }

    async fn loaded<'a>(&self, cache: &'a mut Option<Vec<RegisteredDevice>>) -> Result<&'a Vec<RegisteredDevice>> {
        if cache.is_none() {
            let devices = self.store.load().await.map_err(|e| {
                warn!("Failed to load device registry: {}", e);
                LinkError::RegistryUnavailable(e.to_string())
            })?;
            debug!("Loaded {} registry records", devices.len());
            *cache = Some(devices);
        }
        cache.as_ref().ok_or_else(|| LinkError::RegistryUnavailable("registry cache empty".into()))
    }

    async fn commit(&self, cache: &mut Option<Vec<RegisteredDevice>>, devices: Vec<RegisteredDevice>) -> Result<()> {
        self.store.save(&devices).await.map_err(|e| {
            warn!("Failed to save device registry: {}", e);
            LinkError::RegistryUnavailable(e.to_string())
        })?;
        *cache = Some(devices);
        Ok(())
    }
}
