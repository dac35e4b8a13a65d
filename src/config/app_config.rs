use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{ConfigError, LogLevel};
use crate::logging::DebugFlags;

/// Advertised-name prefixes of the supported hardware models
pub const DEFAULT_SUPPORTED_MODELS: &[&str] = &["NavBand", "NavBand Pro", "WayCue"];

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Radio and connection settings
    pub bluetooth: BluetoothConfig,

    /// Background monitor settings
    pub monitor: MonitorConfig,

    /// Device registry settings
    pub registry: RegistryConfig,

    /// Log level
    pub log_level: LogLevel,

    /// Optional log file
    pub log_file: Option<PathBuf>,

    /// Debug categories to show; every category when absent
    pub debug_flags: Option<DebugFlags>,

    /// Where this configuration is saved
    #[serde(skip)]
    pub settings_path: PathBuf,
}

/// Radio and connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Allow-list of advertised names
    pub supported_models: Vec<String>,

    /// Service used for data exchange; picked automatically when absent
    pub data_service_uuid: Option<Uuid>,

    /// Hard ceiling on a foreground scan
    pub scan_timeout_ms: u64,

    /// MTU requested after subscribing
    pub preferred_mtu: u16,

    /// Ceiling on a single liveness query
    pub health_query_timeout_ms: u64,

    /// Whether scanning is gated behind location permission
    pub requires_location_permission: bool,
}

/// Background monitor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Period of the discovery sweep
    pub sweep_interval_ms: u64,

    /// Length of each sweep scan
    pub sweep_scan_ms: u64,

    /// Period of the health check
    pub health_interval_ms: u64,

    /// Arm the monitor automatically when the app is backgrounded
    pub auto_start_in_background: bool,
}

/// Device registry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Path of the registry file
    pub path: PathBuf,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            supported_models: DEFAULT_SUPPORTED_MODELS.iter().map(|m| m.to_string()).collect(),
            data_service_uuid: None,
            scan_timeout_ms: 30_000,
            preferred_mtu: 247,
            health_query_timeout_ms: 3_000,
            requires_location_permission: false,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 30_000,
            sweep_scan_ms: 8_000,
            health_interval_ms: 5_000,
            auto_start_in_background: true,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { path: default_registry_path() }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bluetooth: BluetoothConfig::default(),
            monitor: MonitorConfig::default(),
            registry: RegistryConfig::default(),
            log_level: LogLevel::Info,
            log_file: None,
            debug_flags: None,
            settings_path: default_settings_path(),
        }
    }
}

impl BluetoothConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn health_query_timeout(&self) -> Duration {
        Duration::from_millis(self.health_query_timeout_ms)
    }
}

impl MonitorConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn sweep_scan(&self) -> Duration {
        Duration::from_millis(self.sweep_scan_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }
}

impl AppConfig {
    /// Load configuration from the default settings path
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&default_settings_path())
    }

    /// Load configuration from a file, falling back to defaults when it does not exist
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::info!("No settings at {}, using defaults", path.display());
            return Ok(Self { settings_path: path.to_path_buf(), ..Self::default() });
        }

        let raw = fs::read_to_string(path)?;
        let mut config: AppConfig = serde_json::from_str(&raw)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.settings_path = path.to_path_buf();
        config.validate()?;

        log::debug!("Loaded settings from {}", path.display());
        Ok(config)
    }

    /// Save configuration to its settings path
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&self.settings_path)
    }

    /// Save configuration to a file, replacing it atomically
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;

        log::debug!("Saved settings to {}", path.display());
        Ok(())
    }

    /// Check the settings are usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bt = &self.bluetooth;
        let monitor = &self.monitor;

        if bt.supported_models.iter().all(|m| m.trim().is_empty()) {
            return Err(ConfigError::Validation("supported_models must not be empty".into()));
        }
        if bt.scan_timeout_ms == 0 || bt.health_query_timeout_ms == 0 {
            return Err(ConfigError::Validation("bluetooth timeouts must be positive".into()));
        }
        if bt.preferred_mtu < 23 {
            return Err(ConfigError::Validation(format!(
                "preferred_mtu {} is below the BLE minimum of 23", bt.preferred_mtu
            )));
        }
        if monitor.sweep_interval_ms == 0 || monitor.sweep_scan_ms == 0 || monitor.health_interval_ms == 0 {
            return Err(ConfigError::Validation("monitor intervals must be positive".into()));
        }
        if monitor.sweep_scan_ms >= bt.scan_timeout_ms {
            return Err(ConfigError::Validation(
                "sweep_scan_ms must be shorter than the foreground scan_timeout_ms".into(),
            ));
        }
        if monitor.health_interval_ms >= monitor.sweep_interval_ms {
            return Err(ConfigError::Validation(
                "health_interval_ms must be shorter than sweep_interval_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Get the default settings path
pub fn default_settings_path() -> PathBuf {
    dirs_next::config_dir()
        .map(|config_dir| config_dir.join("navlink").join("settings.json"))
        .unwrap_or_else(|| PathBuf::from("settings.json"))
}

/// Get the default registry path
pub fn default_registry_path() -> PathBuf {
    dirs_next::data_dir()
        .map(|data_dir| data_dir.join("navlink").join("devices.json"))
        .unwrap_or_else(|| PathBuf::from("devices.json"))
}
