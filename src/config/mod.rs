//! Settings management

mod app_config;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use app_config::{
    default_registry_path, default_settings_path, AppConfig, BluetoothConfig, MonitorConfig,
    RegistryConfig, DEFAULT_SUPPORTED_MODELS,
};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Settings file could not be read or written
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings file is not valid JSON for this schema
    #[error("Parse error: {0}")]
    Parse(String),

    /// Settings are well-formed but unusable
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}
