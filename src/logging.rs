//! Structured logging for navlink
//!
//! Installs a `log` backend that writes timestamped lines to stderr and,
//! optionally, to an append-only log file. Debug output can be narrowed to the
//! radio, registry, monitor or config categories.

use chrono::Local;
use log::Level;
use log::{LevelFilter, Metadata, Record};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::{Once, RwLock};

use crate::config::LogLevel;
use crate::error::ErrorContext;

/// Timestamp format for log entries
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Global initialization guard
static INIT_LOGGER: Once = Once::new();

/// Debug flag categories for selective logging
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugFlags {
    pub radio: bool,    // Scanning, links, GATT enumeration, connection manager
    pub registry: bool, // Known-device persistence
    pub monitor: bool,  // Background sweeps and health checks
    pub config: bool,   // Configuration loading, saving, validation
    pub all: bool,      // Enable all debug output
}

/// Global debug flags storage
static DEBUG_FLAGS: RwLock<DebugFlags> = RwLock::new(DebugFlags {
    radio: false,
    registry: false,
    monitor: false,
    config: false,
    all: true,
});

/// Logger backend
pub struct NavlinkLogger {
    /// File output for logs
    file: Option<Mutex<File>>,
    /// Log level filter
    level: LevelFilter,
    /// Whether to output to stderr
    console_output: bool,
}

impl log::Log for NavlinkLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if metadata.level() > self.level {
            return false;
        }

        if metadata.level() == Level::Debug {
            return should_log_debug(metadata.target());
        }

        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = Local::now().format(TIMESTAMP_FORMAT);

        let level_str = match record.level() {
            Level::Error => "\x1B[31mERROR\x1B[0m",
            Level::Warn => "\x1B[33mWARN \x1B[0m",
            Level::Info => "\x1B[32mINFO \x1B[0m",
            Level::Debug => "\x1B[36mDEBUG\x1B[0m",
            Level::Trace => "\x1B[90mTRACE\x1B[0m",
        };

        let module = record.module_path().unwrap_or("<unknown>");

        if self.console_output {
            let console_entry = format!("[{}] {} [{}] {}\n", timestamp, level_str, module, record.args());
            let _ = io::stderr().write_all(console_entry.as_bytes());
        }

        if let Some(file) = &self.file {
            let file_entry = format!(
                "[{}] {} [{}] [{}:{}] {}\n",
                timestamp,
                record.level(),
                module,
                record.file().unwrap_or("<unknown>"),
                record.line().unwrap_or(0),
                record.args()
            );
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(file_entry.as_bytes());
                let _ = file.flush();
            }
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
    }
}

/// Configure logging with the specified level and optionally a log file
pub fn configure_logging(
    level: LogLevel,
    log_file: Option<PathBuf>,
    console_output: bool,
) -> Result<(), String> {
    let mut result = Ok(());

    INIT_LOGGER.call_once(|| {
        let level_filter = LevelFilter::from(level);

        let file = if let Some(path) = log_file.clone() {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    if let Err(e) = std::fs::create_dir_all(parent) {
                        result = Err(format!("Failed to create log directory: {}", e));
                        return;
                    }
                }
            }

            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => Some(Mutex::new(file)),
                Err(e) => {
                    result = Err(format!("Failed to open log file: {}", e));
                    return;
                }
            }
        } else {
            None
        };

        let logger = Box::new(NavlinkLogger {
            file,
            level: level_filter,
            console_output,
        });

        if let Err(e) = log::set_boxed_logger(logger) {
            result = Err(format!("Failed to set logger: {}", e));
            return;
        }

        log::set_max_level(level_filter);

        log::info!("Logging initialized at level: {}", level_filter);
        if let Some(path) = log_file {
            log::info!("Log file: {}", path.display());
        }
    });

    result
}

/// Install the logger with console output at info level, falling back to env_logger
pub fn init_logger() {
    if let Err(e) = configure_logging(LogLevel::Info, None, true) {
        eprintln!("Falling back to env_logger: {}", e);
        let _ = env_logger::builder().filter_level(LevelFilter::Info).try_init();
    }
}

/// Set global debug flags for selective logging
pub fn set_debug_flags(flags: DebugFlags) {
    if let Ok(mut debug_flags) = DEBUG_FLAGS.write() {
        *debug_flags = flags;
    }
}

/// Check if a debug category should log based on the module path and global flags
pub fn should_log_debug(module_path: &str) -> bool {
    if let Ok(flags) = DEBUG_FLAGS.read() {
        if flags.all {
            return true;
        }

        if module_path.contains("::registry") {
            return flags.registry;
        }
        if module_path.contains("::monitor") {
            return flags.monitor;
        }
        if module_path.contains("::bluetooth") || module_path.contains("::permissions") {
            return flags.radio;
        }
        if module_path.contains("::config") {
            return flags.config;
        }
    }
    false
}

/// Log an error with context
pub fn log_error<E: Debug>(error: &E, context: &ErrorContext) {
    log::error!("{}Error: {:?}", context, error);
}

/// Helper for timing slow radio operations
pub struct PerformanceLogger {
    /// Operation being timed
    operation: String,
    /// Component performing the operation
    component: String,
    /// Start time
    start_time: std::time::Instant,
}

impl PerformanceLogger {
    /// Create a new performance logger
    pub fn new<S: Into<String>>(component: S, operation: S) -> Self {
        Self {
            component: component.into(),
            operation: operation.into(),
            start_time: std::time::Instant::now(),
        }
    }

    /// Finish timing and log result
    pub fn finish(self) {
        log::debug!(
            "[{}::{}] Operation completed in {:?}",
            self.component,
            self.operation,
            self.start_time.elapsed()
        );
    }

    /// Finish timing with additional context
    pub fn finish_with_context(self, context: &str) {
        log::debug!(
            "[{}::{}] Operation '{}' completed in {:?}",
            self.component,
            self.operation,
            context,
            self.start_time.elapsed()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_category_routing() {
        set_debug_flags(DebugFlags { monitor: true, ..DebugFlags::default() });

        assert!(should_log_debug("navlink::monitor"));
        assert!(!should_log_debug("navlink::registry"));
        assert!(!should_log_debug("navlink::bluetooth::manager"));

        set_debug_flags(DebugFlags { all: true, ..DebugFlags::default() });
        assert!(should_log_debug("navlink::registry"));
    }

    #[test]
    fn test_performance_logger() {
        let _ = configure_logging(LogLevel::Debug, None, false);

        let perf = PerformanceLogger::new("Test", "performance_logging");
        std::thread::sleep(std::time::Duration::from_millis(5));
        perf.finish_with_context("with extra info");
    }
}
