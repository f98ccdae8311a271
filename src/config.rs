//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, RielloError};
use crate::ups::{CommandDelays, DriverSettings, FamilySelection};
use crate::usb::chunker::inter_report_delay;
use crate::usb::{ChunkerSettings, DeviceMatcher};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub usb: UsbConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// USB device selection and transfer timing
#[derive(Debug, Deserialize, Clone)]
pub struct UsbConfig {
    #[serde(default = "default_vendor_id")]
    pub vendor_id: u16,

    #[serde(default = "default_product_id")]
    pub product_id: u16,

    #[serde(default)]
    pub serial: Option<String>,

    #[serde(default)]
    pub bus: Option<u8>,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// 1 means 400 µs, larger values are milliseconds
    #[serde(default = "default_write_delay")]
    pub write_delay: u32,

    #[serde(default = "default_read_interval_ms")]
    pub read_interval_ms: u64,

    #[serde(default = "default_max_reports")]
    pub max_reports: usize,
}

/// Protocol family selection
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProtocolConfig {
    #[serde(default)]
    pub family: FamilySelection,
}

/// Status polling
#[derive(Debug, Deserialize, Clone)]
pub struct PollConfig {
    #[serde(default = "default_interval_s")]
    pub interval_s: u64,

    #[serde(default = "default_countlost")]
    pub countlost: u32,
}

/// Instant command delays and the shutdown sequence
#[derive(Debug, Deserialize, Clone)]
pub struct ShutdownConfig {
    /// Seconds
    #[serde(default = "default_delay_shutdown")]
    pub delay_shutdown: u16,

    /// Minutes
    #[serde(default = "default_delay_reboot")]
    pub delay_reboot: u16,

    #[serde(default = "default_retries")]
    pub retries: u32,
}

/// Telemetry configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default = "default_telemetry_enabled")]
    pub enabled: bool,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_max_records_per_file")]
    pub max_records_per_file: usize,

    #[serde(default = "default_max_files_to_keep")]
    pub max_files_to_keep: usize,
}

/// Log file output
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    /// Directory for daily rolling log files; stderr only when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

// Default value functions
fn default_vendor_id() -> u16 { 0x04b4 }
fn default_product_id() -> u16 { 0x5500 }
fn default_timeout_ms() -> u64 { 1000 }
fn default_write_delay() -> u32 { 200 }
fn default_read_interval_ms() -> u64 { 10 }
fn default_max_reports() -> usize { 300 }

fn default_interval_s() -> u64 { 2 }
fn default_countlost() -> u32 { crate::ups::COUNTLOST }

fn default_delay_shutdown() -> u16 { 20 }
fn default_delay_reboot() -> u16 { 0 }
fn default_retries() -> u32 { 3 }

fn default_telemetry_enabled() -> bool { false }
fn default_log_dir() -> String { "./telemetry".to_string() }
fn default_max_records_per_file() -> usize { 10000 }
fn default_max_files_to_keep() -> usize { 10 }

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            vendor_id: default_vendor_id(),
            product_id: default_product_id(),
            serial: None,
            bus: None,
            timeout_ms: default_timeout_ms(),
            write_delay: default_write_delay(),
            read_interval_ms: default_read_interval_ms(),
            max_reports: default_max_reports(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_s: default_interval_s(),
            countlost: default_countlost(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            delay_shutdown: default_delay_shutdown(),
            delay_reboot: default_delay_reboot(),
            retries: default_retries(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: default_telemetry_enabled(),
            log_dir: default_log_dir(),
            max_records_per_file: default_max_records_per_file(),
            max_files_to_keep: default_max_files_to_keep(),
        }
    }
}

fn invalid(message: &str) -> RielloError {
    RielloError::Config(toml::de::Error::custom(message))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use riello_ups::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse and validate TOML text
    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if self.usb.timeout_ms == 0 || self.usb.timeout_ms > 60000 {
            return Err(invalid("timeout_ms must be between 1 and 60000"));
        }

        if self.usb.write_delay > 10000 {
            return Err(invalid("write_delay must be at most 10000"));
        }

        if self.usb.read_interval_ms > 1000 {
            return Err(invalid("read_interval_ms must be at most 1000"));
        }

        if self.usb.max_reports == 0 || self.usb.max_reports > 10000 {
            return Err(invalid("max_reports must be between 1 and 10000"));
        }

        if self.poll.interval_s == 0 || self.poll.interval_s > 3600 {
            return Err(invalid("poll interval_s must be between 1 and 3600"));
        }

        if self.poll.countlost == 0 {
            return Err(invalid("countlost must be greater than 0"));
        }

        if self.shutdown.retries == 0 || self.shutdown.retries > 10 {
            return Err(invalid("shutdown retries must be between 1 and 10"));
        }

        if self.telemetry.enabled && self.telemetry.log_dir.is_empty() {
            return Err(invalid("telemetry log_dir cannot be empty when enabled"));
        }

        if self.telemetry.max_records_per_file == 0 {
            return Err(invalid("max_records_per_file must be greater than 0"));
        }

        if self.telemetry.max_files_to_keep == 0 {
            return Err(invalid("max_files_to_keep must be greater than 0"));
        }

        Ok(())
    }

    /// Device filters for the USB connector
    pub fn matcher(&self) -> DeviceMatcher {
        let mut matcher = DeviceMatcher::new(self.usb.vendor_id, self.usb.product_id);
        matcher.serial = self.usb.serial.clone();
        matcher.bus = self.usb.bus;
        matcher
    }

    /// Transfer timing for the chunker
    pub fn chunker_settings(&self) -> ChunkerSettings {
        ChunkerSettings {
            timeout: Duration::from_millis(self.usb.timeout_ms),
            write_delay: inter_report_delay(self.usb.write_delay),
            read_interval: Duration::from_millis(self.usb.read_interval_ms),
            max_reports: self.usb.max_reports,
        }
    }

    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            family: self.protocol.family,
            delays: CommandDelays {
                shutdown: self.shutdown.delay_shutdown,
                reboot: self.shutdown.delay_reboot,
            },
            countlost: self.poll.countlost,
            shutdown_retries: self.shutdown.retries,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll.interval_s)
    }
}
