//! Configuration System using Figment
//!
//! Strongly-typed configuration for the engine. Values are layered from:
//! 1. Built-in defaults (`EngineConfig::default()`)
//! 2. `config/pinscan.toml` (or an explicit path)
//! 3. Environment variables prefixed with `PINSCAN_`
//!
//! # Example
//! ```no_run
//! use pinscan::config::EngineConfig;
//!
//! let config = EngineConfig::load()?;
//! println!("Plugin timeout: {:?}", config.scan.plugin_timeout());
//! # Ok::<(), figment::Error>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::EngineError;

/// Default location of the configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/pinscan.toml";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Discovery scan tuning
    pub scan: ScanConfig,
    /// Periodic poller tuning
    pub poller: PollerConfig,
    /// Hardware access gate tuning
    pub gate: GateConfig,
    /// Plugin discovery
    pub plugins: PluginsConfig,
    /// Hardware backend selection
    pub hardware: HardwareConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "pinscan".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Scan coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Upper bound for one plugin `detect` call, in milliseconds
    pub plugin_timeout_ms: u64,
    /// Pause before each GPIO pin is probed, in milliseconds
    pub pin_delay_ms: u64,
    /// Pause between I2C address probes, in milliseconds
    pub i2c_delay_ms: u64,
    /// Optional bound for a whole scan session, in milliseconds (0 = none)
    pub scan_deadline_ms: u64,
    /// First BCM pin of a full GPIO scan
    pub gpio_first: u8,
    /// Last BCM pin of a full GPIO scan (inclusive)
    pub gpio_last: u8,
    /// First I2C address probed
    pub i2c_first: u8,
    /// Last I2C address probed (inclusive)
    pub i2c_last: u8,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            plugin_timeout_ms: 500,
            pin_delay_ms: 100,
            i2c_delay_ms: 50,
            scan_deadline_ms: 0,
            gpio_first: 2,
            gpio_last: 27,
            i2c_first: 0x03,
            i2c_last: 0x77,
        }
    }
}

impl ScanConfig {
    /// Per-plugin timeout as a `Duration`
    pub fn plugin_timeout(&self) -> Duration {
        Duration::from_millis(self.plugin_timeout_ms)
    }

    /// Inter-pin delay as a `Duration`
    pub fn pin_delay(&self) -> Duration {
        Duration::from_millis(self.pin_delay_ms)
    }

    /// Inter-address delay as a `Duration`
    pub fn i2c_delay(&self) -> Duration {
        Duration::from_millis(self.i2c_delay_ms)
    }

    /// Whole-scan deadline, if configured
    pub fn scan_deadline(&self) -> Option<Duration> {
        (self.scan_deadline_ms > 0).then(|| Duration::from_millis(self.scan_deadline_ms))
    }
}

/// Periodic poller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Tick interval in milliseconds
    pub interval_ms: u64,
    /// Upper bound for one plugin `read` call, in milliseconds
    pub read_timeout_ms: u64,
    /// Refresh GPIO mode/level columns after each tick
    pub refresh_levels: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            read_timeout_ms: 500,
            refresh_levels: true,
        }
    }
}

impl PollerConfig {
    /// Tick interval as a `Duration`
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Read timeout as a `Duration`
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Hardware gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Waiting longer than this for a lease is treated as a stalled gate
    pub stall_timeout_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            stall_timeout_ms: 30_000,
        }
    }
}

impl GateConfig {
    /// Stall bound as a `Duration`
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

/// Plugin discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Manifest directories, highest priority first
    pub search_paths: Vec<PathBuf>,
    /// Kernel 1-Wire device tree used by the DS18B20 driver
    pub w1_devices_dir: PathBuf,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            search_paths: vec![PathBuf::from("plugins")],
            w1_devices_dir: PathBuf::from("/sys/bus/w1/devices"),
        }
    }
}

/// Hardware backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-memory simulated bus
    Mock,
    /// Linux `/sys/class/gpio` interface (no I2C)
    Sysfs,
}

/// Hardware configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Which backend to drive
    pub backend: BackendKind,
    /// Root of the sysfs GPIO tree
    pub sysfs_root: PathBuf,
    /// Addresses the mock I2C bus acknowledges
    pub mock_i2c_acks: Vec<u8>,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Mock,
            sysfs_root: PathBuf::from("/sys/class/gpio"),
            mock_i2c_acks: vec![0x76],
        }
    }
}

impl EngineConfig {
    /// Load configuration from `config/pinscan.toml` and environment variables
    ///
    /// Environment variables can override configuration with prefix PINSCAN_
    /// Example: PINSCAN_SCAN__PLUGIN_TIMEOUT_MS=250
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PINSCAN_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), EngineError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(EngineError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.scan.plugin_timeout_ms == 0 {
            return Err(EngineError::Configuration(
                "scan.plugin_timeout_ms must be greater than 0".into(),
            ));
        }

        if self.scan.gpio_first > self.scan.gpio_last || self.scan.gpio_last > 27 {
            return Err(EngineError::Configuration(format!(
                "Invalid GPIO scan range {}..={}. Must lie within 0..=27",
                self.scan.gpio_first, self.scan.gpio_last
            )));
        }

        if self.scan.i2c_first > self.scan.i2c_last || self.scan.i2c_last > 0x7F {
            return Err(EngineError::Configuration(format!(
                "Invalid I2C address range 0x{:02X}..=0x{:02X}",
                self.scan.i2c_first, self.scan.i2c_last
            )));
        }

        if self.poller.interval_ms == 0 || self.poller.read_timeout_ms == 0 {
            return Err(EngineError::Configuration(
                "poller.interval_ms and poller.read_timeout_ms must be greater than 0".into(),
            ));
        }

        if self.gate.stall_timeout_ms <= self.scan.plugin_timeout_ms {
            return Err(EngineError::Configuration(format!(
                "gate.stall_timeout_ms ({}) must exceed scan.plugin_timeout_ms ({})",
                self.gate.stall_timeout_ms, self.scan.plugin_timeout_ms
            )));
        }

        Ok(())
    }
}
