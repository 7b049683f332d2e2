//! Plugin manifest schema
//!
//! A manifest is a small YAML file naming a built-in driver and the metadata
//! the engine needs to schedule it:
//!
//! ```yaml
//! name: TM1637
//! driver: tm1637
//! bus_type: GPIO
//! pin_roles: [CLK, DIO]
//! auto_detectable: false
//! ```
//!
//! Only `name` and `driver` are required.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;

use crate::error::ValidationError;
use crate::plugin::builtin::BuiltinDriver;

/// Generic tag used for assigning a pin to "some I2C device"
pub const I2C_TARGET: &str = "I2C";

/// Bus a plugin's sensor is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(from = "String")]
pub enum BusType {
    #[default]
    Gpio,
    I2c,
    Spi,
    Unknown,
}

impl From<String> for BusType {
    fn from(value: String) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "GPIO" => BusType::Gpio,
            "I2C" => BusType::I2c,
            "SPI" => BusType::Spi,
            _ => BusType::Unknown,
        }
    }
}

impl std::fmt::Display for BusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BusType::Gpio => "GPIO",
            BusType::I2c => "I2C",
            BusType::Spi => "SPI",
            BusType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Driver-specific knobs
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriverOptions {
    /// Fixed data pin (DS18B20 1-Wire, default BCM 4)
    pub data_pin: Option<u8>,
    /// I2C addresses to probe (BMP280, default 0x76 and 0x77)
    pub addresses: Option<Vec<u8>>,
    /// Override of the kernel 1-Wire device directory
    pub w1_devices_dir: Option<PathBuf>,
    /// Settle delay between the two samples of a digital sensor
    pub settle_ms: Option<u64>,
}

/// On-disk plugin manifest
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginManifest {
    pub name: String,
    pub driver: String,
    #[serde(default)]
    pub bus_type: BusType,
    #[serde(default)]
    pub pin_roles: Vec<String>,
    #[serde(default)]
    pub auto_detectable: bool,
    #[serde(default)]
    pub options: DriverOptions,
}

/// Immutable plugin metadata shared by the registry, coordinator and poller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDescriptor {
    /// Unique display identifier
    pub name: String,
    pub bus_type: BusType,
    /// Ordered role names; empty for single-pin sensors
    pub pin_roles: Vec<String>,
    /// Whether discovery scans may try this plugin
    pub auto_detectable: bool,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bus_type: BusType::Gpio,
            pin_roles: Vec::new(),
            auto_detectable: false,
        }
    }

    pub fn auto_detectable(mut self, enabled: bool) -> Self {
        self.auto_detectable = enabled;
        self
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pin_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_bus_type(mut self, bus_type: BusType) -> Self {
        self.bus_type = bus_type;
        self
    }

    /// More than one role: must be read with `read_with_roles`
    pub fn is_multi_role(&self) -> bool {
        self.pin_roles.len() > 1
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.pin_roles.iter().any(|r| r == role)
    }
}

impl From<&PluginManifest> for PluginDescriptor {
    fn from(manifest: &PluginManifest) -> Self {
        Self {
            name: manifest.name.trim().to_string(),
            bus_type: manifest.bus_type,
            pin_roles: manifest.pin_roles.clone(),
            auto_detectable: manifest.auto_detectable,
        }
    }
}

/// Validates a manifest before its driver is instantiated.
///
/// Checks:
/// 1. `name` is non-empty, has no `:` and is not the reserved `I2C` tag
/// 2. `driver` names a built-in driver
/// 3. role names are non-empty, unique and free of `:`
/// 4. the driver's own requirements (required roles, detectability)
pub fn validate_manifest(manifest: &PluginManifest) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let name = manifest.name.trim();

    if name.is_empty() {
        errors.push(ValidationError {
            path: "name".to_string(),
            message: "Plugin name cannot be empty".to_string(),
        });
    } else if name.contains(':') {
        errors.push(ValidationError {
            path: "name".to_string(),
            message: "Plugin name cannot contain ':'".to_string(),
        });
    } else if name.eq_ignore_ascii_case(I2C_TARGET) {
        errors.push(ValidationError {
            path: "name".to_string(),
            message: format!("'{}' is reserved for generic I2C devices", I2C_TARGET),
        });
    }

    let mut seen = HashSet::new();
    for (i, role) in manifest.pin_roles.iter().enumerate() {
        if role.trim().is_empty() || role.contains(':') {
            errors.push(ValidationError {
                path: format!("pin_roles[{}]", i),
                message: "Role names must be non-empty and cannot contain ':'".to_string(),
            });
        } else if !seen.insert(role.as_str()) {
            errors.push(ValidationError {
                path: format!("pin_roles[{}]", i),
                message: format!("Duplicate role '{}'", role),
            });
        }
    }

    match manifest.driver.parse::<BuiltinDriver>() {
        Ok(driver) => errors.extend(driver.validate(manifest)),
        Err(_) => errors.push(ValidationError {
            path: "driver".to_string(),
            message: format!(
                "Unknown driver '{}'. Must be one of: {}",
                manifest.driver,
                BuiltinDriver::ALL
                    .iter()
                    .map(|d| d.id())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }),
    }

    errors
}
