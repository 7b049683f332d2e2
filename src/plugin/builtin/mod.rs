//! Built-in sensor drivers
//!
//! Manifests pick one of these by id. The set is closed: adding a sensor
//! family means adding a variant here.

pub mod bmp280;
pub mod dht22;
pub mod digital;
pub mod ds18b20;
pub mod tm1637;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ValidationError;
use crate::hardware::board;
use crate::plugin::descriptor::{DriverOptions, PluginManifest};
use crate::plugin::SensorPlugin;

pub use bmp280::Bmp280;
pub use dht22::Dht22;
pub use digital::{DigitalProfile, DigitalSensor};
pub use ds18b20::Ds18b20;
pub use tm1637::Tm1637;

/// Identifier of a built-in driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinDriver {
    Dht22,
    Ds18b20,
    Button,
    Lm393,
    PirHcSr501,
    Bmp280,
    Tm1637,
}

impl BuiltinDriver {
    /// Every driver, in documentation order
    pub const ALL: [BuiltinDriver; 7] = [
        BuiltinDriver::Dht22,
        BuiltinDriver::Ds18b20,
        BuiltinDriver::Button,
        BuiltinDriver::Lm393,
        BuiltinDriver::PirHcSr501,
        BuiltinDriver::Bmp280,
        BuiltinDriver::Tm1637,
    ];

    /// Manifest id
    pub fn id(self) -> &'static str {
        match self {
            BuiltinDriver::Dht22 => "dht22",
            BuiltinDriver::Ds18b20 => "ds18b20",
            BuiltinDriver::Button => "button",
            BuiltinDriver::Lm393 => "lm393",
            BuiltinDriver::PirHcSr501 => "pir_hcsr501",
            BuiltinDriver::Bmp280 => "bmp280",
            BuiltinDriver::Tm1637 => "tm1637",
        }
    }

    /// Driver-specific manifest checks
    pub fn validate(self, manifest: &PluginManifest) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        match self {
            BuiltinDriver::Tm1637 => {
                for role in tm1637::ROLES {
                    if !manifest.pin_roles.iter().any(|r| r == role) {
                        errors.push(ValidationError {
                            path: "pin_roles".to_string(),
                            message: format!("tm1637 requires a '{}' role", role),
                        });
                    }
                }
                if manifest.auto_detectable {
                    errors.push(ValidationError {
                        path: "auto_detectable".to_string(),
                        message: "tm1637 cannot be identified from a single pin".to_string(),
                    });
                }
            }
            BuiltinDriver::Ds18b20 => {
                if let Some(pin) = manifest.options.data_pin {
                    if !board::is_gpio(pin) {
                        errors.push(ValidationError {
                            path: "options.data_pin".to_string(),
                            message: format!("BCM {} is not a GPIO pin", pin),
                        });
                    }
                }
            }
            BuiltinDriver::Bmp280 => {
                for (i, addr) in manifest.options.addresses.iter().flatten().enumerate() {
                    if !(0x03..=0x77).contains(addr) {
                        errors.push(ValidationError {
                            path: format!("options.addresses[{}]", i),
                            message: format!("0x{:02X} is not a valid 7-bit device address", addr),
                        });
                    }
                }
            }
            _ => {}
        }
        errors
    }

    /// Build the driver for a validated manifest
    pub fn instantiate(
        self,
        name: &str,
        options: &DriverOptions,
        defaults: &DriverDefaults,
    ) -> Arc<dyn SensorPlugin> {
        let settle = options.settle_ms.map(Duration::from_millis);
        match self {
            BuiltinDriver::Dht22 => Arc::new(Dht22::new(name)),
            BuiltinDriver::Ds18b20 => {
                let dir = options
                    .w1_devices_dir
                    .clone()
                    .unwrap_or_else(|| defaults.w1_devices_dir.clone());
                Arc::new(Ds18b20::new(
                    name,
                    options.data_pin.unwrap_or(ds18b20::DEFAULT_DATA_PIN),
                    dir,
                ))
            }
            BuiltinDriver::Button => Arc::new(DigitalSensor::new(name, DigitalProfile::button(), settle)),
            BuiltinDriver::Lm393 => Arc::new(DigitalSensor::new(name, DigitalProfile::lm393(), settle)),
            BuiltinDriver::PirHcSr501 => Arc::new(DigitalSensor::new(name, DigitalProfile::pir(), settle)),
            BuiltinDriver::Bmp280 => Arc::new(Bmp280::new(
                name,
                options
                    .addresses
                    .clone()
                    .unwrap_or_else(|| bmp280::DEFAULT_ADDRESSES.to_vec()),
            )),
            BuiltinDriver::Tm1637 => Arc::new(Tm1637::new(name)),
        }
    }
}

impl FromStr for BuiltinDriver {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        BuiltinDriver::ALL
            .into_iter()
            .find(|d| d.id() == wanted)
            .ok_or_else(|| format!("unknown driver '{}'", s))
    }
}

impl std::fmt::Display for BuiltinDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Environment-wide defaults handed to drivers at instantiation
#[derive(Debug, Clone)]
pub struct DriverDefaults {
    /// Kernel 1-Wire device tree
    pub w1_devices_dir: PathBuf,
}

impl Default for DriverDefaults {
    fn default() -> Self {
        Self {
            w1_devices_dir: PathBuf::from(ds18b20::DEFAULT_W1_DIR),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip() {
        for driver in BuiltinDriver::ALL {
            assert_eq!(driver.id().parse::<BuiltinDriver>(), Ok(driver));
        }
        assert_eq!("PIR_HCSR501".parse::<BuiltinDriver>(), Ok(BuiltinDriver::PirHcSr501));
        assert!("dht11".parse::<BuiltinDriver>().is_err());
    }

    #[test]
    fn tm1637_needs_both_roles() {
        let manifest: PluginManifest =
            serde_yaml::from_str("name: TM1637\ndriver: tm1637\npin_roles: [CLK]\nauto_detectable: true\n")
                .unwrap();
        let errors = BuiltinDriver::Tm1637.validate(&manifest);
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn instantiated_driver_keeps_manifest_name() {
        let plugin = BuiltinDriver::Button.instantiate(
            "Door switch",
            &DriverOptions::default(),
            &DriverDefaults::default(),
        );
        assert_eq!(plugin.name(), "Door switch");
    }
}
