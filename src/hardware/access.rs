//! Hardware Access Capability
//!
//! The engine never calls a GPIO or I2C driver directly. Every physical
//! operation goes through the `HardwareAccess` trait, which keeps the scan
//! coordinator, the poller and the plugins testable against `MockBus`.
//!
//! # Contract
//!
//! - All methods are async and take `&self`; backends use interior mutability.
//! - Callers hold a gate `Lease` for the duration of each call.
//! - Errors use `anyhow::Result`, like the plugin capability traits.
//! - A backend without an I2C bus reports `i2c_available() == false`; probing
//!   it anyway returns an error.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Logic level of a GPIO line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    /// Line reads 0
    Low,
    /// Line reads 1
    High,
}

impl Level {
    /// True for `Level::High`
    pub fn is_high(self) -> bool {
        matches!(self, Level::High)
    }
}

impl From<bool> for Level {
    fn from(value: bool) -> Self {
        if value {
            Level::High
        } else {
            Level::Low
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Level::Low => write!(f, "LOW"),
            Level::High => write!(f, "HIGH"),
        }
    }
}

/// Direction a pin is configured for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Pin samples the line
    Input,
    /// Pin drives the line
    Output,
}

/// Internal pull resistor setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pull {
    /// No pull resistor
    #[default]
    Off,
    /// Pull towards 3V3
    Up,
    /// Pull towards ground
    Down,
}

/// Function currently selected on a pin, as reported by the SoC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinFunction {
    /// GPIO input
    Input,
    /// GPIO output
    Output,
    /// Alternate function (I2C, UART, SPI, PWM ...)
    Alt(u8),
}

impl std::fmt::Display for PinFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PinFunction::Input => write!(f, "INPUT"),
            PinFunction::Output => write!(f, "OUTPUT"),
            PinFunction::Alt(n) => write!(f, "ALT{}", n),
        }
    }
}

/// One decoded DHT22 sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DhtSample {
    /// Temperature in degrees Celsius
    pub temperature_c: f32,
    /// Relative humidity in percent
    pub humidity_pct: f32,
}

/// Capability: physical GPIO and I2C access
#[async_trait]
pub trait HardwareAccess: Send + Sync {
    /// Short backend name for logs and banners
    fn backend_name(&self) -> &'static str;

    /// Configure direction and pull resistor of a BCM pin
    async fn setup_pin(&self, pin: u8, direction: Direction, pull: Pull) -> Result<()>;

    /// Sample the level of a BCM pin
    async fn read_level(&self, pin: u8) -> Result<Level>;

    /// Drive an output pin
    async fn write_level(&self, pin: u8, level: Level) -> Result<()>;

    /// Report the function currently selected on a BCM pin
    async fn pin_function(&self, pin: u8) -> Result<PinFunction>;

    /// Whether an I2C bus is present
    fn i2c_available(&self) -> bool;

    /// Zero-length quick write to `address`; `Ok(true)` if the device acknowledged
    async fn i2c_probe(&self, address: u8) -> Result<bool>;

    /// Read one DHT22 sample from a data pin
    ///
    /// # Default Implementation
    /// Returns an error: decoding the DHT22 single-wire protocol requires a
    /// backend with microsecond timing.
    async fn read_dht22(&self, pin: u8) -> Result<Option<DhtSample>> {
        anyhow::bail!("DHT22 timing not supported by {} backend (BCM {})", self.backend_name(), pin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_conversions() {
        assert_eq!(Level::from(true), Level::High);
        assert_eq!(Level::from(false), Level::Low);
        assert!(Level::High.is_high());
        assert_eq!(Level::Low.to_string(), "LOW");
    }

    #[test]
    fn pin_function_display() {
        assert_eq!(PinFunction::Input.to_string(), "INPUT");
        assert_eq!(PinFunction::Alt(0).to_string(), "ALT0");
    }
}
