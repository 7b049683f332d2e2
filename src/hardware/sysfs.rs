//! Linux sysfs GPIO backend
//!
//! Drives pins through the legacy `/sys/class/gpio` interface. The interface
//! has no pull resistor control and no I2C, so pulls are ignored with a debug
//! log and `i2c_available()` reports false.
//!
//! The kernel numbers sysfs GPIOs from the chip base; `base` is added to every
//! BCM pin (0 on older kernels, 512 on recent Raspberry Pi kernels).

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::hardware::access::{Direction, HardwareAccess, Level, PinFunction, Pull};

/// GPIO access through `/sys/class/gpio`
pub struct SysfsGpio {
    root: PathBuf,
    base: u32,
}

impl SysfsGpio {
    /// Backend rooted at `root` with chip base 0
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            base: 0,
        }
    }

    /// Override the GPIO chip base offset
    pub fn with_base(mut self, base: u32) -> Self {
        self.base = base;
        self
    }

    fn pin_dir(&self, pin: u8) -> PathBuf {
        self.root.join(format!("gpio{}", self.base + u32::from(pin)))
    }

    async fn export(&self, pin: u8) -> Result<PathBuf> {
        let dir = self.pin_dir(pin);
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            let number = (self.base + u32::from(pin)).to_string();
            fs::write(self.root.join("export"), number)
                .await
                .with_context(|| format!("exporting BCM {}", pin))?;
        }
        Ok(dir)
    }

    async fn read_attr(dir: &Path, attr: &str) -> Result<String> {
        let text = fs::read_to_string(dir.join(attr))
            .await
            .with_context(|| format!("reading {}", dir.join(attr).display()))?;
        Ok(text.trim().to_string())
    }
}

#[async_trait]
impl HardwareAccess for SysfsGpio {
    fn backend_name(&self) -> &'static str {
        "sysfs"
    }

    async fn setup_pin(&self, pin: u8, direction: Direction, pull: Pull) -> Result<()> {
        let dir = self.export(pin).await?;
        if pull != Pull::Off {
            debug!(pin, ?pull, "sysfs GPIO cannot set pull resistors, ignoring");
        }
        let value = match direction {
            Direction::Input => "in",
            Direction::Output => "out",
        };
        fs::write(dir.join("direction"), value)
            .await
            .with_context(|| format!("setting direction of BCM {}", pin))?;
        Ok(())
    }

    async fn read_level(&self, pin: u8) -> Result<Level> {
        let dir = self.export(pin).await?;
        match Self::read_attr(&dir, "value").await?.as_str() {
            "0" => Ok(Level::Low),
            "1" => Ok(Level::High),
            other => Err(anyhow!("unexpected value '{}' on BCM {}", other, pin)),
        }
    }

    async fn write_level(&self, pin: u8, level: Level) -> Result<()> {
        let dir = self.export(pin).await?;
        let value = if level.is_high() { "1" } else { "0" };
        fs::write(dir.join("value"), value)
            .await
            .with_context(|| format!("writing BCM {}", pin))?;
        Ok(())
    }

    async fn pin_function(&self, pin: u8) -> Result<PinFunction> {
        let dir = self.pin_dir(pin);
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            // Unexported pins are inputs after reset
            return Ok(PinFunction::Input);
        }
        match Self::read_attr(&dir, "direction").await?.as_str() {
            "out" | "high" | "low" => Ok(PinFunction::Output),
            _ => Ok(PinFunction::Input),
        }
    }

    fn i2c_available(&self) -> bool {
        false
    }

    async fn i2c_probe(&self, _address: u8) -> Result<bool> {
        Err(anyhow!("I2C bus not available on the sysfs backend"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fake_tree(pin: u32, direction: &str, value: &str) -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join(format!("gpio{}", pin));
        fs::create_dir_all(&dir).await.unwrap();
        fs::write(dir.join("direction"), direction).await.unwrap();
        fs::write(dir.join("value"), value).await.unwrap();
        root
    }

    #[tokio::test]
    async fn reads_exported_pin() {
        let root = fake_tree(17, "in\n", "1\n").await;
        let gpio = SysfsGpio::new(root.path());
        assert_eq!(gpio.read_level(17).await.unwrap(), Level::High);
        assert_eq!(gpio.pin_function(17).await.unwrap(), PinFunction::Input);
    }

    #[tokio::test]
    async fn writes_direction_and_value() {
        let root = fake_tree(5, "in", "0").await;
        let gpio = SysfsGpio::new(root.path());
        gpio.setup_pin(5, Direction::Output, Pull::Off).await.unwrap();
        gpio.write_level(5, Level::High).await.unwrap();

        assert_eq!(gpio.pin_function(5).await.unwrap(), PinFunction::Output);
        assert_eq!(gpio.read_level(5).await.unwrap(), Level::High);
    }

    #[tokio::test]
    async fn chip_base_offsets_pin_numbers() {
        let root = fake_tree(529, "in", "0").await;
        let gpio = SysfsGpio::new(root.path()).with_base(512);
        assert_eq!(gpio.read_level(17).await.unwrap(), Level::Low);
    }

    #[tokio::test]
    async fn has_no_i2c_bus() {
        let root = tempfile::tempdir().unwrap();
        let gpio = SysfsGpio::new(root.path());
        assert!(!gpio.i2c_available());
        assert!(gpio.i2c_probe(0x76).await.is_err());
    }
}
