//! DS18B20 1-Wire temperature sensor
//!
//! Reads through the kernel `w1-gpio` overlay: every sensor appears as a
//! `28-*` directory whose `w1_slave` file holds a CRC verdict and the
//! temperature in millidegrees:
//!
//! ```text
//! 72 01 4b 46 7f ff 0e 10 57 : crc=57 YES
//! 72 01 4b 46 7f ff 0e 10 57 t=23125
//! ```
//!
//! The overlay binds one data pin, so detection only answers on that pin.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::plugin::{Color, Detection, PluginContext, RoleMap, SensorPlugin};

/// Pin the `w1-gpio` overlay uses unless told otherwise
pub const DEFAULT_DATA_PIN: u8 = 4;
/// Kernel 1-Wire device tree
pub const DEFAULT_W1_DIR: &str = "/sys/bus/w1/devices";

const FAMILY_PREFIX: &str = "28-";
const VALID_RANGE: std::ops::RangeInclusive<f32> = -55.0..=125.0;

/// DS18B20 driver
pub struct Ds18b20 {
    name: String,
    data_pin: u8,
    devices_dir: PathBuf,
}

impl Ds18b20 {
    pub fn new(name: impl Into<String>, data_pin: u8, devices_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            data_pin,
            devices_dir: devices_dir.into(),
        }
    }

    async fn first_device(&self) -> Result<Option<PathBuf>> {
        if !fs::try_exists(&self.devices_dir).await.unwrap_or(false) {
            return Ok(None);
        }
        let mut entries = fs::read_dir(&self.devices_dir)
            .await
            .with_context(|| format!("listing {}", self.devices_dir.display()))?;

        let mut devices = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let is_sensor = entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(FAMILY_PREFIX));
            if is_sensor && entry.file_type().await?.is_dir() {
                devices.push(entry.path());
            }
        }
        devices.sort();
        Ok(devices.into_iter().next())
    }

    async fn read_temperature(&self, ctx: &PluginContext) -> Result<Option<f32>> {
        let Some(device) = self.first_device().await? else {
            return Ok(None);
        };
        let text = {
            let _lease = ctx.lease().await?;
            fs::read_to_string(device.join("w1_slave"))
                .await
                .with_context(|| format!("reading {}", device.display()))?
        };
        Ok(parse_w1_slave(&text).filter(|t| VALID_RANGE.contains(t)))
    }

    async fn reading(&self, ctx: &PluginContext) -> Result<Option<Detection>> {
        Ok(self
            .read_temperature(ctx)
            .await?
            .map(|t| Detection::new(&self.name, format!("{:.1}°C", t), Color::Green)))
    }

    /// Directory this driver reads from
    pub fn devices_dir(&self) -> &Path {
        &self.devices_dir
    }
}

/// Temperature in °C from a `w1_slave` dump, if the CRC check passed
pub fn parse_w1_slave(text: &str) -> Option<f32> {
    if !text.contains("YES") {
        return None;
    }
    text.split_whitespace()
        .find_map(|part| part.strip_prefix("t="))
        .and_then(|milli| milli.parse::<i32>().ok())
        .map(|milli| milli as f32 / 1000.0)
}

#[async_trait]
impl SensorPlugin for Ds18b20 {
    fn name(&self) -> &str {
        &self.name
    }

    async fn detect(&self, pin: u8, ctx: &PluginContext) -> Result<Option<Detection>> {
        if pin != self.data_pin {
            return Ok(None);
        }
        self.reading(ctx).await
    }

    async fn read(&self, _pin: u8, ctx: &PluginContext) -> Result<Option<Detection>> {
        self.reading(ctx).await
    }

    async fn read_with_roles(&self, _roles: &RoleMap, ctx: &PluginContext) -> Result<Option<Detection>> {
        self.reading(ctx).await
    }

    async fn details(&self, phys: u8, _bcm: Option<u8>, ctx: &PluginContext) -> Result<String> {
        let header = format!("Pin {}\nSensor: {}", phys, self.name);
        match self.reading(ctx).await {
            Ok(Some(reading)) => Ok(format!("{}\n{}", header, reading.info)),
            _ => Ok(format!("{}\nReading failed or unavailable", header)),
        }
    }
}
