//! DHT22 temperature/humidity sensor
//!
//! The single-wire protocol is decoded by the hardware backend
//! (`HardwareAccess::read_dht22`); this driver only checks plausibility and
//! formats the reading.

use anyhow::Result;
use async_trait::async_trait;

use crate::hardware::DhtSample;
use crate::plugin::{Color, Detection, PluginContext, SensorPlugin};

const HUMIDITY_RANGE: std::ops::RangeInclusive<f32> = 0.0..=100.0;
const TEMPERATURE_RANGE: std::ops::RangeInclusive<f32> = -40.0..=80.0;

/// DHT22 / AM2302 driver
pub struct Dht22 {
    name: String,
}

impl Dht22 {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn plausible(sample: &DhtSample) -> bool {
        HUMIDITY_RANGE.contains(&sample.humidity_pct)
            && TEMPERATURE_RANGE.contains(&sample.temperature_c)
    }

    async fn sample(&self, pin: u8, ctx: &PluginContext) -> Result<Option<Detection>> {
        let sample = {
            let _lease = ctx.lease().await?;
            ctx.hardware().read_dht22(pin).await?
        };

        Ok(sample.filter(Self::plausible).map(|s| {
            Detection::new(
                &self.name,
                format!("{:.1}°C / {:.1}%", s.temperature_c, s.humidity_pct),
                Color::Green,
            )
        }))
    }
}

#[async_trait]
impl SensorPlugin for Dht22 {
    fn name(&self) -> &str {
        &self.name
    }

    async fn detect(&self, pin: u8, ctx: &PluginContext) -> Result<Option<Detection>> {
        self.sample(pin, ctx).await
    }

    async fn read(&self, pin: u8, ctx: &PluginContext) -> Result<Option<Detection>> {
        self.sample(pin, ctx).await
    }
}
