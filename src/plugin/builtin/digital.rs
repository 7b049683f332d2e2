//! Digital-level sensors (push button, LM393 light sensor, HC-SR501 PIR)
//!
//! These modules expose a single open-collector or push-pull output. Detection
//! samples the pin twice around a settle delay and accepts a stable level; a
//! read samples once.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;

use crate::hardware::{Direction, Level, Pull};
use crate::plugin::{Color, Detection, PluginContext, RoleMap, SensorPlugin};

/// How one digital sensor family interprets its line
#[derive(Debug, Clone)]
pub struct DigitalProfile {
    pull: Pull,
    high: &'static str,
    low: &'static str,
    color: Color,
    settle: Duration,
}

impl DigitalProfile {
    /// Active-low push button on the internal pull-up
    pub fn button() -> Self {
        Self {
            pull: Pull::Up,
            high: "RELEASED",
            low: "PRESSED",
            color: Color::Magenta,
            settle: Duration::from_millis(20),
        }
    }

    /// LM393 comparator light sensor
    pub fn lm393() -> Self {
        Self {
            pull: Pull::Off,
            high: "BRIGHT",
            low: "DARK",
            color: Color::Cyan,
            settle: Duration::from_millis(20),
        }
    }

    /// HC-SR501 passive infrared motion sensor
    pub fn pir() -> Self {
        Self {
            pull: Pull::Off,
            high: "MOTION",
            low: "NO MOTION",
            color: Color::Yellow,
            settle: Duration::from_millis(50),
        }
    }

    fn label(&self, level: Level) -> &'static str {
        if level.is_high() {
            self.high
        } else {
            self.low
        }
    }
}

/// Single-line digital sensor
pub struct DigitalSensor {
    name: String,
    profile: DigitalProfile,
}

impl DigitalSensor {
    pub fn new(name: impl Into<String>, mut profile: DigitalProfile, settle: Option<Duration>) -> Self {
        if let Some(settle) = settle {
            profile.settle = settle;
        }
        Self {
            name: name.into(),
            profile,
        }
    }

    async fn sample(&self, pin: u8, ctx: &PluginContext) -> Result<Level> {
        let _lease = ctx.lease().await?;
        let hw = ctx.hardware();
        hw.setup_pin(pin, Direction::Input, self.profile.pull).await?;
        hw.read_level(pin).await
    }

    fn detection(&self, level: Level) -> Detection {
        Detection::new(&self.name, self.profile.label(level), self.profile.color)
    }
}

#[async_trait]
impl SensorPlugin for DigitalSensor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn detect(&self, pin: u8, ctx: &PluginContext) -> Result<Option<Detection>> {
        let first = self.sample(pin, ctx).await?;
        sleep(self.profile.settle).await;
        let second = {
            let _lease = ctx.lease().await?;
            ctx.hardware().read_level(pin).await?
        };

        if first == second {
            Ok(Some(self.detection(first)))
        } else {
            Ok(None)
        }
    }

    async fn read(&self, pin: u8, ctx: &PluginContext) -> Result<Option<Detection>> {
        let level = self.sample(pin, ctx).await?;
        Ok(Some(self.detection(level)))
    }

    async fn read_with_roles(&self, roles: &RoleMap, ctx: &PluginContext) -> Result<Option<Detection>> {
        match roles.get("DATA") {
            Some(pin) => self.read(pin, ctx).await,
            None => Ok(None),
        }
    }

    async fn details(&self, phys: u8, bcm: Option<u8>, ctx: &PluginContext) -> Result<String> {
        let header = format!("Pin {}\nSensor: {}", phys, self.name);
        let pin = bcm.or_else(|| ctx.role_pin(&self.name, "DATA"));
        if let Some(pin) = pin {
            if let Ok(Some(reading)) = self.read(pin, ctx).await {
                return Ok(format!("{}\nState: {}", header, reading.info));
            }
        }
        Ok(format!("{}\nState: unknown", header))
    }
}
