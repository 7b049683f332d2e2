//! TM1637 4-digit LED display
//!
//! A two-wire (CLK/DIO) output device. It cannot be identified from one pin,
//! so it is assigned manually by role. Segment encoding is not implemented:
//! a read puts both lines into the idle-high state and reports the time the
//! display would show.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Local, Timelike};
use std::sync::Mutex;

use crate::hardware::{Direction, Level, Pull};
use crate::plugin::{Color, Detection, PluginContext, RoleMap, SensorPlugin};

/// Roles the display needs
pub const ROLES: [&str; 2] = ["CLK", "DIO"];

/// TM1637 driver
pub struct Tm1637 {
    name: String,
    last_message: Mutex<Option<String>>,
}

impl Tm1637 {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            last_message: Mutex::new(None),
        }
    }

    fn last_message(&self) -> Option<String> {
        self.last_message
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    async fn show_time(&self, clk: u8, dio: u8, ctx: &PluginContext) -> Result<String> {
        {
            let _lease = ctx.lease().await?;
            let hw = ctx.hardware();
            for pin in [clk, dio] {
                hw.setup_pin(pin, Direction::Output, Pull::Off).await?;
                hw.write_level(pin, Level::High).await?;
            }
        }
        let now = Local::now();
        Ok(format!("Displayed time {:02}:{:02}", now.hour(), now.minute()))
    }
}

#[async_trait]
impl SensorPlugin for Tm1637 {
    fn name(&self) -> &str {
        &self.name
    }

    async fn detect(&self, _pin: u8, _ctx: &PluginContext) -> Result<Option<Detection>> {
        Ok(None)
    }

    async fn read(&self, _pin: u8, _ctx: &PluginContext) -> Result<Option<Detection>> {
        Ok(self
            .last_message()
            .map(|msg| Detection::new(&self.name, msg, Color::Yellow)))
    }

    async fn read_with_roles(&self, roles: &RoleMap, ctx: &PluginContext) -> Result<Option<Detection>> {
        let (Some(clk), Some(dio)) = (roles.get("CLK"), roles.get("DIO")) else {
            return Ok(None);
        };
        let message = self.show_time(clk, dio, ctx).await?;
        *self
            .last_message
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(message.clone());
        Ok(Some(Detection::new(&self.name, message, Color::Yellow)))
    }

    async fn details(&self, phys: u8, _bcm: Option<u8>, ctx: &PluginContext) -> Result<String> {
        let header = format!("Pin {}\nSensor: {}", phys, self.name);
        let clk = ctx.role_pin(&self.name, "CLK");
        let dio = ctx.role_pin(&self.name, "DIO");

        let (Some(clk), Some(dio)) = (clk, dio) else {
            return Ok(format!(
                "{header}\nThis module needs two BCM pins (CLK and DIO).\n\
                 Assign roles as '{name}:CLK' and '{name}:DIO'.",
                header = header,
                name = self.name
            ));
        };

        let roles: RoleMap = [("CLK", clk), ("DIO", dio)].into_iter().collect();
        match self.read_with_roles(&roles, ctx).await {
            Ok(res) => Ok(format!(
                "{}\nCLK={} DIO={}\n{}",
                header,
                clk,
                dio,
                res.map(|d| d.info).unwrap_or_default()
            )),
            Err(e) => Ok(format!("{}\nCLK={} DIO={}\nDisplay error: {}", header, clk, dio, e)),
        }
    }
}
