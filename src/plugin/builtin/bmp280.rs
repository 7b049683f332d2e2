//! BMP280 pressure/temperature sensor (I2C)
//!
//! Presence is established with a quick-write probe of the two addresses the
//! SDO strap selects. Compensated readings are out of scope, so the reading
//! reports the responding address.

use anyhow::Result;
use async_trait::async_trait;

use crate::plugin::{Color, Detection, PluginContext, SensorPlugin};

/// Addresses selected by SDO low / high
pub const DEFAULT_ADDRESSES: [u8; 2] = [0x76, 0x77];

/// BMP280 driver
pub struct Bmp280 {
    name: String,
    addresses: Vec<u8>,
}

impl Bmp280 {
    pub fn new(name: impl Into<String>, addresses: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            addresses,
        }
    }

    async fn find_address(&self, ctx: &PluginContext) -> Result<Option<u8>> {
        if !ctx.hardware().i2c_available() {
            return Ok(None);
        }
        for &address in &self.addresses {
            let acked = {
                let _lease = ctx.lease().await?;
                ctx.hardware().i2c_probe(address).await?
            };
            if acked {
                return Ok(Some(address));
            }
        }
        Ok(None)
    }

    async fn reading(&self, ctx: &PluginContext) -> Result<Option<Detection>> {
        Ok(self
            .find_address(ctx)
            .await?
            .map(|addr| Detection::new(&self.name, format!("Addr 0x{:02X}", addr), Color::Yellow)))
    }
}

#[async_trait]
impl SensorPlugin for Bmp280 {
    fn name(&self) -> &str {
        &self.name
    }

    // The bus is shared, so the GPIO pin does not matter
    async fn detect(&self, _pin: u8, ctx: &PluginContext) -> Result<Option<Detection>> {
        self.reading(ctx).await
    }

    async fn read(&self, _pin: u8, ctx: &PluginContext) -> Result<Option<Detection>> {
        self.reading(ctx).await
    }
}
