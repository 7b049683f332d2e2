//! Mock Hardware Backend
//!
//! Simulated GPIO/I2C bus for tests and for running the dashboard without a
//! board attached. All delays use `tokio::time::sleep`, never
//! `std::thread::sleep`.
//!
//! # Behaviour
//!
//! - Pins with an explicit level return it; otherwise the configured pull
//!   decides (pull-up reads HIGH, anything else reads LOW).
//! - `stall_pin` makes every operation on that pin hang forever, which is how
//!   tests exercise the per-plugin timeout.
//! - The I2C bus acknowledges exactly the configured address set and can be
//!   removed entirely with `without_i2c`.
//! - Every physical operation is counted so tests can assert "no hardware
//!   traffic happened".

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};

use crate::hardware::access::{
    DhtSample, Direction, HardwareAccess, Level, PinFunction, Pull,
};

#[derive(Debug, Default)]
struct MockState {
    levels: HashMap<u8, Level>,
    config: HashMap<u8, (Direction, Pull)>,
    alt_functions: HashMap<u8, u8>,
    dht: HashMap<u8, DhtSample>,
    stalled: HashSet<u8>,
    i2c_acks: HashSet<u8>,
}

/// In-memory GPIO/I2C bus
///
/// # Example
///
/// ```rust,ignore
/// let bus = MockBus::new()
///     .with_level(17, Level::High)
///     .with_i2c_devices([0x23, 0x40]);
/// assert_eq!(bus.read_level(17).await?, Level::High);
/// ```
pub struct MockBus {
    state: RwLock<MockState>,
    i2c_present: bool,
    op_delay: Duration,
    operations: AtomicU64,
    probes: AtomicU64,
}

impl MockBus {
    /// Create a bus with every pin floating LOW and an empty I2C bus
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MockState::default()),
            i2c_present: true,
            op_delay: Duration::ZERO,
            operations: AtomicU64::new(0),
            probes: AtomicU64::new(0),
        }
    }

    /// Preset the level a pin reads
    pub fn with_level(mut self, pin: u8, level: Level) -> Self {
        self.state_mut().levels.insert(pin, level);
        self
    }

    /// Make the I2C bus acknowledge these addresses
    pub fn with_i2c_devices(mut self, addresses: impl IntoIterator<Item = u8>) -> Self {
        self.state_mut().i2c_acks.extend(addresses);
        self
    }

    /// Simulate a board without an I2C bus
    pub fn without_i2c(mut self) -> Self {
        self.i2c_present = false;
        self
    }

    /// Attach a DHT22 that answers on `pin`
    pub fn with_dht22(mut self, pin: u8, temperature_c: f32, humidity_pct: f32) -> Self {
        self.state_mut().dht.insert(
            pin,
            DhtSample {
                temperature_c,
                humidity_pct,
            },
        );
        self
    }

    /// Report an alternate function on `pin`
    pub fn with_alt_function(mut self, pin: u8, alt: u8) -> Self {
        self.state_mut().alt_functions.insert(pin, alt);
        self
    }

    /// Every operation on `pin` hangs forever
    pub fn stall_pin(mut self, pin: u8) -> Self {
        self.state_mut().stalled.insert(pin);
        self
    }

    /// Add latency to every physical operation
    pub fn with_op_delay(mut self, delay: Duration) -> Self {
        self.op_delay = delay;
        self
    }

    /// Change a pin level while the bus is in use
    pub async fn set_level(&self, pin: u8, level: Level) {
        self.state.write().await.levels.insert(pin, level);
    }

    /// Replace the DHT22 sample on a pin (`None` detaches the sensor)
    pub async fn set_dht22(&self, pin: u8, sample: Option<DhtSample>) {
        let mut state = self.state.write().await;
        match sample {
            Some(sample) => state.dht.insert(pin, sample),
            None => state.dht.remove(&pin),
        };
    }

    /// Last direction/pull configured on a pin
    pub async fn pin_config(&self, pin: u8) -> Option<(Direction, Pull)> {
        self.state.read().await.config.get(&pin).copied()
    }

    /// Physical GPIO operations performed so far
    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::SeqCst)
    }

    /// I2C probes performed so far
    pub fn probes(&self) -> u64 {
        self.probes.load(Ordering::SeqCst)
    }

    fn state_mut(&mut self) -> &mut MockState {
        self.state.get_mut()
    }

    async fn touch(&self, pin: u8) {
        self.operations.fetch_add(1, Ordering::SeqCst);
        if self.state.read().await.stalled.contains(&pin) {
            std::future::pending::<()>().await;
        }
        if !self.op_delay.is_zero() {
            sleep(self.op_delay).await;
        }
    }
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HardwareAccess for MockBus {
    fn backend_name(&self) -> &'static str {
        "mock"
    }

    async fn setup_pin(&self, pin: u8, direction: Direction, pull: Pull) -> Result<()> {
        self.touch(pin).await;
        let mut state = self.state.write().await;
        state.alt_functions.remove(&pin);
        state.config.insert(pin, (direction, pull));
        Ok(())
    }

    async fn read_level(&self, pin: u8) -> Result<Level> {
        self.touch(pin).await;
        let state = self.state.read().await;
        if let Some(level) = state.levels.get(&pin) {
            return Ok(*level);
        }
        let pulled_up = matches!(state.config.get(&pin), Some((_, Pull::Up)));
        Ok(Level::from(pulled_up))
    }

    async fn write_level(&self, pin: u8, level: Level) -> Result<()> {
        self.touch(pin).await;
        let mut state = self.state.write().await;
        match state.config.get(&pin) {
            Some((Direction::Output, _)) => {
                state.levels.insert(pin, level);
                Ok(())
            }
            _ => Err(anyhow!("BCM {} is not configured as an output", pin)),
        }
    }

    async fn pin_function(&self, pin: u8) -> Result<PinFunction> {
        self.touch(pin).await;
        let state = self.state.read().await;
        if let Some(alt) = state.alt_functions.get(&pin) {
            return Ok(PinFunction::Alt(*alt));
        }
        Ok(match state.config.get(&pin) {
            Some((Direction::Output, _)) => PinFunction::Output,
            _ => PinFunction::Input,
        })
    }

    fn i2c_available(&self) -> bool {
        self.i2c_present
    }

    async fn i2c_probe(&self, address: u8) -> Result<bool> {
        if !self.i2c_present {
            return Err(anyhow!("I2C bus not available"));
        }
        self.probes.fetch_add(1, Ordering::SeqCst);
        if !self.op_delay.is_zero() {
            sleep(self.op_delay).await;
        }
        Ok(self.state.read().await.i2c_acks.contains(&address))
    }

    async fn read_dht22(&self, pin: u8) -> Result<Option<DhtSample>> {
        self.touch(pin).await;
        Ok(self.state.read().await.dht.get(&pin).copied())
    }
}
