//! Scripted plugin for tests
//!
//! Behaves like a real driver (takes a lease and touches the bus for every
//! call) but its answers are configured up front, so scan and poll behaviour
//! can be asserted exactly.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::sleep;

use crate::plugin::{Color, Detection, PluginContext, RoleMap, SensorPlugin};

#[derive(Debug, Default)]
struct Script {
    detections: HashMap<u8, String>,
    hangs: HashSet<u8>,
    read_info: Option<String>,
    read_fails: bool,
}

/// Plugin whose answers are configured by the test
pub struct ScriptedPlugin {
    name: String,
    color: Color,
    delay: Duration,
    script: Mutex<Script>,
    detect_calls: AtomicU64,
    read_calls: AtomicU64,
    role_reads: AtomicU64,
    probed: Mutex<Vec<u8>>,
}

impl ScriptedPlugin {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: Color::Green,
            delay: Duration::ZERO,
            script: Mutex::new(Script::default()),
            detect_calls: AtomicU64::new(0),
            read_calls: AtomicU64::new(0),
            role_reads: AtomicU64::new(0),
            probed: Mutex::new(Vec::new()),
        }
    }

    /// Report the sensor on `pin` with `info`
    pub fn detects_on(self, pin: u8, info: impl Into<String>) -> Self {
        self.script().detections.insert(pin, info.into());
        self
    }

    /// `detect` on `pin` never returns, while holding a lease
    pub fn hangs_on(self, pin: u8) -> Self {
        self.script().hangs.insert(pin);
        self
    }

    /// Sleep this long (without a lease) before every answer
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_color(mut self, color: Color) -> Self {
        self.color = color;
        self
    }

    /// `read` answers with `info`
    pub fn reads(self, info: impl Into<String>) -> Self {
        self.set_reading(Some(info.into()));
        self
    }

    /// Change the `read` answer; `None` makes the sensor go quiet
    pub fn set_reading(&self, info: Option<String>) {
        self.script().read_info = info;
    }

    /// Make every `read` fail with an error
    pub fn set_read_fails(&self, fails: bool) {
        self.script().read_fails = fails;
    }

    pub fn detect_calls(&self) -> u64 {
        self.detect_calls.load(Ordering::SeqCst)
    }

    pub fn read_calls(&self) -> u64 {
        self.read_calls.load(Ordering::SeqCst)
    }

    pub fn role_reads(&self) -> u64 {
        self.role_reads.load(Ordering::SeqCst)
    }

    /// Pins `detect` was called on, in call order
    pub fn probed_pins(&self) -> Vec<u8> {
        self.probed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn touch(&self, pin: u8, ctx: &PluginContext) -> Result<()> {
        let _lease = ctx.lease().await?;
        ctx.hardware().read_level(pin).await?;
        Ok(())
    }
}

#[async_trait]
impl SensorPlugin for ScriptedPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn detect(&self, pin: u8, ctx: &PluginContext) -> Result<Option<Detection>> {
        self.detect_calls.fetch_add(1, Ordering::SeqCst);
        self.probed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(pin);

        if self.script().hangs.contains(&pin) {
            let _lease = ctx.lease().await?;
            std::future::pending::<()>().await;
        }
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        self.touch(pin, ctx).await?;

        let info = self.script().detections.get(&pin).cloned();
        Ok(info.map(|info| Detection::new(&self.name, info, self.color)))
    }

    async fn read(&self, pin: u8, ctx: &PluginContext) -> Result<Option<Detection>> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        self.touch(pin, ctx).await?;

        let (info, fails) = {
            let script = self.script();
            (script.read_info.clone(), script.read_fails)
        };
        if fails {
            return Err(anyhow!("{} read failed on BCM {}", self.name, pin));
        }
        Ok(info.map(|info| Detection::new(&self.name, info, self.color)))
    }

    async fn read_with_roles(&self, roles: &RoleMap, ctx: &PluginContext) -> Result<Option<Detection>> {
        self.role_reads.fetch_add(1, Ordering::SeqCst);
        for pin in roles.pins() {
            self.touch(pin, ctx).await?;
        }
        let info = self.script().read_info.clone();
        Ok(info.map(|info| {
            let pins: Vec<String> = roles.iter().map(|(r, p)| format!("{}={}", r, p)).collect();
            Detection::new(&self.name, format!("{} ({})", info, pins.join(" ")), self.color)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{HardwareGate, LeaseOwner, MockBus};
    use std::sync::Arc;

    #[tokio::test]
    async fn answers_follow_script() {
        let gate = HardwareGate::new(Duration::from_secs(1));
        let ctx = PluginContext::new(Arc::new(MockBus::new()), gate.clone(), LeaseOwner::Scan);
        let plugin = ScriptedPlugin::new("Probe").detects_on(17, "here").reads("42");

        assert_eq!(plugin.detect(17, &ctx).await.unwrap().unwrap().info, "here");
        assert!(plugin.detect(18, &ctx).await.unwrap().is_none());
        assert_eq!(plugin.read(17, &ctx).await.unwrap().unwrap().info, "42");

        plugin.set_read_fails(true);
        assert!(plugin.read(17, &ctx).await.is_err());

        assert_eq!(plugin.probed_pins(), vec![17, 18]);
        assert_eq!(gate.grants(LeaseOwner::Scan), 4);
    }
}
