//! Sensor Plugins
//!
//! A plugin knows how to recognise and read one kind of sensor. Plugins are
//! declared by YAML manifests (`descriptor`), resolved to one of the built-in
//! drivers (`builtin`) and collected in the `registry`.
//!
//! # Contract
//!
//! - `detect` answers "is my sensor on this pin?" and must not leave the pin
//!   in a state that breaks other plugins' detection.
//! - `read` returns the current reading for an assigned pin.
//! - `read_with_roles` serves multi-pin sensors (e.g. a display with CLK and
//!   DIO lines) once every role is bound.
//! - Every physical operation is wrapped in `ctx.lease()`; leases are never
//!   held across settle delays.
//! - Failures are `anyhow` errors. The caller logs them and records the row
//!   as unavailable, they never abort a scan. The one exception is a stalled
//!   gate, which is detected with `error::fatal_cause`.

pub mod builtin;
pub mod descriptor;
pub mod registry;
#[cfg(any(test, feature = "testing"))]
pub mod scripted;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::EngineResult;
use crate::hardware::{HardwareAccess, HardwareGate, Lease, LeaseOwner};

pub use descriptor::{BusType, DriverOptions, PluginDescriptor, PluginManifest};
pub use registry::{AssignmentTarget, PluginHandle, PluginRegistry};

/// Display color tag for a pin table row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Color {
    Green,
    Cyan,
    Yellow,
    Magenta,
    Red,
    Blue,
    White,
}

impl std::fmt::Display for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Color::Green => "green",
            Color::Cyan => "cyan",
            Color::Yellow => "yellow",
            Color::Magenta => "magenta",
            Color::Red => "red",
            Color::Blue => "blue",
            Color::White => "white",
        };
        f.write_str(name)
    }
}

/// Result of a successful detect or read
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Short sensor name shown in the table ("DHT22")
    pub sensor: String,
    /// Concise reading or state ("23.1°C / 45.2%", "PRESSED")
    pub info: String,
    /// Row color
    pub color: Color,
}

impl Detection {
    pub fn new(sensor: impl Into<String>, info: impl Into<String>, color: Color) -> Self {
        Self {
            sensor: sensor.into(),
            info: info.into(),
            color,
        }
    }
}

/// Role name to BCM pin for one multi-pin plugin, in descriptor role order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleMap(Vec<(String, u8)>);

impl RoleMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, role: impl Into<String>, pin: u8) {
        let role = role.into();
        match self.0.iter_mut().find(|(r, _)| *r == role) {
            Some(entry) => entry.1 = pin,
            None => self.0.push((role, pin)),
        }
    }

    /// Pin bound to `role`
    pub fn get(&self, role: &str) -> Option<u8> {
        self.0.iter().find(|(r, _)| r == role).map(|(_, pin)| *pin)
    }

    /// First role in descriptor order
    pub fn first(&self) -> Option<(&str, u8)> {
        self.0.first().map(|(r, pin)| (r.as_str(), *pin))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u8)> {
        self.0.iter().map(|(r, pin)| (r.as_str(), *pin))
    }

    pub fn pins(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.iter().map(|(_, pin)| *pin)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, u8)> for RoleMap {
    fn from_iter<T: IntoIterator<Item = (S, u8)>>(iter: T) -> Self {
        let mut map = RoleMap::new();
        for (role, pin) in iter {
            map.insert(role, pin);
        }
        map
    }
}

/// Everything a plugin may touch while it runs
///
/// Cheap to clone: the hardware and the role table are shared.
#[derive(Clone)]
pub struct PluginContext {
    hardware: Arc<dyn HardwareAccess>,
    gate: HardwareGate,
    owner: LeaseOwner,
    role_pins: Arc<HashMap<(String, String), u8>>,
}

impl PluginContext {
    pub fn new(hardware: Arc<dyn HardwareAccess>, gate: HardwareGate, owner: LeaseOwner) -> Self {
        Self {
            hardware,
            gate,
            owner,
            role_pins: Arc::new(HashMap::new()),
        }
    }

    /// Attach the current `(plugin, role) -> pin` assignments
    pub fn with_role_pins(mut self, role_pins: HashMap<(String, String), u8>) -> Self {
        self.role_pins = Arc::new(role_pins);
        self
    }

    /// Physical bus access. Hold a `lease()` while calling it.
    pub fn hardware(&self) -> &dyn HardwareAccess {
        self.hardware.as_ref()
    }

    /// Exclusive bus access for one physical operation
    pub async fn lease(&self) -> EngineResult<Lease> {
        self.gate.acquire(self.owner).await
    }

    /// Component this context runs on behalf of
    pub fn owner(&self) -> LeaseOwner {
        self.owner
    }

    /// Pin currently bound to `(plugin, role)`
    pub fn role_pin(&self, plugin: &str, role: &str) -> Option<u8> {
        self.role_pins
            .get(&(plugin.to_string(), role.to_string()))
            .copied()
    }

    /// Full `(plugin, role) -> pin` table
    pub fn role_pin_assignments(&self) -> &HashMap<(String, String), u8> {
        &self.role_pins
    }
}

/// Capability: a sensor driver
#[async_trait]
pub trait SensorPlugin: Send + Sync {
    /// Display name, unique within the registry
    fn name(&self) -> &str;

    /// Probe `pin` and report the sensor if it is present
    async fn detect(&self, pin: u8, ctx: &PluginContext) -> Result<Option<Detection>>;

    /// Current reading for an assigned pin
    async fn read(&self, pin: u8, ctx: &PluginContext) -> Result<Option<Detection>>;

    /// Current reading for a plugin bound to several pins
    ///
    /// # Default Implementation
    /// Reads the pin bound to the first role.
    async fn read_with_roles(&self, roles: &RoleMap, ctx: &PluginContext) -> Result<Option<Detection>> {
        match roles.first() {
            Some((_, pin)) => self.read(pin, ctx).await,
            None => Ok(None),
        }
    }

    /// Multi-line description for the details pane
    ///
    /// # Default Implementation
    /// Reads `bcm`, or the pin bound to this plugin's `DATA` role when the
    /// row has no BCM number, and shows the current reading.
    async fn details(&self, phys: u8, bcm: Option<u8>, ctx: &PluginContext) -> Result<String> {
        let header = format!("Pin {}\nSensor: {}", phys, self.name());
        let pin = bcm.or_else(|| ctx.role_pin(self.name(), "DATA"));
        if let Some(pin) = pin {
            if let Ok(Some(reading)) = self.read(pin, ctx).await {
                return Ok(format!("{}\n{}", header, reading.info));
            }
        }
        Ok(format!("{}\nReading failed or unavailable", header))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_map_keeps_insertion_order() {
        let mut roles: RoleMap = [("CLK", 23), ("DIO", 24)].into_iter().collect();
        assert_eq!(roles.first(), Some(("CLK", 23)));
        assert_eq!(roles.get("DIO"), Some(24));

        roles.insert("CLK", 5);
        assert_eq!(roles.len(), 2);
        assert_eq!(roles.pins().collect::<Vec<_>>(), vec![5, 24]);
    }

    #[test]
    fn color_tags_render_lowercase() {
        assert_eq!(Color::Magenta.to_string(), "magenta");
        assert_eq!(Color::Red.to_string(), "red");
    }
}
