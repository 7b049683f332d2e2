//! Pin State Store
//!
//! Authoritative table of what every pin is doing: board metadata, GPIO mode
//! and level, the sensor bound to it and its last reading. The scan
//! coordinator and the poller write here; the rendering layer reads
//! `snapshot()`.
//!
//! Every access takes a short-lived `std::sync::RwLock` and never awaits while
//! holding it. A poisoned lock is recovered, the data is plain values.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::hardware::{board, Level, PinFunction};
use crate::plugin::{AssignmentTarget, Color, Detection};

/// Row key: a GPIO pin or an I2C device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PinKey {
    Gpio(u8),
    I2c(u8),
}

impl std::fmt::Display for PinKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PinKey::Gpio(bcm) => write!(f, "BCM {}", bcm),
            PinKey::I2c(addr) => write!(f, "I2C 0x{:02X}", addr),
        }
    }
}

/// Mode column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Input,
    Output,
    Alt(u8),
    I2c,
    /// Not read yet
    Unassigned,
}

impl From<PinFunction> for PinMode {
    fn from(function: PinFunction) -> Self {
        match function {
            PinFunction::Input => PinMode::Input,
            PinFunction::Output => PinMode::Output,
            PinFunction::Alt(n) => PinMode::Alt(n),
        }
    }
}

impl std::fmt::Display for PinMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PinMode::Input => write!(f, "INPUT"),
            PinMode::Output => write!(f, "OUTPUT"),
            PinMode::Alt(n) => write!(f, "ALT{}", n),
            PinMode::I2c => write!(f, "I2C"),
            PinMode::Unassigned => write!(f, "N/A"),
        }
    }
}

/// One table row
#[derive(Debug, Clone, PartialEq)]
pub struct PinState {
    pub key: PinKey,
    /// Physical header position (GPIO rows only)
    pub phys: Option<u8>,
    /// Board function label ("GPIO", "I2C SDA", "I2C device")
    pub function: String,
    pub mode: PinMode,
    /// `None` until the level has been read
    pub level: Option<Level>,
    /// Sensor column; `None` renders as an unassigned "-"
    pub sensor: Option<String>,
    pub info: String,
    pub color: Color,
    /// False when the last read failed and the values are stale
    pub available: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl PinState {
    fn gpio(bcm: u8) -> Self {
        Self {
            key: PinKey::Gpio(bcm),
            phys: board::phys_for_bcm(bcm),
            function: board::function_label(bcm).to_string(),
            mode: PinMode::Unassigned,
            level: None,
            sensor: None,
            info: board::capability_hint(bcm),
            color: Color::Red,
            available: true,
            updated_at: None,
        }
    }

    fn i2c(address: u8) -> Self {
        Self {
            key: PinKey::I2c(address),
            phys: None,
            function: "I2C device".to_string(),
            mode: PinMode::I2c,
            level: None,
            sensor: Some("I2C".to_string()),
            info: format!("Addr 0x{:02X}", address),
            color: Color::Yellow,
            available: true,
            updated_at: Some(Utc::now()),
        }
    }

    /// Sensor column text
    pub fn sensor_label(&self) -> &str {
        self.sensor.as_deref().unwrap_or("-")
    }

    /// Level column text
    pub fn level_label(&self) -> String {
        self.level
            .map(|l| l.to_string())
            .unwrap_or_else(|| "N/A".to_string())
    }
}

/// How a binding came about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentSource {
    /// Chosen by the user; full GPIO scans leave it alone
    Manual,
    /// Recorded by a discovery scan
    Detected,
}

/// Pin to sensor binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub target: AssignmentTarget,
    pub source: AssignmentSource,
}

impl Binding {
    pub fn manual(target: AssignmentTarget) -> Self {
        Self {
            target,
            source: AssignmentSource::Manual,
        }
    }

    pub fn detected(plugin: impl Into<String>, role: Option<String>) -> Self {
        Self {
            target: AssignmentTarget::Plugin {
                name: plugin.into(),
                role,
            },
            source: AssignmentSource::Detected,
        }
    }

    /// Plugin name, `None` for the generic I2C tag
    pub fn plugin(&self) -> Option<&str> {
        match &self.target {
            AssignmentTarget::Plugin { name, .. } => Some(name),
            AssignmentTarget::I2c => None,
        }
    }

    pub fn role(&self) -> Option<&str> {
        match &self.target {
            AssignmentTarget::Plugin { role, .. } => role.as_deref(),
            AssignmentTarget::I2c => None,
        }
    }

    pub fn is_manual(&self) -> bool {
        self.source == AssignmentSource::Manual
    }
}

/// Persistent status message shown above the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Banner {
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct StoreInner {
    rows: BTreeMap<PinKey, PinState>,
    bindings: BTreeMap<u8, Binding>,
    banners: Vec<Banner>,
}

/// Shared pin table
#[derive(Debug)]
pub struct PinStateStore {
    inner: RwLock<StoreInner>,
}

impl Default for PinStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PinStateStore {
    /// Table pre-populated with every header GPIO
    pub fn new() -> Self {
        let rows = board::PHYS_TO_BCM
            .iter()
            .map(|(_, bcm)| (PinKey::Gpio(*bcm), PinState::gpio(*bcm)))
            .collect();
        Self {
            inner: RwLock::new(StoreInner {
                rows,
                ..StoreInner::default()
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: PinKey) -> Option<PinState> {
        self.read().rows.get(&key).cloned()
    }

    /// Apply `f` to one row atomically. Returns false if the row is missing.
    pub fn update<F>(&self, key: PinKey, f: F) -> bool
    where
        F: FnOnce(&mut PinState),
    {
        match self.write().rows.get_mut(&key) {
            Some(row) => {
                f(row);
                true
            }
            None => false,
        }
    }

    /// Ordered copy of the whole table
    pub fn snapshot(&self) -> Vec<PinState> {
        self.read().rows.values().cloned().collect()
    }

    /// Write a detect/read result into a GPIO row
    pub fn set_reading(&self, pin: u8, detection: &Detection) {
        self.update(PinKey::Gpio(pin), |row| {
            row.sensor = Some(detection.sensor.clone());
            row.info = detection.info.clone();
            row.color = detection.color;
            row.available = true;
            row.updated_at = Some(Utc::now());
        });
    }

    /// Transient progress text ("Scan DHT22", "Timeout DHT22")
    pub fn set_marker(&self, pin: u8, text: impl Into<String>, color: Color) {
        let text = text.into();
        self.update(PinKey::Gpio(pin), |row| {
            row.sensor = Some(text);
            row.info.clear();
            row.color = color;
        });
    }

    /// Show "no sensor" on a GPIO row
    pub fn mark_unassigned(&self, pin: u8) {
        self.update(PinKey::Gpio(pin), |row| {
            row.sensor = None;
            row.info.clear();
            row.color = Color::Red;
            row.available = true;
            row.updated_at = Some(Utc::now());
        });
    }

    /// Keep the previous values but flag them as stale
    pub fn mark_unavailable(&self, key: PinKey) {
        self.update(key, |row| row.available = false);
    }

    /// Mode and level columns of a GPIO row
    pub fn set_level(&self, pin: u8, mode: PinMode, level: Option<Level>) {
        self.update(PinKey::Gpio(pin), |row| {
            row.mode = mode;
            row.level = level;
        });
    }

    /// Record an acknowledging I2C address
    pub fn upsert_i2c_device(&self, address: u8) {
        let mut inner = self.write();
        let row = inner
            .rows
            .entry(PinKey::I2c(address))
            .or_insert_with(|| PinState::i2c(address));
        row.available = true;
        row.updated_at = Some(Utc::now());
    }

    /// Drop I2C rows that no longer acknowledge. Returns how many were removed.
    pub fn retain_i2c_devices(&self, present: &[u8]) -> usize {
        let mut inner = self.write();
        let before = inner.rows.len();
        inner
            .rows
            .retain(|key, _| !matches!(key, PinKey::I2c(addr) if !present.contains(addr)));
        before - inner.rows.len()
    }

    /// I2C addresses currently in the table, ascending
    pub fn i2c_devices(&self) -> Vec<u8> {
        self.read()
            .rows
            .keys()
            .filter_map(|key| match key {
                PinKey::I2c(addr) => Some(*addr),
                PinKey::Gpio(_) => None,
            })
            .collect()
    }

    // Bindings

    /// Bind `pin`, replacing whatever was bound there. Returns the old binding.
    ///
    /// Manual bindings show the target with a cyan "manual" note until the
    /// first reading arrives.
    pub fn assign(&self, pin: u8, binding: Binding) -> Option<Binding> {
        let mut inner = self.write();
        if binding.is_manual() {
            if let Some(row) = inner.rows.get_mut(&PinKey::Gpio(pin)) {
                row.sensor = Some(binding.target.to_string());
                row.info = "manual".to_string();
                row.color = Color::Cyan;
                row.available = true;
                row.updated_at = Some(Utc::now());
            }
        }
        inner.bindings.insert(pin, binding)
    }

    /// Remove the binding on `pin` and reset its row
    pub fn unassign(&self, pin: u8) -> Option<Binding> {
        let mut inner = self.write();
        let removed = inner.bindings.remove(&pin);
        if removed.is_some() {
            if let Some(row) = inner.rows.get_mut(&PinKey::Gpio(pin)) {
                row.sensor = None;
                row.info = board::capability_hint(pin);
                row.color = Color::Red;
                row.available = true;
                row.updated_at = Some(Utc::now());
            }
        }
        removed
    }

    /// Drop a scan-recorded binding without touching the row
    pub fn forget_detected(&self, pin: u8) -> Option<Binding> {
        let mut inner = self.write();
        match inner.bindings.get(&pin) {
            Some(b) if !b.is_manual() => inner.bindings.remove(&pin),
            _ => None,
        }
    }

    pub fn binding(&self, pin: u8) -> Option<Binding> {
        self.read().bindings.get(&pin).cloned()
    }

    /// All bindings, ascending by pin
    pub fn bindings(&self) -> Vec<(u8, Binding)> {
        self.read()
            .bindings
            .iter()
            .map(|(pin, b)| (*pin, b.clone()))
            .collect()
    }

    pub fn is_manual(&self, pin: u8) -> bool {
        self.read().bindings.get(&pin).is_some_and(Binding::is_manual)
    }

    /// Pin bound to `(plugin, role)`, lowest pin first
    pub fn pin_for_role(&self, plugin: &str, role: &str) -> Option<u8> {
        self.read()
            .bindings
            .iter()
            .find(|(_, b)| b.plugin() == Some(plugin) && b.role() == Some(role))
            .map(|(pin, _)| *pin)
    }

    /// `(plugin, role) -> pin` table handed to plugins
    pub fn role_pin_assignments(&self) -> HashMap<(String, String), u8> {
        let inner = self.read();
        let mut map = HashMap::new();
        for (pin, binding) in inner.bindings.iter().rev() {
            if let (Some(plugin), Some(role)) = (binding.plugin(), binding.role()) {
                map.insert((plugin.to_string(), role.to_string()), *pin);
            }
        }
        map
    }

    // Banners

    /// Raise a banner unless the same message is already showing
    pub fn raise_banner(&self, message: impl Into<String>) {
        let message = message.into();
        let mut inner = self.write();
        if !inner.banners.iter().any(|b| b.message == message) {
            tracing::warn!(banner = %message, "Banner raised");
            inner.banners.push(Banner {
                message,
                raised_at: Utc::now(),
            });
        }
    }

    pub fn clear_banner(&self, message: &str) {
        self.write().banners.retain(|b| b.message != message);
    }

    pub fn banners(&self) -> Vec<Banner> {
        self.read().banners.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_cover_every_header_gpio() {
        let store = PinStateStore::new();
        let rows = store.snapshot();
        assert_eq!(rows.len(), 26);
        assert_eq!(rows[0].key, PinKey::Gpio(2));
        assert_eq!(rows[0].function, "I2C SDA");

        let pin17 = store.get(PinKey::Gpio(17)).unwrap();
        assert_eq!(pin17.phys, Some(11));
        assert_eq!(pin17.sensor_label(), "-");
        assert_eq!(pin17.mode.to_string(), "N/A");
    }

    #[test]
    fn unavailable_keeps_previous_values() {
        let store = PinStateStore::new();
        store.set_reading(17, &Detection::new("DHT22", "21.0°C / 40.0%", Color::Green));
        store.mark_unavailable(PinKey::Gpio(17));

        let row = store.get(PinKey::Gpio(17)).unwrap();
        assert_eq!(row.info, "21.0°C / 40.0%");
        assert!(!row.available);
    }

    #[test]
    fn manual_assignment_and_reset() {
        let store = PinStateStore::new();
        let target = AssignmentTarget::Plugin {
            name: "TM1637".into(),
            role: Some("CLK".into()),
        };
        assert!(store.assign(23, Binding::manual(target)).is_none());

        let row = store.get(PinKey::Gpio(23)).unwrap();
        assert_eq!(row.sensor.as_deref(), Some("TM1637:CLK"));
        assert_eq!(row.info, "manual");
        assert!(store.is_manual(23));
        assert_eq!(store.pin_for_role("TM1637", "CLK"), Some(23));

        assert!(store.unassign(23).is_some());
        assert!(store.binding(23).is_none());
        assert_eq!(store.get(PinKey::Gpio(23)).unwrap().sensor, None);
        assert!(store.unassign(23).is_none());
    }

    #[test]
    fn detected_bindings_can_be_forgotten() {
        let store = PinStateStore::new();
        store.assign(4, Binding::detected("DS18B20", Some("DATA".into())));
        store.assign(17, Binding::manual(AssignmentTarget::I2c));

        assert!(store.forget_detected(17).is_none());
        assert!(store.forget_detected(4).is_some());
        assert_eq!(store.bindings().len(), 1);
    }

    #[test]
    fn i2c_rows_are_replaced_by_later_scans() {
        let store = PinStateStore::new();
        store.upsert_i2c_device(0x23);
        store.upsert_i2c_device(0x40);
        assert_eq!(store.i2c_devices(), vec![0x23, 0x40]);

        assert_eq!(store.retain_i2c_devices(&[0x40]), 1);
        assert_eq!(store.i2c_devices(), vec![0x40]);
        // GPIO rows sort before I2C rows
        assert_eq!(store.snapshot().last().unwrap().key, PinKey::I2c(0x40));
    }

    #[test]
    fn banners_are_deduplicated() {
        let store = PinStateStore::new();
        store.raise_banner("I2C bus not available");
        store.raise_banner("I2C bus not available");
        assert_eq!(store.banners().len(), 1);
        store.clear_banner("I2C bus not available");
        assert!(store.banners().is_empty());
    }
}
