//! Sensor Engine
//!
//! Owns every engine component and exposes the commands a front end issues:
//! scans, manual assignment, the pin table snapshot and row details.
//!
//! ```text
//!               ┌──────────────┐
//!   commands ──▶│ SensorEngine │──▶ snapshot()
//!               └──────┬───────┘
//!          ┌───────────┼────────────┐
//!          ▼           ▼            ▼
//!   ScanCoordinator  Poller   PinStateStore
//!          │           │
//!          └─────┬─────┘
//!                ▼
//!          HardwareGate ──▶ HardwareAccess
//! ```

pub mod cancel;
pub mod coordinator;
pub mod poller;
pub mod session;
pub mod store;

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, PluginLoadError};
use crate::hardware::{board, GateStats, HardwareAccess, HardwareGate, LeaseOwner};
use crate::plugin::builtin::DriverDefaults;
use crate::plugin::{AssignmentTarget, PluginContext, PluginRegistry};

pub use cancel::CancelToken;
pub use coordinator::{ScanCoordinator, I2C_UNAVAILABLE_BANNER};
pub use poller::{PollStats, Poller, TickOutcome};
pub use session::{ScanHandle, ScanKind, ScanReport, ScanState};
pub use store::{AssignmentSource, Banner, Binding, PinKey, PinMode, PinState, PinStateStore};

struct PollerTask {
    token: CancelToken,
    join: JoinHandle<()>,
}

/// Sensor scanning and polling engine
pub struct SensorEngine {
    config: EngineConfig,
    registry: Arc<PluginRegistry>,
    hardware: Arc<dyn HardwareAccess>,
    gate: HardwareGate,
    store: Arc<PinStateStore>,
    coordinator: Arc<ScanCoordinator>,
    poller: Arc<Poller>,
    poller_task: Mutex<Option<PollerTask>>,
}

impl SensorEngine {
    pub fn new(config: EngineConfig, hardware: Arc<dyn HardwareAccess>, registry: PluginRegistry) -> Self {
        let registry = Arc::new(registry);
        let gate = HardwareGate::new(config.gate.stall_timeout());
        let store = Arc::new(PinStateStore::new());
        let coordinator = Arc::new(ScanCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&hardware),
            gate.clone(),
            Arc::clone(&store),
            config.scan.clone(),
        ));
        let poller = Arc::new(Poller::new(
            Arc::clone(&coordinator),
            Arc::clone(&registry),
            Arc::clone(&hardware),
            gate.clone(),
            Arc::clone(&store),
            config.poller.clone(),
        ));

        info!(
            backend = hardware.backend_name(),
            plugins = registry.len(),
            "Sensor engine ready"
        );

        Self {
            config,
            registry,
            hardware,
            gate,
            store,
            coordinator,
            poller,
            poller_task: Mutex::new(None),
        }
    }

    /// Build the configured backend, load manifests from the search paths
    /// and assemble the engine. Broken manifests are returned, not fatal.
    pub async fn from_config(config: EngineConfig) -> (Self, Vec<PluginLoadError>) {
        let hardware = crate::hardware::from_config(&config.hardware);
        let mut registry = PluginRegistry::with_defaults(DriverDefaults {
            w1_devices_dir: config.plugins.w1_devices_dir.clone(),
        });
        for path in &config.plugins.search_paths {
            registry.add_search_path(path.clone());
        }
        let errors = registry.scan().await;
        (Self::new(config, hardware, registry), errors)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn store(&self) -> &PinStateStore {
        &self.store
    }

    pub fn gate(&self) -> &HardwareGate {
        &self.gate
    }

    // Scans

    pub fn start_gpio_scan(&self) -> EngineResult<ScanHandle> {
        self.coordinator.start_gpio_scan()
    }

    pub fn start_single_pin_scan(&self, pin: u8) -> EngineResult<ScanHandle> {
        self.coordinator.start_single_pin_scan(pin)
    }

    pub fn start_i2c_scan(&self) -> EngineResult<ScanHandle> {
        self.coordinator.start_i2c_scan()
    }

    /// Cancel the running scan, if any
    pub fn stop_all(&self) -> bool {
        self.coordinator.stop_all()
    }

    pub fn scan_state(&self) -> ScanState {
        self.coordinator.state()
    }

    /// Follow scan state changes
    pub fn subscribe(&self) -> watch::Receiver<ScanState> {
        self.coordinator.subscribe()
    }

    // Assignment

    /// Bind `pin` to a dropdown option ("DHT22", "TM1637:CLK", "I2C")
    ///
    /// # Errors
    /// - `UnknownPin` if `pin` is not a header GPIO
    /// - `InvalidAssignment` for an unknown plugin or role, or a multi-role
    ///   plugin named without a role
    /// - `ReservedPin` when a plugin is bound to an I2C, UART or SPI pin
    ///
    /// A role of a multi-pin plugin lives on one pin at a time; assigning it
    /// again moves it.
    pub fn assign(&self, pin: u8, target: &str) -> EngineResult<Binding> {
        Self::check_pin(pin)?;
        let target = self.registry.resolve_target(target)?;
        if board::is_bus_pin(pin) && target != AssignmentTarget::I2c {
            return Err(EngineError::ReservedPin(pin));
        }

        if let AssignmentTarget::Plugin {
            name,
            role: Some(role),
        } = &target
        {
            let multi_role = self
                .registry
                .get(name)
                .is_some_and(|h| h.descriptor.is_multi_role());
            if multi_role {
                if let Some(previous) = self.store.pin_for_role(name, role) {
                    if previous != pin {
                        debug!(plugin = %name, %role, from = previous, to = pin, "Moving role");
                        self.store.unassign(previous);
                    }
                }
            }
        }

        let binding = Binding::manual(target);
        self.store.assign(pin, binding.clone());
        info!(pin, target = %binding.target, "Pin assigned");
        Ok(binding)
    }

    /// Drop the binding on `pin`. Returns false if nothing was bound.
    pub fn unassign(&self, pin: u8) -> EngineResult<bool> {
        Self::check_pin(pin)?;
        let removed = self.store.unassign(pin);
        if let Some(binding) = &removed {
            info!(pin, target = %binding.target, "Pin unassigned");
        }
        Ok(removed.is_some())
    }

    /// Dropdown options: plugin names, `Name:Role` entries and `I2C`
    pub fn plugin_options(&self) -> Vec<String> {
        self.registry.options()
    }

    // Table

    pub fn snapshot(&self) -> Vec<PinState> {
        self.store.snapshot()
    }

    pub fn banners(&self) -> Vec<Banner> {
        self.store.banners()
    }

    /// Multi-line description of one GPIO row
    ///
    /// Asks the plugin shown on the row for its details, bounded by the plugin
    /// timeout, and falls back to a summary of the row.
    pub async fn details(&self, pin: u8) -> EngineResult<String> {
        Self::check_pin(pin)?;
        let row = self
            .store
            .get(PinKey::Gpio(pin))
            .ok_or(EngineError::UnknownPin(pin))?;
        let phys = row.phys.unwrap_or(pin);

        let Some(sensor) = row.sensor.clone() else {
            return Ok(format!("Pin {}: No sensor detected", phys));
        };

        let plugin_name = match self.store.binding(pin).map(|b| b.target) {
            Some(AssignmentTarget::Plugin { name, .. }) => name,
            _ => sensor.clone(),
        };
        if let Some(handle) = self.registry.get(&plugin_name) {
            let ctx = self.context(LeaseOwner::Inspector);
            let call = handle.plugin.details(phys, Some(pin), &ctx);
            match timeout(self.config.scan.plugin_timeout(), call).await {
                Ok(Ok(text)) => return Ok(text),
                Ok(Err(e)) => debug!(pin, plugin = handle.name(), error = %e, "Details failed"),
                Err(_) => debug!(pin, plugin = handle.name(), "Details timed out"),
            }
        }

        Ok(format!(
            "Pin {}\nSensor: {}\nInfo: {}\nCurrent level: {}",
            phys,
            sensor,
            row.info,
            row.level_label()
        ))
    }

    /// Re-read mode and level of every header GPIO
    pub async fn refresh_levels(&self) {
        poller::refresh_levels(
            &*self.hardware,
            &self.gate,
            &self.store,
            LeaseOwner::Inspector,
            self.config.poller.read_timeout(),
            || self.coordinator.is_active(),
        )
        .await;
    }

    // Polling

    /// Start the background poller. Returns false if it is already running.
    pub fn spawn_poller(&self) -> bool {
        let mut task = self.poller_task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.join.is_finished()) {
            return false;
        }
        let token = CancelToken::new();
        let join = Arc::clone(&self.poller).spawn(token.clone());
        *task = Some(PollerTask { token, join });
        true
    }

    /// Run one poll tick now
    pub async fn poll_once(&self) -> TickOutcome {
        self.poller.tick().await
    }

    pub fn poll_stats(&self) -> PollStats {
        self.poller.stats()
    }

    pub fn gate_stats(&self) -> GateStats {
        self.gate.stats()
    }

    /// Stop the poller and any scan, then close the gate
    pub async fn shutdown(&self) {
        let task = self
            .poller_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.token.cancel();
            let _ = task.join.await;
        }

        self.coordinator.stop_all();
        let mut state = self.coordinator.subscribe();
        // A cancelled scan ends within one plugin timeout
        let bound = self.config.scan.plugin_timeout() * 2 + self.config.scan.pin_delay();
        let _ = timeout(bound, state.wait_for(|s| !s.is_active())).await;

        self.gate.close();
        info!("Sensor engine shut down");
    }

    fn context(&self, owner: LeaseOwner) -> PluginContext {
        PluginContext::new(Arc::clone(&self.hardware), self.gate.clone(), owner)
            .with_role_pins(self.store.role_pin_assignments())
    }

    fn check_pin(pin: u8) -> EngineResult<()> {
        if pin <= board::MAX_BCM && board::is_gpio(pin) {
            Ok(())
        } else {
            Err(EngineError::UnknownPin(pin))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::MockBus;
    use crate::plugin::scripted::ScriptedPlugin;
    use crate::plugin::PluginDescriptor;
    use std::time::Duration;

    fn engine() -> SensorEngine {
        let mut registry = PluginRegistry::new();
        registry
            .register(
                PluginDescriptor::new("Probe").with_roles(["DATA"]),
                Arc::new(ScriptedPlugin::new("Probe").reads("ok")),
            )
            .unwrap();
        registry
            .register(
                PluginDescriptor::new("Display").with_roles(["CLK", "DIO"]),
                Arc::new(ScriptedPlugin::new("Display")),
            )
            .unwrap();
        SensorEngine::new(EngineConfig::default(), Arc::new(MockBus::new()), registry)
    }

    #[tokio::test]
    async fn bus_pins_only_take_i2c() {
        let engine = engine();
        assert!(matches!(engine.assign(2, "Probe"), Err(EngineError::ReservedPin(2))));
        assert!(engine.assign(2, "I2C").is_ok());
        assert!(matches!(engine.assign(1, "Probe"), Err(EngineError::UnknownPin(1))));
    }

    #[tokio::test]
    async fn multi_role_plugin_needs_role() {
        let engine = engine();
        assert!(matches!(
            engine.assign(23, "Display"),
            Err(EngineError::InvalidAssignment(_))
        ));
        assert!(matches!(
            engine.assign(23, "Display:LATCH"),
            Err(EngineError::InvalidAssignment(_))
        ));
    }

    #[tokio::test]
    async fn role_moves_between_pins() {
        let engine = engine();
        engine.assign(23, "Display:CLK").unwrap();
        engine.assign(5, "Display:CLK").unwrap();

        assert!(engine.store().binding(23).is_none());
        assert_eq!(engine.store().pin_for_role("Display", "CLK"), Some(5));
    }

    #[tokio::test]
    async fn unassign_resets_row() {
        let engine = engine();
        engine.assign(17, "Probe").unwrap();
        assert_eq!(engine.store().get(PinKey::Gpio(17)).unwrap().info, "manual");

        assert!(engine.unassign(17).unwrap());
        assert!(!engine.unassign(17).unwrap());
        let row = engine.store().get(PinKey::Gpio(17)).unwrap();
        assert_eq!(row.sensor, None);
    }

    #[tokio::test]
    async fn details_without_sensor() {
        let engine = engine();
        // BCM 17 sits on header pin 11
        assert_eq!(engine.details(17).await.unwrap(), "Pin 11: No sensor detected");
    }

    #[tokio::test]
    async fn details_ask_bound_plugin() {
        let engine = engine();
        engine.assign(17, "Probe").unwrap();
        let text = engine.details(17).await.unwrap();
        assert_eq!(text, "Pin 11\nSensor: Probe\nok");
        assert_eq!(engine.gate_stats().inspector_grants, 1);
    }

    #[tokio::test]
    async fn poller_runs_until_shutdown() {
        let engine = engine();
        assert!(engine.spawn_poller());
        assert!(!engine.spawn_poller());

        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.shutdown().await;

        // First tick fires immediately, the next one is an interval away
        assert_eq!(engine.poll_stats().ticks_run, 1);
        assert_eq!(engine.gate_stats().outstanding, 0);
    }
}
