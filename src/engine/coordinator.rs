//! Scan Coordinator
//!
//! Runs one discovery session at a time, either over GPIO pins (trying each
//! auto-detectable plugin in registration order) or over I2C addresses
//! (quick-write probes).
//!
//! # Guarantees
//!
//! - At most one session is active; a second start fails with
//!   `ScanAlreadyRunning` and changes nothing.
//! - A session is `Starting` until it owns the poll turn and only then
//!   reports `Running`. Cancellation is honoured while it waits.
//! - Every `detect` is bounded by the per-plugin timeout. A timed-out detect
//!   future is dropped, which releases any lease it held.
//! - The cancellation token is checked before every pin or address, before
//!   every plugin trial and during every inter-pin delay. A pin interrupted
//!   mid-probe gets its previous sensor columns back.
//! - While a session runs it owns the poll turn, so the poller neither reads
//!   nor takes a lease.
//! - Plugin errors are logged and recorded on the row. Only a stalled gate
//!   aborts the session (`TimedOut`, with a banner).

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, OwnedMutexGuard};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::ScanConfig;
use crate::engine::cancel::CancelToken;
use crate::engine::session::{ScanHandle, ScanKind, ScanReport, ScanSession, ScanState};
use crate::engine::store::{Binding, PinKey, PinState, PinStateStore};
use crate::error::{fatal_cause, EngineError, EngineResult};
use crate::hardware::{board, HardwareAccess, HardwareGate, LeaseOwner};
use crate::plugin::{Color, PluginContext, PluginRegistry};

/// Banner raised when an I2C scan finds no bus
pub const I2C_UNAVAILABLE_BANNER: &str = "I2C bus not available";

/// Why a session stopped before visiting every target
enum Interrupt {
    Cancelled,
    DeadlineExceeded,
    Fatal(EngineError),
}

/// Outcome of probing one pin
enum PinOutcome {
    Found,
    Empty,
    Interrupted(Interrupt),
}

#[derive(Default)]
struct Tally {
    visited: usize,
    found: Vec<u8>,
    timeouts: usize,
}

/// Discovery scan state machine
pub struct ScanCoordinator {
    registry: Arc<PluginRegistry>,
    hardware: Arc<dyn HardwareAccess>,
    gate: HardwareGate,
    store: Arc<PinStateStore>,
    config: ScanConfig,
    state_tx: watch::Sender<ScanState>,
    poll_turn: Arc<tokio::sync::Mutex<()>>,
    active: Mutex<Option<CancelToken>>,
}

impl ScanCoordinator {
    pub fn new(
        registry: Arc<PluginRegistry>,
        hardware: Arc<dyn HardwareAccess>,
        gate: HardwareGate,
        store: Arc<PinStateStore>,
        config: ScanConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ScanState::Idle);
        Self {
            registry,
            hardware,
            gate,
            store,
            config,
            state_tx,
            poll_turn: Arc::new(tokio::sync::Mutex::new(())),
            active: Mutex::new(None),
        }
    }

    /// Current state
    pub fn state(&self) -> ScanState {
        *self.state_tx.borrow()
    }

    /// Follow state changes
    pub fn subscribe(&self) -> watch::Receiver<ScanState> {
        self.state_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// A session is starting or running. Poll work should yield.
    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Ask for the poll turn. `None` while a scan is running or about to
    /// take the bus.
    pub fn try_poll_turn(&self) -> Option<OwnedMutexGuard<()>> {
        if self.is_active() {
            return None;
        }
        let guard = Arc::clone(&self.poll_turn).try_lock_owned().ok()?;
        // A scan may have started between the check and the lock
        if self.is_active() {
            return None;
        }
        Some(guard)
    }

    /// Scan every GPIO in the configured range, except bus pins and pins
    /// with a manual binding.
    pub fn start_gpio_scan(self: &Arc<Self>) -> EngineResult<ScanHandle> {
        let targets: Vec<u8> = (self.config.gpio_first..=self.config.gpio_last)
            .filter(|pin| board::is_gpio(*pin) && !board::is_bus_pin(*pin))
            .filter(|pin| !self.store.is_manual(*pin))
            .collect();
        self.launch(ScanKind::GpioAll, targets)
    }

    /// Scan one GPIO pin.
    ///
    /// # Errors
    /// - `UnknownPin` if `pin` is not a header GPIO
    /// - `ReservedPin` if `pin` belongs to I2C, UART or SPI
    pub fn start_single_pin_scan(self: &Arc<Self>, pin: u8) -> EngineResult<ScanHandle> {
        if pin > board::MAX_BCM || !board::is_gpio(pin) {
            return Err(EngineError::UnknownPin(pin));
        }
        if board::is_bus_pin(pin) {
            return Err(EngineError::ReservedPin(pin));
        }
        self.launch(ScanKind::GpioSingle(pin), vec![pin])
    }

    /// Probe every I2C address in the configured range
    pub fn start_i2c_scan(self: &Arc<Self>) -> EngineResult<ScanHandle> {
        let targets = (self.config.i2c_first..=self.config.i2c_last).collect();
        self.launch(ScanKind::I2c, targets)
    }

    /// Cancel the running session. Returns false if nothing was running.
    pub fn stop_all(&self) -> bool {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.as_ref() {
            Some(token) => {
                info!("Stopping active scan");
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn launch(self: &Arc<Self>, kind: ScanKind, targets: Vec<u8>) -> EngineResult<ScanHandle> {
        let started = self.state_tx.send_if_modified(|state| {
            if state.is_active() {
                false
            } else {
                *state = ScanState::Starting(kind);
                true
            }
        });
        if !started {
            return Err(EngineError::ScanAlreadyRunning);
        }

        let session = ScanSession::new(
            kind,
            targets,
            self.config.plugin_timeout(),
            self.config.scan_deadline(),
        );
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.token.clone());

        info!(
            session = %session.id,
            %kind,
            targets = session.targets.len(),
            "Scan started"
        );

        let id = session.id;
        let token = session.token.clone();
        let this = Arc::clone(self);
        let join = tokio::spawn(async move { this.run(session).await });
        Ok(ScanHandle::new(id, kind, token, join))
    }

    async fn run(self: Arc<Self>, session: ScanSession) -> ScanReport {
        let kind = session.kind;
        // An in-flight poll tick yields at its next pin
        let turn = tokio::select! {
            turn = Arc::clone(&self.poll_turn).lock_owned() => Some(turn),
            _ = session.token.cancelled() => None,
        };
        let mut tally = Tally::default();

        let interrupt = if turn.is_some() {
            self.state_tx.send_replace(ScanState::Running(kind));
            match kind {
                ScanKind::GpioAll | ScanKind::GpioSingle(_) => self.run_gpio(&session, &mut tally).await,
                ScanKind::I2c => self.run_i2c(&session, &mut tally).await,
            }
        } else {
            debug!(session = %session.id, "Scan cancelled before taking the bus");
            Some(Interrupt::Cancelled)
        };

        let state = match interrupt {
            None => ScanState::Completed(kind),
            Some(Interrupt::Cancelled) => ScanState::Cancelled(kind),
            Some(Interrupt::DeadlineExceeded) => {
                warn!(session = %session.id, %kind, "Scan deadline exceeded");
                ScanState::TimedOut(kind)
            }
            Some(Interrupt::Fatal(e)) => {
                error!(session = %session.id, %kind, error = %e, "Scan aborted");
                self.store.raise_banner(format!("Scan aborted: {}", e));
                ScanState::TimedOut(kind)
            }
        };

        drop(turn);
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.state_tx.send_replace(state);

        let report = ScanReport {
            id: session.id,
            kind,
            state,
            visited: tally.visited,
            found: tally.found,
            timeouts: tally.timeouts,
            elapsed: session.elapsed(),
        };
        info!(
            session = %report.id,
            %state,
            visited = report.visited,
            found = report.found.len(),
            timeouts = report.timeouts,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Scan ended"
        );
        report
    }

    /// Checks done before each target
    fn checkpoint(session: &ScanSession) -> Option<Interrupt> {
        if session.token.is_cancelled() {
            Some(Interrupt::Cancelled)
        } else if session.past_deadline() {
            Some(Interrupt::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Sleep between targets. False if cancelled while waiting.
    async fn pause(token: &CancelToken, delay: Duration) -> bool {
        if delay.is_zero() {
            return !token.is_cancelled();
        }
        tokio::select! {
            _ = token.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }

    fn context(&self) -> PluginContext {
        PluginContext::new(Arc::clone(&self.hardware), self.gate.clone(), LeaseOwner::Scan)
            .with_role_pins(self.store.role_pin_assignments())
    }

    async fn run_gpio(&self, session: &ScanSession, tally: &mut Tally) -> Option<Interrupt> {
        let ctx = self.context();
        for &pin in &session.targets {
            if let Some(interrupt) = Self::checkpoint(session) {
                return Some(interrupt);
            }
            if !Self::pause(&session.token, self.config.pin_delay()).await {
                return Some(Interrupt::Cancelled);
            }

            tally.visited += 1;
            match self.probe_pin(session, pin, &ctx, tally).await {
                PinOutcome::Found => tally.found.push(pin),
                PinOutcome::Empty => {}
                PinOutcome::Interrupted(interrupt) => return Some(interrupt),
            }
        }
        None
    }

    async fn probe_pin(
        &self,
        session: &ScanSession,
        pin: u8,
        ctx: &PluginContext,
        tally: &mut Tally,
    ) -> PinOutcome {
        let mut timed_out: Option<String> = None;
        let previous = self.store.get(PinKey::Gpio(pin));

        for handle in self.registry.auto_detectable() {
            if session.token.is_cancelled() {
                self.restore_row(pin, previous.as_ref());
                return PinOutcome::Interrupted(Interrupt::Cancelled);
            }
            let name = handle.name();
            self.store.set_marker(pin, format!("Scan {}", name), Color::Yellow);

            match timeout(session.plugin_timeout, handle.plugin.detect(pin, ctx)).await {
                Ok(Ok(Some(detection))) => {
                    debug!(pin, plugin = name, info = %detection.info, "Sensor detected");
                    self.store.set_reading(pin, &detection);
                    if !self.store.is_manual(pin) {
                        let role = match handle.descriptor.pin_roles.as_slice() {
                            [only] => Some(only.clone()),
                            _ => None,
                        };
                        self.store.assign(pin, Binding::detected(name, role));
                    }
                    return PinOutcome::Found;
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    if let Some(fatal) = fatal_cause(&e) {
                        self.restore_row(pin, previous.as_ref());
                        return PinOutcome::Interrupted(Interrupt::Fatal(fatal));
                    }
                    debug!(pin, plugin = name, error = %e, "Detect failed");
                }
                Err(_) => {
                    let err = EngineError::DetectTimeout {
                        plugin: name.to_string(),
                        pin,
                        timeout: session.plugin_timeout,
                    };
                    warn!(pin, plugin = name, error = %err, "Plugin detect timed out");
                    tally.timeouts += 1;
                    let marker = format!("Timeout {}", name);
                    self.store.set_marker(pin, marker.clone(), Color::Red);
                    timed_out = Some(marker);
                }
            }
        }

        if self.store.is_manual(pin) {
            // The binding stays and so does its last reading
            self.restore_row(pin, previous.as_ref());
            return PinOutcome::Empty;
        }
        self.store.forget_detected(pin);
        self.store.mark_unassigned(pin);
        if let Some(marker) = timed_out {
            self.store.update(PinKey::Gpio(pin), |row| row.info = marker);
        }
        PinOutcome::Empty
    }

    /// Put back the sensor columns a probe overwrote with its markers
    fn restore_row(&self, pin: u8, previous: Option<&PinState>) {
        let Some(previous) = previous else {
            return;
        };
        self.store.update(PinKey::Gpio(pin), |row| {
            row.sensor = previous.sensor.clone();
            row.info = previous.info.clone();
            row.color = previous.color;
            row.available = previous.available;
            row.updated_at = previous.updated_at;
        });
    }

    async fn run_i2c(&self, session: &ScanSession, tally: &mut Tally) -> Option<Interrupt> {
        if !self.hardware.i2c_available() {
            let err = EngineError::HardwareUnavailable("I2C".to_string());
            warn!(backend = self.hardware.backend_name(), error = %err, "I2C scan skipped");
            self.store.raise_banner(err.to_string());
            return None;
        }
        self.store.clear_banner(I2C_UNAVAILABLE_BANNER);

        for &address in &session.targets {
            if let Some(interrupt) = Self::checkpoint(session) {
                return Some(interrupt);
            }

            tally.visited += 1;
            let acked = {
                let _lease = match self.gate.acquire(LeaseOwner::Scan).await {
                    Ok(lease) => lease,
                    Err(e) => return Some(Interrupt::Fatal(e)),
                };
                timeout(session.plugin_timeout, self.hardware.i2c_probe(address)).await
            };

            match acked {
                Ok(Ok(true)) => {
                    debug!(address = format_args!("0x{:02X}", address), "I2C device acknowledged");
                    self.store.upsert_i2c_device(address);
                    tally.found.push(address);
                }
                Ok(Ok(false)) => {}
                Ok(Err(e)) => debug!(address, error = %e, "I2C probe failed"),
                Err(_) => {
                    warn!(address, "I2C probe timed out");
                    tally.timeouts += 1;
                }
            }

            if !Self::pause(&session.token, self.config.i2c_delay()).await {
                return Some(Interrupt::Cancelled);
            }
        }

        let removed = self.store.retain_i2c_devices(&tally.found);
        if removed > 0 {
            debug!(removed, "Dropped stale I2C rows");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::MockBus;
    use crate::plugin::scripted::ScriptedPlugin;
    use crate::plugin::{Detection, PluginDescriptor};
    use tracing_test::traced_test;

    fn fast_config() -> ScanConfig {
        ScanConfig {
            plugin_timeout_ms: 50,
            pin_delay_ms: 0,
            i2c_delay_ms: 0,
            ..ScanConfig::default()
        }
    }

    fn coordinator(registry: PluginRegistry, bus: MockBus) -> Arc<ScanCoordinator> {
        Arc::new(ScanCoordinator::new(
            Arc::new(registry),
            Arc::new(bus),
            HardwareGate::new(Duration::from_secs(5)),
            Arc::new(PinStateStore::new()),
            fast_config(),
        ))
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let mut registry = PluginRegistry::new();
        registry
            .register(
                PluginDescriptor::new("Slow").auto_detectable(true),
                Arc::new(ScriptedPlugin::new("Slow").with_delay(Duration::from_millis(20))),
            )
            .unwrap();
        let coordinator = coordinator(registry, MockBus::new());

        let handle = coordinator.start_gpio_scan().unwrap();
        assert!(matches!(
            coordinator.start_i2c_scan(),
            Err(EngineError::ScanAlreadyRunning)
        ));
        assert!(coordinator.try_poll_turn().is_none());

        coordinator.stop_all();
        handle.wait().await.unwrap();
        assert!(coordinator.try_poll_turn().is_some());
    }

    #[tokio::test]
    async fn single_pin_scan_validates_pin() {
        let coordinator = coordinator(PluginRegistry::new(), MockBus::new());
        assert!(matches!(
            coordinator.start_single_pin_scan(2),
            Err(EngineError::ReservedPin(2))
        ));
        assert!(matches!(
            coordinator.start_single_pin_scan(30),
            Err(EngineError::UnknownPin(30))
        ));
        assert_eq!(coordinator.state(), ScanState::Idle);
    }

    #[tokio::test]
    async fn missing_i2c_bus_completes_with_banner() {
        let coordinator = coordinator(PluginRegistry::new(), MockBus::new().without_i2c());
        let report = coordinator.start_i2c_scan().unwrap().wait().await.unwrap();

        assert_eq!(report.state, ScanState::Completed(ScanKind::I2c));
        assert_eq!(report.visited, 0);
        let banners = coordinator.store.banners();
        assert_eq!(banners[0].message, I2C_UNAVAILABLE_BANNER);
    }

    #[tokio::test]
    #[traced_test]
    async fn hung_detect_times_out_and_next_plugin_runs() {
        let mut registry = PluginRegistry::new();
        registry
            .register(
                PluginDescriptor::new("Hang").auto_detectable(true),
                Arc::new(ScriptedPlugin::new("Hang").hangs_on(17)),
            )
            .unwrap();
        registry
            .register(
                PluginDescriptor::new("Probe").auto_detectable(true),
                Arc::new(ScriptedPlugin::new("Probe").detects_on(17, "here")),
            )
            .unwrap();
        let coordinator = coordinator(registry, MockBus::new());

        let session = ScanSession::new(ScanKind::GpioSingle(17), vec![17], Duration::from_millis(30), None);
        let ctx = coordinator.context();
        let mut tally = Tally::default();
        let outcome = coordinator.probe_pin(&session, 17, &ctx, &mut tally).await;

        assert!(matches!(outcome, PinOutcome::Found));
        assert_eq!(tally.timeouts, 1);
        assert_eq!(coordinator.gate.outstanding(), 0);
        assert_eq!(coordinator.store.get(PinKey::Gpio(17)).unwrap().info, "here");
        assert!(logs_contain("Plugin detect timed out"));
    }

    #[tokio::test]
    async fn cancelled_probe_restores_previous_row() {
        let mut registry = PluginRegistry::new();
        registry
            .register(
                PluginDescriptor::new("Slow").auto_detectable(true),
                Arc::new(ScriptedPlugin::new("Slow").with_delay(Duration::from_millis(20))),
            )
            .unwrap();
        registry
            .register(
                PluginDescriptor::new("Probe").auto_detectable(true),
                Arc::new(ScriptedPlugin::new("Probe").detects_on(17, "here")),
            )
            .unwrap();
        let coordinator = coordinator(registry, MockBus::new());
        coordinator
            .store
            .set_reading(17, &Detection::new("DHT22", "21.0°C / 40.0%", Color::Green));
        let before = coordinator.store.get(PinKey::Gpio(17)).unwrap();

        let session = ScanSession::new(ScanKind::GpioSingle(17), vec![17], Duration::from_millis(50), None);
        let token = session.token.clone();
        let canceller = tokio::spawn(async move {
            sleep(Duration::from_millis(5)).await;
            token.cancel();
        });
        let ctx = coordinator.context();
        let mut tally = Tally::default();
        let outcome = coordinator.probe_pin(&session, 17, &ctx, &mut tally).await;
        canceller.await.unwrap();

        assert!(matches!(outcome, PinOutcome::Interrupted(Interrupt::Cancelled)));
        assert_eq!(coordinator.store.get(PinKey::Gpio(17)).unwrap(), before);
    }

    #[tokio::test]
    async fn cancel_while_waiting_for_poll_turn() {
        let coordinator = coordinator(PluginRegistry::new(), MockBus::new());
        let turn = coordinator.try_poll_turn().unwrap();

        let handle = coordinator.start_gpio_scan().unwrap();
        assert_eq!(coordinator.state(), ScanState::Starting(ScanKind::GpioAll));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(coordinator.state(), ScanState::Starting(ScanKind::GpioAll));

        assert!(coordinator.stop_all());
        let report = tokio::time::timeout(Duration::from_millis(100), handle.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.state, ScanState::Cancelled(ScanKind::GpioAll));
        assert_eq!(report.visited, 0);
        drop(turn);
    }

    #[tokio::test]
    async fn stop_without_session_reports_false() {
        let coordinator = coordinator(PluginRegistry::new(), MockBus::new());
        assert!(!coordinator.stop_all());
    }
}
