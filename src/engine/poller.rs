//! Periodic Poller
//!
//! Refreshes the readings of assigned pins on a fixed interval. A tick never
//! overlaps a scan: it first asks the coordinator for the poll turn and is
//! skipped (and counted) when the turn is unavailable.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::PollerConfig;
use crate::engine::cancel::CancelToken;
use crate::engine::coordinator::ScanCoordinator;
use crate::engine::store::{Binding, PinKey, PinMode, PinStateStore};
use crate::error::EngineError;
use crate::hardware::{board, HardwareAccess, HardwareGate, LeaseOwner};
use crate::plugin::{
    AssignmentTarget, Color, Detection, PluginContext, PluginHandle, PluginRegistry, RoleMap,
};

/// Poller counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub ticks_run: u64,
    pub ticks_skipped: u64,
    /// Plugin reads attempted
    pub reads: u64,
    /// Reads that failed, timed out or returned nothing
    pub failures: u64,
}

/// What a single tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A scan owned the bus
    Skipped,
    Ran { reads: u64, failures: u64 },
}

#[derive(Default)]
struct Counters {
    ticks_run: AtomicU64,
    ticks_skipped: AtomicU64,
    reads: AtomicU64,
    failures: AtomicU64,
}

/// Background refresh of assigned pins
pub struct Poller {
    coordinator: Arc<ScanCoordinator>,
    registry: Arc<PluginRegistry>,
    hardware: Arc<dyn HardwareAccess>,
    gate: HardwareGate,
    store: Arc<PinStateStore>,
    config: PollerConfig,
    counters: Counters,
}

impl Poller {
    pub fn new(
        coordinator: Arc<ScanCoordinator>,
        registry: Arc<PluginRegistry>,
        hardware: Arc<dyn HardwareAccess>,
        gate: HardwareGate,
        store: Arc<PinStateStore>,
        config: PollerConfig,
    ) -> Self {
        Self {
            coordinator,
            registry,
            hardware,
            gate,
            store,
            config,
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> PollStats {
        PollStats {
            ticks_run: self.counters.ticks_run.load(Ordering::Relaxed),
            ticks_skipped: self.counters.ticks_skipped.load(Ordering::Relaxed),
            reads: self.counters.reads.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Run the poll loop until `token` is cancelled
    pub fn spawn(self: Arc<Self>, token: CancelToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_ms = self.config.interval_ms, "Poller started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                }
            }
            info!("Poller stopped");
        })
    }

    /// One poll pass over every binding
    pub async fn tick(&self) -> TickOutcome {
        let Some(_turn) = self.coordinator.try_poll_turn() else {
            self.counters.ticks_skipped.fetch_add(1, Ordering::Relaxed);
            trace!("Poll tick skipped, scan running");
            return TickOutcome::Skipped;
        };
        self.counters.ticks_run.fetch_add(1, Ordering::Relaxed);

        let ctx = PluginContext::new(
            Arc::clone(&self.hardware),
            self.gate.clone(),
            LeaseOwner::Poller,
        )
        .with_role_pins(self.store.role_pin_assignments());

        let mut reads = 0;
        let mut failures = 0;
        // Multi-role plugins, keyed by name, collected while walking the table
        let mut grouped: BTreeMap<String, Vec<(u8, Binding)>> = BTreeMap::new();

        for (pin, binding) in self.store.bindings() {
            match &binding.target {
                AssignmentTarget::I2c => {
                    self.store.update(PinKey::Gpio(pin), |row| {
                        row.sensor = Some("I2C".to_string());
                        row.info = "active".to_string();
                        row.color = Color::Yellow;
                        row.available = true;
                    });
                }
                AssignmentTarget::Plugin { name, .. } => {
                    let Some(handle) = self.registry.get(name) else {
                        warn!(pin, plugin = %name, "Bound plugin is not registered");
                        self.store.mark_unavailable(PinKey::Gpio(pin));
                        continue;
                    };
                    if handle.descriptor.is_multi_role() {
                        grouped.entry(name.clone()).or_default().push((pin, binding.clone()));
                        continue;
                    }
                    if self.coordinator.is_active() {
                        debug!("Scan started, ending poll tick early");
                        break;
                    }

                    reads += 1;
                    let result = timeout(self.config.read_timeout(), handle.plugin.read(pin, &ctx)).await;
                    if !self.apply(handle, &[pin], result) {
                        failures += 1;
                    }
                }
            }
        }

        for (name, members) in grouped {
            let Some(handle) = self.registry.get(&name) else {
                continue;
            };
            match self.role_map(handle, &members) {
                Ok(roles) => {
                    if self.coordinator.is_active() {
                        break;
                    }
                    reads += 1;
                    let pins: Vec<u8> = roles.pins().collect();
                    let result = timeout(
                        self.config.read_timeout(),
                        handle.plugin.read_with_roles(&roles, &ctx),
                    )
                    .await;
                    if !self.apply(handle, &pins, result) {
                        failures += 1;
                    }
                }
                Err(missing) => {
                    for (pin, _) in &members {
                        self.store.update(PinKey::Gpio(*pin), |row| {
                            row.sensor = Some(name.clone());
                            row.info = format!("awaiting {}", missing);
                            row.color = Color::Yellow;
                            row.available = true;
                        });
                    }
                }
            }
        }

        if self.config.refresh_levels {
            refresh_levels(
                &*self.hardware,
                &self.gate,
                &self.store,
                LeaseOwner::Poller,
                self.config.read_timeout(),
                || self.coordinator.is_active(),
            )
            .await;
        }

        self.counters.reads.fetch_add(reads, Ordering::Relaxed);
        self.counters.failures.fetch_add(failures, Ordering::Relaxed);
        debug!(reads, failures, "Poll tick done");
        TickOutcome::Ran { reads, failures }
    }

    /// Role map in descriptor order, or the first role nobody is bound to
    fn role_map(&self, handle: &PluginHandle, members: &[(u8, Binding)]) -> Result<RoleMap, String> {
        let mut roles = RoleMap::new();
        for role in &handle.descriptor.pin_roles {
            let pin = members
                .iter()
                .find(|(_, b)| b.role() == Some(role.as_str()))
                .map(|(pin, _)| *pin)
                .ok_or_else(|| role.clone())?;
            roles.insert(role.clone(), pin);
        }
        Ok(roles)
    }

    /// Record a read outcome on every pin it covers. False on failure.
    fn apply(
        &self,
        handle: &PluginHandle,
        pins: &[u8],
        result: Result<anyhow::Result<Option<Detection>>, tokio::time::error::Elapsed>,
    ) -> bool {
        let name = handle.name();
        match result {
            Ok(Ok(Some(detection))) => {
                for pin in pins {
                    self.store.set_reading(*pin, &detection);
                }
                return true;
            }
            Ok(Ok(None)) => debug!(plugin = name, ?pins, "No reading"),
            Ok(Err(e)) => warn!(plugin = name, ?pins, error = %e, "Read failed"),
            Err(_) => {
                let err = EngineError::ReadTimeout {
                    plugin: name.to_string(),
                    pin: pins.first().copied().unwrap_or_default(),
                    timeout: self.config.read_timeout(),
                };
                warn!(plugin = name, ?pins, error = %err, "Plugin read timed out");
            }
        }
        for pin in pins {
            self.store.mark_unavailable(PinKey::Gpio(*pin));
        }
        false
    }
}

/// Refresh the mode and level columns of every header GPIO
///
/// Takes one lease per pin and bounds each pin by `op_timeout`. Pins whose
/// function cannot be read show `N/A`. Stops before the next pin once
/// `should_yield` returns true.
pub async fn refresh_levels(
    hardware: &dyn HardwareAccess,
    gate: &HardwareGate,
    store: &PinStateStore,
    owner: LeaseOwner,
    op_timeout: Duration,
    should_yield: impl Fn() -> bool,
) {
    for (_, pin) in board::PHYS_TO_BCM {
        if should_yield() {
            debug!(pin, "Level refresh yielding to scan");
            return;
        }
        let reading = async {
            let _lease = gate.acquire(owner).await?;
            let mode = PinMode::from(hardware.pin_function(pin).await?);
            let level = match mode {
                PinMode::Input | PinMode::Output => Some(hardware.read_level(pin).await?),
                _ => None,
            };
            anyhow::Ok((mode, level))
        };
        match timeout(op_timeout, reading).await {
            Ok(Ok((mode, level))) => store.set_level(pin, mode, level),
            Ok(Err(e)) => {
                trace!(pin, error = %e, "Level refresh failed");
                store.set_level(pin, PinMode::Unassigned, None);
            }
            Err(_) => {
                warn!(pin, timeout_ms = op_timeout.as_millis() as u64, "Level refresh timed out");
                store.set_level(pin, PinMode::Unassigned, None);
            }
        }
    }
}
