//! End-to-end tests for the sensor engine: scans, cancellation, polling and
//! manual assignment against the mock bus.

use std::sync::Arc;
use std::time::Duration;

use pinscan::config::EngineConfig;
use pinscan::engine::{PinKey, ScanKind, ScanState, SensorEngine, TickOutcome};
use pinscan::engine::PinMode;
use pinscan::hardware::{HardwareAccess, LeaseOwner, MockBus};
use pinscan::plugin::builtin::{BuiltinDriver, DriverDefaults};
use pinscan::plugin::scripted::ScriptedPlugin;
use pinscan::plugin::{Color, DriverOptions, PluginDescriptor, PluginRegistry};
use pinscan::EngineError;

/// GPIO pins a full scan visits: BCM 2..=27 without bus pins
const SCANNABLE: usize = 17;

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.scan.plugin_timeout_ms = 30;
    config.scan.pin_delay_ms = 0;
    config.scan.i2c_delay_ms = 0;
    config.poller.read_timeout_ms = 30;
    config.poller.refresh_levels = false;
    config
}

fn engine_with(registry: PluginRegistry, bus: MockBus) -> SensorEngine {
    engine_with_config(fast_config(), registry, bus)
}

fn engine_with_config(config: EngineConfig, registry: PluginRegistry, bus: MockBus) -> SensorEngine {
    let hardware: Arc<dyn HardwareAccess> = Arc::new(bus);
    SensorEngine::new(config, hardware, registry)
}

fn slow_registry() -> PluginRegistry {
    let slow = Arc::new(ScriptedPlugin::new("Slow").with_delay(Duration::from_millis(20)));
    let mut registry = PluginRegistry::new();
    registry.register(auto("Slow"), slow).unwrap();
    registry
}

fn auto(name: &str) -> PluginDescriptor {
    PluginDescriptor::new(name).auto_detectable(true)
}

#[tokio::test]
async fn gpio_scan_takes_first_match_in_registration_order() {
    let first = Arc::new(ScriptedPlugin::new("First").detects_on(17, "first"));
    let second = Arc::new(
        ScriptedPlugin::new("Second")
            .detects_on(17, "second")
            .detects_on(22, "second")
            .with_color(Color::Cyan),
    );
    let mut registry = PluginRegistry::new();
    registry.register(auto("First"), first.clone()).unwrap();
    registry.register(auto("Second"), second.clone()).unwrap();
    let engine = engine_with(registry, MockBus::new());

    let report = engine.start_gpio_scan().unwrap().wait().await.unwrap();

    assert_eq!(report.state, ScanState::Completed(ScanKind::GpioAll));
    assert_eq!(report.visited, SCANNABLE);
    assert_eq!(report.found, vec![17, 22]);

    let row = engine.store().get(PinKey::Gpio(17)).unwrap();
    assert_eq!(row.sensor.as_deref(), Some("First"));
    assert_eq!(row.info, "first");
    let row = engine.store().get(PinKey::Gpio(22)).unwrap();
    assert_eq!(row.sensor.as_deref(), Some("Second"));
    assert_eq!(row.color, Color::Cyan);

    let row = engine.store().get(PinKey::Gpio(5)).unwrap();
    assert_eq!(row.sensor_label(), "-");
    assert_eq!(row.color, Color::Red);

    // The winner ends the pin; bus pins are never probed
    assert!(!second.probed_pins().contains(&17));
    assert!(!first.probed_pins().contains(&2));
    assert_eq!(engine.scan_state(), ScanState::Completed(ScanKind::GpioAll));
    assert_eq!(engine.gate_stats().outstanding, 0);
}

#[tokio::test]
async fn stop_all_cancels_within_one_timeout() {
    let slow = Arc::new(ScriptedPlugin::new("Slow").with_delay(Duration::from_millis(20)));
    let mut registry = PluginRegistry::new();
    registry.register(auto("Slow"), slow).unwrap();
    let engine = engine_with(registry, MockBus::new());

    let handle = engine.start_gpio_scan().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(engine.stop_all());

    let report = tokio::time::timeout(Duration::from_millis(200), handle.wait())
        .await
        .expect("scan did not stop in time")
        .unwrap();
    assert_eq!(report.state, ScanState::Cancelled(ScanKind::GpioAll));
    assert!(report.visited < SCANNABLE);
    assert_eq!(engine.gate_stats().outstanding, 0);

    // A stopped session accepts a new start
    let again = engine.start_single_pin_scan(17).unwrap();
    again.wait().await.unwrap();
}

#[tokio::test]
async fn poller_stays_off_the_bus_during_a_scan() {
    let probe = Arc::new(
        ScriptedPlugin::new("Probe")
            .reads("reading")
            .with_delay(Duration::from_millis(10)),
    );
    let mut registry = PluginRegistry::new();
    registry.register(auto("Probe"), probe.clone()).unwrap();
    let engine = engine_with(registry, MockBus::new());
    engine.assign(17, "Probe").unwrap();

    let handle = engine.start_gpio_scan().unwrap();
    for _ in 0..5 {
        assert_eq!(engine.poll_once().await, TickOutcome::Skipped);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(probe.read_calls(), 0);
    assert_eq!(engine.gate_stats().poller_grants, 0);

    engine.stop_all();
    handle.wait().await.unwrap();
    assert!(matches!(engine.poll_once().await, TickOutcome::Ran { reads: 1, .. }));
    assert_eq!(engine.poll_stats().ticks_skipped, 5);
    assert_eq!(engine.gate_stats().poller_grants, 1);
}

#[tokio::test]
async fn hung_plugin_does_not_block_later_pins() {
    let hang = Arc::new(ScriptedPlugin::new("Hang").hangs_on(4).hangs_on(5).hangs_on(6));
    let probe = Arc::new(ScriptedPlugin::new("Probe").detects_on(6, "late").detects_on(27, "end"));
    let mut registry = PluginRegistry::new();
    registry.register(auto("Hang"), hang).unwrap();
    registry.register(auto("Probe"), probe).unwrap();
    let engine = engine_with(registry, MockBus::new());

    let report = engine.start_gpio_scan().unwrap().wait().await.unwrap();

    assert_eq!(report.state, ScanState::Completed(ScanKind::GpioAll));
    assert_eq!(report.timeouts, 3);
    assert_eq!(report.found, vec![6, 27]);
    // pins x plugins x timeout, with headroom
    assert!(report.elapsed < Duration::from_millis((SCANNABLE * 2 * 30) as u64 + 500));

    let row = engine.store().get(PinKey::Gpio(4)).unwrap();
    assert_eq!(row.sensor_label(), "-");
    assert_eq!(row.info, "Timeout Hang");
    assert_eq!(engine.gate_stats().outstanding, 0);
}

#[tokio::test]
async fn assigned_dht22_is_polled_until_unassigned() {
    let options = DriverOptions::default();
    let dht = BuiltinDriver::Dht22.instantiate("DHT22", &options, &DriverDefaults::default());
    let mut registry = PluginRegistry::new();
    registry.register(auto("DHT22"), dht).unwrap();
    let engine = engine_with(registry, MockBus::new().with_dht22(17, 23.1, 45.2));

    engine.assign(17, "DHT22").unwrap();
    assert_eq!(engine.poll_once().await, TickOutcome::Ran { reads: 1, failures: 0 });
    let row = engine.store().get(PinKey::Gpio(17)).unwrap();
    assert_eq!(row.sensor.as_deref(), Some("DHT22"));
    assert_eq!(row.info, "23.1°C / 45.2%");

    assert!(engine.unassign(17).unwrap());
    let row = engine.store().get(PinKey::Gpio(17)).unwrap();
    assert_eq!(row.sensor, None);
    assert_eq!(engine.poll_once().await, TickOutcome::Ran { reads: 0, failures: 0 });
}

#[tokio::test]
async fn i2c_scan_marks_acknowledging_addresses() {
    let engine = engine_with(PluginRegistry::new(), MockBus::new().with_i2c_devices([0x23, 0x40]));

    let report = engine.start_i2c_scan().unwrap().wait().await.unwrap();

    assert_eq!(report.state, ScanState::Completed(ScanKind::I2c));
    assert_eq!(report.visited, 0x77 - 0x03 + 1);
    assert_eq!(report.found, vec![0x23, 0x40]);
    assert_eq!(engine.store().i2c_devices(), vec![0x23, 0x40]);

    let row = engine.store().get(PinKey::I2c(0x40)).unwrap();
    assert_eq!(row.sensor.as_deref(), Some("I2C"));
    assert_eq!(row.info, "Addr 0x40");
    assert!(engine.banners().is_empty());
}

#[tokio::test]
async fn scans_leave_manual_bindings_alone() {
    let probe = Arc::new(ScriptedPlugin::new("Probe").detects_on(17, "found").reads("manual read"));
    let mut registry = PluginRegistry::new();
    registry.register(auto("Probe"), probe.clone()).unwrap();
    let engine = engine_with(registry, MockBus::new());
    engine.assign(17, "Probe").unwrap();

    engine.start_gpio_scan().unwrap().wait().await.unwrap();
    assert!(!probe.probed_pins().contains(&17));
    assert!(engine.store().is_manual(17));

    // A single-pin scan still probes, and the manual binding stays
    engine.start_single_pin_scan(17).unwrap().wait().await.unwrap();
    assert!(probe.probed_pins().contains(&17));
    assert!(engine.store().is_manual(17));
}

#[tokio::test]
async fn concurrent_start_is_rejected() {
    let slow = Arc::new(ScriptedPlugin::new("Slow").with_delay(Duration::from_millis(20)));
    let mut registry = PluginRegistry::new();
    registry.register(auto("Slow"), slow).unwrap();
    let engine = engine_with(registry, MockBus::new());
    let mut states = engine.subscribe();

    let handle = engine.start_gpio_scan().unwrap();
    assert_eq!(engine.scan_state(), ScanState::Starting(ScanKind::GpioAll));
    assert!(matches!(engine.start_gpio_scan(), Err(EngineError::ScanAlreadyRunning)));
    assert!(matches!(engine.start_i2c_scan(), Err(EngineError::ScanAlreadyRunning)));
    states.wait_for(|s| s.is_running()).await.unwrap();
    assert!(matches!(engine.start_i2c_scan(), Err(EngineError::ScanAlreadyRunning)));

    handle.cancel();
    states.wait_for(|s| !s.is_active()).await.unwrap();
    assert_eq!(engine.scan_state(), ScanState::Cancelled(ScanKind::GpioAll));
}

#[tokio::test]
async fn reserved_pins_are_rejected_synchronously() {
    let engine = engine_with(PluginRegistry::new(), MockBus::new());
    assert!(matches!(engine.start_single_pin_scan(14), Err(EngineError::ReservedPin(14))));
    assert!(matches!(engine.start_single_pin_scan(0), Err(EngineError::UnknownPin(0))));
    assert_eq!(engine.scan_state(), ScanState::Idle);
}

#[tokio::test]
async fn poller_takes_no_lease_once_scan_is_running() {
    let mut config = fast_config();
    config.poller.refresh_levels = true;
    let bus = MockBus::new().with_op_delay(Duration::from_millis(5));
    let engine = Arc::new(engine_with_config(config, slow_registry(), bus));

    let tick = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.poll_once().await })
    };
    tokio::time::sleep(Duration::from_millis(12)).await;
    assert!(engine.gate_stats().poller_grants > 0);

    let mut states = engine.subscribe();
    let handle = engine.start_gpio_scan().unwrap();
    states.wait_for(|s| s.is_running()).await.unwrap();
    let grants = engine.gate_stats().poller_grants;

    // The in-flight tick yielded before the scan took the bus
    assert!(matches!(tick.await.unwrap(), TickOutcome::Ran { .. }));
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(engine.gate_stats().poller_grants, grants);

    engine.stop_all();
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn stalled_level_refresh_does_not_block_stop() {
    let mut config = fast_config();
    config.poller.refresh_levels = true;
    config.poller.interval_ms = 10;
    let engine = engine_with_config(config, slow_registry(), MockBus::new().stall_pin(6));

    assert!(engine.spawn_poller());
    tokio::time::sleep(Duration::from_millis(5)).await;

    let handle = engine.start_single_pin_scan(17).unwrap();
    assert!(engine.stop_all());
    let report = tokio::time::timeout(Duration::from_millis(200), handle.wait())
        .await
        .expect("scan did not stop in time")
        .unwrap();
    assert_eq!(report.state, ScanState::Cancelled(ScanKind::GpioSingle(17)));

    engine.shutdown().await;
    assert_eq!(engine.gate_stats().outstanding, 0);
}

#[tokio::test]
async fn level_refresh_is_bounded_per_pin() {
    let mut config = fast_config();
    config.poller.refresh_levels = true;
    let engine = engine_with_config(config, PluginRegistry::new(), MockBus::new().stall_pin(6));

    let outcome = tokio::time::timeout(Duration::from_millis(500), engine.poll_once())
        .await
        .expect("tick did not finish");
    assert_eq!(outcome, TickOutcome::Ran { reads: 0, failures: 0 });

    let row = engine.store().get(PinKey::Gpio(6)).unwrap();
    assert_eq!(row.mode, PinMode::Unassigned);
    assert_eq!(engine.gate_stats().outstanding, 0);
}

#[tokio::test]
async fn stalled_gate_aborts_scan_with_banner() {
    let mut config = fast_config();
    config.scan.plugin_timeout_ms = 500;
    config.gate.stall_timeout_ms = 30;
    let probe = Arc::new(ScriptedPlugin::new("Probe").detects_on(17, "found"));
    let mut registry = PluginRegistry::new();
    registry.register(auto("Probe"), probe).unwrap();
    let engine = engine_with_config(config, registry, MockBus::new());

    let lease = engine.gate().acquire(LeaseOwner::Inspector).await.unwrap();
    let report = engine.start_gpio_scan().unwrap().wait().await.unwrap();
    drop(lease);

    assert_eq!(report.state, ScanState::TimedOut(ScanKind::GpioAll));
    assert_eq!(report.visited, 1);
    let banners = engine.banners();
    assert_eq!(banners.len(), 1);
    assert!(banners[0].message.starts_with("Scan aborted:"));
    assert_eq!(engine.gate_stats().outstanding, 0);
}

#[tokio::test]
async fn scan_deadline_ends_session_as_timed_out() {
    let mut config = fast_config();
    config.scan.scan_deadline_ms = 30;
    let engine = engine_with_config(config, slow_registry(), MockBus::new());

    let report = engine.start_gpio_scan().unwrap().wait().await.unwrap();

    assert_eq!(report.state, ScanState::TimedOut(ScanKind::GpioAll));
    assert!(report.visited < SCANNABLE);
    assert!(engine.banners().is_empty());
    assert_eq!(engine.scan_state(), ScanState::TimedOut(ScanKind::GpioAll));
}

#[tokio::test]
async fn single_pin_scan_keeps_manual_reading_without_match() {
    let probe = Arc::new(ScriptedPlugin::new("Probe").reads("manual read"));
    let mut registry = PluginRegistry::new();
    registry.register(auto("Probe"), probe.clone()).unwrap();
    let engine = engine_with(registry, MockBus::new());

    engine.assign(17, "Probe").unwrap();
    engine.poll_once().await;
    let before = engine.store().get(PinKey::Gpio(17)).unwrap();
    assert_eq!(before.sensor.as_deref(), Some("Probe"));

    let report = engine.start_single_pin_scan(17).unwrap().wait().await.unwrap();
    assert!(report.found.is_empty());
    assert!(probe.probed_pins().contains(&17));

    let row = engine.store().get(PinKey::Gpio(17)).unwrap();
    assert!(engine.store().is_manual(17));
    assert_eq!(row.sensor.as_deref(), Some("Probe"));
    assert_eq!(row.info, "manual read");
    assert_eq!(row.color, before.color);
}
