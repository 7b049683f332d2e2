//! # pinscan
//!
//! Sensor scanning and polling engine for a Raspberry Pi style 40-pin header.
//! The engine discovers sensors on GPIO pins by asking pluggable drivers to
//! recognise them, probes the I2C bus, lets users bind pins to drivers by hand
//! and keeps the readings of bound pins fresh in the background.
//!
//! ## Crate Structure
//!
//! - **`config`**: `EngineConfig`, layered from defaults, `config/pinscan.toml`
//!   and `PINSCAN_` environment variables with `figment`.
//! - **`error`**: the `EngineError` taxonomy and `PluginLoadError`.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`hardware`**: the `HardwareAccess` capability, the single-permit
//!   `HardwareGate`, header pin tables and the mock and sysfs backends.
//! - **`plugin`**: the `SensorPlugin` contract, YAML manifests, built-in
//!   drivers and the `PluginRegistry`.
//! - **`engine`**: scan coordinator, periodic poller, pin state store and the
//!   `SensorEngine` facade.

pub mod config;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod plugin;

pub use config::EngineConfig;
pub use engine::SensorEngine;
pub use error::{EngineError, EngineResult};
