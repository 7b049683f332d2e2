//! Hardware layer
//!
//! - `access`: the `HardwareAccess` capability every physical operation goes through
//! - `gate`: single-permit bus gate handing out scoped leases
//! - `board`: 40-pin header tables
//! - `mock`: simulated bus for tests and demo runs
//! - `sysfs`: Linux `/sys/class/gpio` backend

pub mod access;
pub mod board;
pub mod gate;
pub mod mock;
pub mod sysfs;

pub use access::{DhtSample, Direction, HardwareAccess, Level, PinFunction, Pull};
pub use gate::{GateStats, HardwareGate, Lease, LeaseOwner};
pub use mock::MockBus;
pub use sysfs::SysfsGpio;

use std::sync::Arc;

use crate::config::{BackendKind, HardwareConfig};

/// Build the configured backend
pub fn from_config(config: &HardwareConfig) -> Arc<dyn HardwareAccess> {
    match config.backend {
        BackendKind::Mock => {
            Arc::new(MockBus::new().with_i2c_devices(config.mock_i2c_acks.iter().copied()))
        }
        BackendKind::Sysfs => Arc::new(SysfsGpio::new(config.sysfs_root.clone())),
    }
}
