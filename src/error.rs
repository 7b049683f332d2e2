//! Custom error types for the engine.
//!
//! This module defines `EngineError`, the error type shared by the plugin
//! registry, the hardware gate, the scan coordinator and the poller. It is
//! built with `thiserror` and follows one rule: errors raised by a single
//! plugin call are recorded and never escape the coordinator or the poller.
//!
//! ## Error Hierarchy
//!
//! - **Non-fatal, recorded**: `PluginLoad`, `DuplicatePlugin`, `DetectTimeout`,
//!   `ReadTimeout`.
//!   These are logged and reflected in the pin table, the engine keeps going.
//! - **Degrading**: `HardwareUnavailable`. The affected bus type becomes a
//!   no-op and a persistent banner is raised for the user.
//! - **Synchronous rejections**: `InvalidAssignment`, `ReservedPin`,
//!   `UnknownPin`, `ScanAlreadyRunning`. The command is refused and no state
//!   changes.
//! - **Fatal**: `GateStalled`, `GateClosed`. A lease that is never released
//!   would deadlock every component, so these abort the active scan.
//! - **Ambient**: `Config` (figment) and `Io`.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Plugin load error: {0}")]
    PluginLoad(PluginLoadError),

    #[error("Plugin '{plugin}' did not finish detect on BCM {pin} within {timeout:?}")]
    DetectTimeout {
        plugin: String,
        pin: u8,
        timeout: Duration,
    },

    #[error("Plugin '{plugin}' did not finish read on BCM {pin} within {timeout:?}")]
    ReadTimeout {
        plugin: String,
        pin: u8,
        timeout: Duration,
    },

    #[error("{0} bus not available")]
    HardwareUnavailable(String),

    #[error("Plugin '{0}' is already registered")]
    DuplicatePlugin(String),

    #[error("Invalid assignment: {0}")]
    InvalidAssignment(String),

    #[error("BCM {0} is reserved for a bus protocol and cannot be scanned")]
    ReservedPin(u8),

    #[error("BCM {0} is not a GPIO pin on this board")]
    UnknownPin(u8),

    #[error("A scan is already running")]
    ScanAlreadyRunning,

    #[error("Hardware gate stalled: no lease granted within {waited:?}")]
    GateStalled { waited: Duration },

    #[error("Hardware gate closed")]
    GateClosed,

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// True for invariant violations that must stop the active scan.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::GateStalled { .. } | EngineError::GateClosed)
    }

    /// True for errors the user caused and can correct without a restart.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidAssignment(_)
                | EngineError::ReservedPin(_)
                | EngineError::UnknownPin(_)
                | EngineError::ScanAlreadyRunning
        )
    }
}

/// Returns the fatal engine error carried by a plugin error, if any.
///
/// Plugins report failures through `anyhow`; a stalled gate surfaces as an
/// `EngineError` wrapped inside that chain.
pub fn fatal_cause(err: &anyhow::Error) -> Option<EngineError> {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<EngineError>())
        .find_map(|e| match e {
            EngineError::GateStalled { waited } => Some(EngineError::GateStalled { waited: *waited }),
            EngineError::GateClosed => Some(EngineError::GateClosed),
            _ => None,
        })
}

// =============================================================================
// Plugin Load Errors
// =============================================================================

/// Error that occurred while loading a plugin manifest
#[derive(Debug, Clone)]
pub struct PluginLoadError {
    /// Path to the file that failed to load
    pub file_path: PathBuf,
    /// The error message
    pub message: String,
    /// Validation errors (if any)
    pub validation_errors: Vec<ValidationError>,
}

impl PluginLoadError {
    pub(crate) fn new(file_path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            message: message.into(),
            validation_errors: vec![],
        }
    }
}

impl std::fmt::Display for PluginLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.file_path.display(), self.message)?;
        for err in &self.validation_errors {
            write!(f, "\n  - {}: {}", err.path, err.message)?;
        }
        Ok(())
    }
}

impl From<PluginLoadError> for EngineError {
    fn from(value: PluginLoadError) -> Self {
        EngineError::PluginLoad(value)
    }
}

/// A specific validation error within a plugin manifest
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Path to the invalid field (e.g., "pin_roles[1]")
    pub path: String,
    /// Human-readable error message
    pub message: String,
}
