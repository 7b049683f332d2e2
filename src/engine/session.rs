//! Scan sessions and the scan state machine
//!
//! ```text
//! ┌──────┐  start_*()  ┌─────────┐  all targets done   ┌───────────┐
//! │ Idle │────────────▶│ Running │────────────────────▶│ Completed │
//! └──────┘             └────┬────┘                     └───────────┘
//!    ▲                      │ stop_all()                ┌───────────┐
//!    │                      ├──────────────────────────▶│ Cancelled │
//!    │                      │ deadline / gate stall     └───────────┘
//!    │                      │                           ┌───────────┐
//!    │                      └──────────────────────────▶│ TimedOut  │
//!    │                                                  └───────────┘
//!    └──────────── any terminal state accepts a new start ──────┘
//! ```

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::engine::cancel::CancelToken;
use crate::error::{EngineError, EngineResult};

/// What a session scans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanKind {
    /// Every scannable GPIO pin
    GpioAll,
    /// One GPIO pin
    GpioSingle(u8),
    /// Every I2C address in range
    I2c,
}

impl std::fmt::Display for ScanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanKind::GpioAll => write!(f, "GPIO scan"),
            ScanKind::GpioSingle(pin) => write!(f, "scan of BCM {}", pin),
            ScanKind::I2c => write!(f, "I2C scan"),
        }
    }
}

/// Coordinator state, published through a `watch` channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanState {
    #[default]
    Idle,
    /// Accepted, waiting for the poller to hand over the bus
    Starting(ScanKind),
    Running(ScanKind),
    Completed(ScanKind),
    Cancelled(ScanKind),
    TimedOut(ScanKind),
}

impl ScanState {
    pub fn is_running(&self) -> bool {
        matches!(self, ScanState::Running(_))
    }

    /// Starting or running: a session exists and has not ended
    pub fn is_active(&self) -> bool {
        matches!(self, ScanState::Starting(_) | ScanState::Running(_))
    }

    /// Terminal states and `Idle` accept a new start
    pub fn accepts_start(&self) -> bool {
        !self.is_active()
    }

    pub fn kind(&self) -> Option<ScanKind> {
        match self {
            ScanState::Idle => None,
            ScanState::Starting(k)
            | ScanState::Running(k)
            | ScanState::Completed(k)
            | ScanState::Cancelled(k)
            | ScanState::TimedOut(k) => Some(*k),
        }
    }
}

impl std::fmt::Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanState::Idle => write!(f, "idle"),
            ScanState::Starting(k) => write!(f, "{} starting", k),
            ScanState::Running(k) => write!(f, "{} running", k),
            ScanState::Completed(k) => write!(f, "{} finished", k),
            ScanState::Cancelled(k) => write!(f, "{} stopped", k),
            ScanState::TimedOut(k) => write!(f, "{} timed out", k),
        }
    }
}

/// One active scan
#[derive(Debug, Clone)]
pub struct ScanSession {
    pub id: Uuid,
    pub kind: ScanKind,
    /// Pins or addresses, ascending
    pub targets: Vec<u8>,
    pub token: CancelToken,
    pub plugin_timeout: Duration,
    pub deadline: Option<Duration>,
    pub started: Instant,
    pub started_at: DateTime<Utc>,
}

impl ScanSession {
    pub fn new(kind: ScanKind, targets: Vec<u8>, plugin_timeout: Duration, deadline: Option<Duration>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            targets,
            token: CancelToken::new(),
            plugin_timeout,
            deadline,
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn past_deadline(&self) -> bool {
        self.deadline.is_some_and(|d| self.elapsed() >= d)
    }
}

/// Summary of a finished session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub id: Uuid,
    pub kind: ScanKind,
    /// Terminal state the session ended in
    pub state: ScanState,
    /// Targets actually visited
    pub visited: usize,
    /// Pins with a detected sensor, or acknowledging I2C addresses
    pub found: Vec<u8>,
    /// Detect calls that hit the per-plugin timeout
    pub timeouts: usize,
    pub elapsed: Duration,
}

/// Handle to a running scan task
#[derive(Debug)]
pub struct ScanHandle {
    pub id: Uuid,
    pub kind: ScanKind,
    token: CancelToken,
    join: JoinHandle<ScanReport>,
}

impl ScanHandle {
    pub(crate) fn new(id: Uuid, kind: ScanKind, token: CancelToken, join: JoinHandle<ScanReport>) -> Self {
        Self {
            id,
            kind,
            token,
            join,
        }
    }

    /// Request cancellation of this session
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the session to end
    pub async fn wait(self) -> EngineResult<ScanReport> {
        self.join.await.map_err(|e| {
            EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("scan task failed: {}", e),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_accept_start() {
        assert!(ScanState::Idle.accepts_start());
        assert!(!ScanState::Running(ScanKind::I2c).accepts_start());
        assert!(!ScanState::Starting(ScanKind::I2c).accepts_start());
        assert!(!ScanState::Starting(ScanKind::I2c).is_running());
        for state in [
            ScanState::Completed(ScanKind::GpioAll),
            ScanState::Cancelled(ScanKind::GpioAll),
            ScanState::TimedOut(ScanKind::GpioAll),
        ] {
            assert!(state.accepts_start());
            assert_eq!(state.kind(), Some(ScanKind::GpioAll));
        }
    }

    #[test]
    fn state_display() {
        assert_eq!(ScanState::Running(ScanKind::I2c).to_string(), "I2C scan running");
        assert_eq!(
            ScanState::Cancelled(ScanKind::GpioSingle(17)).to_string(),
            "scan of BCM 17 stopped"
        );
    }

    #[test]
    fn deadline_is_optional() {
        let session = ScanSession::new(ScanKind::GpioAll, vec![4], Duration::from_millis(5), None);
        assert!(!session.past_deadline());
        let session = ScanSession::new(ScanKind::GpioAll, vec![4], Duration::from_millis(5), Some(Duration::ZERO));
        assert!(session.past_deadline());
    }
}
