//! Hardware Access Gate
//!
//! A single-permit, FIFO-fair gate around the physical bus. GPIO hardware is
//! not reentrant across overlapping pin configurations, so every physical
//! operation performed by a plugin, the scan coordinator or the poller holds a
//! `Lease` for exactly the duration of that operation.
//!
//! # Design
//!
//! 1. A `tokio::sync::Semaphore` with one permit; tokio's semaphore is FIFO,
//!    so waiters are served in arrival order and the poller cannot starve.
//! 2. `Lease` owns the permit and releases it on drop, which covers early
//!    returns, `?`, panics and futures dropped by `tokio::time::timeout`.
//! 3. Grants are tagged with a `LeaseOwner` and counted so tests can prove who
//!    touched the bus and when.
//! 4. Waiting longer than the stall bound means some lease was never released.
//!    That is an invariant violation and surfaces as `EngineError::GateStalled`.
//!
//! ```rust,ignore
//! let gate = HardwareGate::new(Duration::from_secs(30));
//! {
//!     let _lease = gate.acquire(LeaseOwner::Scan).await?;
//!     hw.setup_pin(17, Direction::Input, Pull::Up).await?;
//! } // released here
//! ```

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{error, trace};

use crate::error::EngineError;

/// Component on whose behalf a lease is held
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseOwner {
    /// Scan coordinator or a plugin running inside a scan
    Scan,
    /// Periodic poller or a plugin running inside a poll tick
    Poller,
    /// Interactive requests (row details, level refresh)
    Inspector,
}

impl LeaseOwner {
    fn index(self) -> usize {
        match self {
            LeaseOwner::Scan => 0,
            LeaseOwner::Poller => 1,
            LeaseOwner::Inspector => 2,
        }
    }
}

/// Shared state behind a gate handle.
struct GateInner {
    /// One permit = exclusive bus access
    semaphore: Arc<Semaphore>,
    /// Longest acceptable wait for a lease
    stall_timeout: Duration,
    /// Leases currently alive
    outstanding: AtomicUsize,
    /// Grants per owner, indexed by `LeaseOwner::index`
    grants: [AtomicU64; 3],
}

/// Counters describing gate usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateStats {
    /// Leases alive right now (0 or 1)
    pub outstanding: usize,
    /// Leases granted to the scan coordinator
    pub scan_grants: u64,
    /// Leases granted to the poller
    pub poller_grants: u64,
    /// Leases granted to interactive requests
    pub inspector_grants: u64,
}

/// Cloneable handle to the bus gate; every clone shares the same permit.
#[derive(Clone)]
pub struct HardwareGate {
    inner: Arc<GateInner>,
}

impl HardwareGate {
    /// Create a gate that reports a stall after `stall_timeout`
    pub fn new(stall_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(GateInner {
                semaphore: Arc::new(Semaphore::new(1)),
                stall_timeout,
                outstanding: AtomicUsize::new(0),
                grants: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
            }),
        }
    }

    /// Wait for exclusive bus access.
    ///
    /// # Errors
    /// - `GateStalled` if no lease could be granted within the stall bound
    /// - `GateClosed` if the gate was closed during shutdown
    pub async fn acquire(&self, owner: LeaseOwner) -> Result<Lease, EngineError> {
        let wait = tokio::time::timeout(
            self.inner.stall_timeout,
            Arc::clone(&self.inner.semaphore).acquire_owned(),
        )
        .await;

        let permit = match wait {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(EngineError::GateClosed),
            Err(_) => {
                error!(
                    ?owner,
                    waited_ms = self.inner.stall_timeout.as_millis() as u64,
                    "Hardware gate stalled: a lease was never released"
                );
                return Err(EngineError::GateStalled {
                    waited: self.inner.stall_timeout,
                });
            }
        };

        Ok(self.grant(owner, permit))
    }

    /// Take the lease only if the bus is free right now.
    pub fn try_acquire(&self, owner: LeaseOwner) -> Option<Lease> {
        let permit = Arc::clone(&self.inner.semaphore).try_acquire_owned().ok()?;
        Some(self.grant(owner, permit))
    }

    fn grant(&self, owner: LeaseOwner, permit: OwnedSemaphorePermit) -> Lease {
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        self.inner.grants[owner.index()].fetch_add(1, Ordering::Relaxed);
        trace!(?owner, "Lease granted");
        Lease {
            _permit: permit,
            inner: Arc::clone(&self.inner),
            owner,
        }
    }

    /// Refuse all future leases; pending waiters get `GateClosed`.
    pub fn close(&self) {
        self.inner.semaphore.close();
    }

    /// Snapshot of the gate counters
    pub fn stats(&self) -> GateStats {
        GateStats {
            outstanding: self.inner.outstanding.load(Ordering::SeqCst),
            scan_grants: self.inner.grants[0].load(Ordering::Relaxed),
            poller_grants: self.inner.grants[1].load(Ordering::Relaxed),
            inspector_grants: self.inner.grants[2].load(Ordering::Relaxed),
        }
    }

    /// Leases currently alive
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Total leases ever granted to `owner`
    pub fn grants(&self, owner: LeaseOwner) -> u64 {
        self.inner.grants[owner.index()].load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for HardwareGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareGate")
            .field("stall_timeout", &self.inner.stall_timeout)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Scoped exclusive bus access. Dropping it releases the bus.
#[must_use = "the bus is released as soon as the lease is dropped"]
pub struct Lease {
    _permit: OwnedSemaphorePermit,
    inner: Arc<GateInner>,
    owner: LeaseOwner,
}

impl Lease {
    /// Who holds this lease
    pub fn owner(&self) -> LeaseOwner {
        self.owner
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.inner.outstanding.fetch_sub(1, Ordering::SeqCst);
        trace!(owner = ?self.owner, "Lease released");
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("owner", &self.owner).finish()
    }
}
