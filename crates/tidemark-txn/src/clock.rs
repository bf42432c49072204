//! The process-wide commit clocks.
//!
//! [`TransactionClock`] owns the system SCN, the system GCN and the wall
//! clock. It is created once per storage engine, started at engine startup
//! and shut down with it, and handed to every component that needs it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tidemark_error::{Result, TidemarkError};
use tidemark_types::{Gcn, Scn, Utc};

// ---------------------------------------------------------------------------
// Wall clocks
// ---------------------------------------------------------------------------

/// Source of wall-clock commit time.
pub trait WallClock: Send + Sync {
    fn now(&self) -> Utc;
}

/// The operating-system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    #[allow(clippy::cast_possible_truncation)]
    fn now(&self) -> Utc {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_micros() as u64);
        Utc::from_micros(micros)
    }
}

/// Hand-driven clock for tests and replay.
#[derive(Debug)]
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Utc) -> Self {
        Self {
            micros: AtomicU64::new(start.as_micros()),
        }
    }

    pub fn set(&self, now: Utc) {
        self.micros.store(now.as_micros(), Ordering::SeqCst);
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn advance(&self, by: Duration) {
        self.micros.fetch_add(by.as_micros() as u64, Ordering::SeqCst);
    }
}

impl WallClock for ManualClock {
    fn now(&self) -> Utc {
        Utc::from_micros(self.micros.load(Ordering::SeqCst))
    }
}

// ---------------------------------------------------------------------------
// TransactionClock
// ---------------------------------------------------------------------------

/// System SCN and GCN plus the injected wall clock.
pub struct TransactionClock {
    /// Last allocated scn.
    scn: AtomicU64,
    /// Current system gcn; only moves up.
    gcn: AtomicU64,
    wall: Arc<dyn WallClock>,
    running: AtomicBool,
}

impl std::fmt::Debug for TransactionClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionClock")
            .field("scn", &self.load_scn())
            .field("gcn", &self.load_gcn())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl TransactionClock {
    /// Fresh clock: the first allocated scn is `Scn::RESERVED_MAX + 1` and the
    /// system gcn starts at `Gcn::INITIAL`.
    pub fn new(wall: Arc<dyn WallClock>) -> Self {
        Self::restore(Scn::RESERVED_MAX, Gcn::INITIAL, wall)
    }

    /// Clock resumed from persisted values.
    pub fn restore(scn: Scn, gcn: Gcn, wall: Arc<dyn WallClock>) -> Self {
        debug_assert!(!scn.is_null() && !gcn.is_null());
        Self {
            scn: AtomicU64::new(scn.get().max(Scn::RESERVED_MAX.get())),
            gcn: AtomicU64::new(gcn.get().max(Gcn::INITIAL.get())),
            wall,
            running: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
        tracing::info!(
            scn = self.load_scn().get(),
            gcn = self.load_gcn().get(),
            "transaction clock started"
        );
    }

    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            tracing::info!(
                scn = self.load_scn().get(),
                gcn = self.load_gcn().get(),
                "transaction clock shut down"
            );
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(TidemarkError::ShuttingDown)
        }
    }

    /// Last allocated scn. Every committed transaction has `scn <= load_scn()`.
    pub fn load_scn(&self) -> Scn {
        Scn::new(self.scn.load(Ordering::Acquire))
    }

    /// Allocate the next scn. Callers hold the committing segment's lock.
    pub fn next_scn(&self) -> Scn {
        Scn::new(self.scn.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub fn load_gcn(&self) -> Gcn {
        Gcn::new(self.gcn.load(Ordering::Acquire))
    }

    /// Bump the system gcn to at least `gcn`; returns the previous value.
    pub fn push_up_gcn(&self, gcn: Gcn) -> Gcn {
        debug_assert!(!gcn.is_null());
        Gcn::new(self.gcn.fetch_max(gcn.get(), Ordering::AcqRel))
    }

    pub fn now(&self) -> Utc {
        self.wall.now()
    }

    pub fn wall(&self) -> &Arc<dyn WallClock> {
        &self.wall
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual() -> (Arc<ManualClock>, TransactionClock) {
        let wall = Arc::new(ManualClock::new(Utc::from_secs(1_700_000_000)));
        let clock = TransactionClock::new(wall.clone());
        (wall, clock)
    }

    #[test]
    fn scn_allocation_starts_above_reserved() {
        let (_, clock) = manual();
        assert_eq!(clock.load_scn(), Scn::RESERVED_MAX);
        assert_eq!(clock.next_scn(), Scn::new(1025));
        assert_eq!(clock.next_scn(), Scn::new(1026));
        assert_eq!(clock.load_scn(), Scn::new(1026));
    }

    #[test]
    fn gcn_push_up_is_max() {
        let (_, clock) = manual();
        assert_eq!(clock.load_gcn(), Gcn::INITIAL);
        assert_eq!(clock.push_up_gcn(Gcn::new(2000)), Gcn::INITIAL);
        assert_eq!(clock.push_up_gcn(Gcn::new(1500)), Gcn::new(2000));
        assert_eq!(clock.load_gcn(), Gcn::new(2000));
    }

    #[test]
    fn lifecycle() {
        let (_, clock) = manual();
        assert!(matches!(
            clock.ensure_running(),
            Err(TidemarkError::ShuttingDown)
        ));
        clock.start();
        clock.ensure_running().unwrap();
        clock.shutdown();
        assert!(!clock.is_running());
    }

    #[test]
    fn manual_wall_clock() {
        let (wall, clock) = manual();
        let t0 = clock.now();
        wall.advance(Duration::from_secs(61));
        assert_eq!(t0.elapsed_until(clock.now()), Duration::from_secs(61));
    }

    #[test]
    fn restore_never_goes_below_floor() {
        let clock = TransactionClock::restore(
            Scn::new(5),
            Gcn::new(7),
            Arc::new(SystemWallClock),
        );
        assert_eq!(clock.load_scn(), Scn::RESERVED_MAX);
        assert_eq!(clock.load_gcn(), Gcn::INITIAL);
        assert!(clock.now() > Utc::from_secs(1_600_000_000));
    }
}
