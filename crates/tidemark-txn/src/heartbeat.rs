//! Coordinator heartbeat freeze.
//!
//! When enabled, an external coordinator must call `send_heartbeat`
//! regularly. If it goes quiet for longer than the timeout the system is
//! frozen: DML is rejected, replica apply waits, and purge does not advance,
//! so nothing the coordinator may still ask about is reclaimed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tidemark_error::{Result, TidemarkError};
use tidemark_types::Utc;

use crate::clock::WallClock;

/// Interval between repeated freeze diagnostics on the DML and GC paths.
pub const FREEZE_LOG_INTERVAL: Duration = Duration::from_secs(180);
/// Interval between repeated freeze diagnostics on the apply path.
pub const APPLY_LOG_INTERVAL: Duration = Duration::from_secs(60);
/// Nap between apply-path freeze checks.
pub const APPLY_NAP: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// LazyPrinter
// ---------------------------------------------------------------------------

/// Rate limiter for repeated diagnostics: fires on the first call and then
/// at most once per interval, until reset.
#[derive(Debug, Clone)]
pub struct LazyPrinter {
    interval: Duration,
    last: Option<Utc>,
}

impl LazyPrinter {
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Whether a message should be emitted now; records the emission.
    pub fn should_print(&mut self, now: Utc) -> bool {
        let due = match self.last {
            None => true,
            Some(last) => last.elapsed_until(now) >= self.interval,
        };
        if due {
            self.last = Some(now);
        }
        due
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

// ---------------------------------------------------------------------------
// HeartbeatFreezer
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct FreezeState {
    last_heartbeat: Utc,
    is_freeze: bool,
}

/// Tracks the coordinator heartbeat and derives the freeze state.
pub struct HeartbeatFreezer {
    enabled: AtomicBool,
    timeout: Duration,
    wall: Arc<dyn WallClock>,
    state: Mutex<FreezeState>,
    printer: Mutex<LazyPrinter>,
    apply_printer: Mutex<LazyPrinter>,
    apply_nap: Duration,
}

impl std::fmt::Debug for HeartbeatFreezer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatFreezer")
            .field("enabled", &self.is_enabled())
            .field("timeout", &self.timeout)
            .field("is_freeze", &self.is_frozen())
            .finish_non_exhaustive()
    }
}

impl HeartbeatFreezer {
    pub fn new(enabled: bool, timeout: Duration, wall: Arc<dyn WallClock>) -> Self {
        let now = wall.now();
        Self {
            enabled: AtomicBool::new(enabled),
            timeout,
            wall,
            state: Mutex::new(FreezeState {
                last_heartbeat: now,
                is_freeze: false,
            }),
            printer: Mutex::new(LazyPrinter::new(FREEZE_LOG_INTERVAL)),
            apply_printer: Mutex::new(LazyPrinter::new(APPLY_LOG_INTERVAL)),
            apply_nap: APPLY_NAP,
        }
    }

    /// Shorter apply-path nap, for tests.
    #[must_use]
    pub fn with_apply_nap(mut self, nap: Duration) -> Self {
        self.apply_nap = nap;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        if !enabled {
            self.state.lock().is_freeze = false;
        }
    }

    /// Reset the timer; unfreezes immediately.
    pub fn send_heartbeat(&self) {
        let mut state = self.state.lock();
        state.last_heartbeat = self.wall.now();
        if state.is_freeze {
            tracing::info!("coordinator heartbeat received, unfreezing");
        }
        state.is_freeze = false;
        self.printer.lock().reset();
        self.apply_printer.lock().reset();
    }

    /// Recompute and return the freeze state.
    pub fn determine_freeze(&self) -> bool {
        let now = self.wall.now();
        let mut state = self.state.lock();
        let elapsed = state.last_heartbeat.elapsed_until(now);
        let freeze = self.is_enabled() && elapsed > self.timeout;
        if freeze {
            if self.printer.lock().should_print(now) {
                tracing::warn!(
                    elapsed_secs = elapsed.as_secs(),
                    timeout_secs = self.timeout.as_secs(),
                    "no coordinator heartbeat, freezing DML and purge"
                );
            }
        } else {
            self.printer.lock().reset();
        }
        state.is_freeze = freeze;
        freeze
    }

    /// Last computed freeze state, without recomputing.
    pub fn is_frozen(&self) -> bool {
        self.state.lock().is_freeze
    }

    pub fn elapsed_since_heartbeat(&self) -> Duration {
        self.state.lock().last_heartbeat.elapsed_until(self.wall.now())
    }

    /// Gate for DML entry points.
    pub fn check_dml(&self) -> Result<()> {
        if self.determine_freeze() {
            return Err(TidemarkError::HeartbeatFreeze {
                elapsed_secs: self.elapsed_since_heartbeat().as_secs(),
            });
        }
        Ok(())
    }

    /// Block replica apply while frozen. Returns `ShuttingDown` if `cancel`
    /// is raised while waiting.
    pub fn wait_while_frozen_for_apply(&self, cancel: &AtomicBool) -> Result<()> {
        while self.determine_freeze() {
            if cancel.load(Ordering::Acquire) {
                return Err(TidemarkError::ShuttingDown);
            }
            if self.apply_printer.lock().should_print(self.wall.now()) {
                tracing::warn!(
                    elapsed_secs = self.elapsed_since_heartbeat().as_secs(),
                    "replica apply waiting for coordinator heartbeat"
                );
            }
            std::thread::sleep(self.apply_nap);
        }
        self.apply_printer.lock().reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn freezer(enabled: bool) -> (Arc<ManualClock>, HeartbeatFreezer) {
        let wall = Arc::new(ManualClock::new(Utc::from_secs(1_000)));
        let f = HeartbeatFreezer::new(enabled, Duration::from_secs(10), wall.clone())
            .with_apply_nap(Duration::from_millis(1));
        (wall, f)
    }

    // -----------------------------------------------------------------------
    // LazyPrinter
    // -----------------------------------------------------------------------

    #[test]
    fn lazy_printer_rate_limits() {
        let mut p = LazyPrinter::new(Duration::from_secs(180));
        let t0 = Utc::from_secs(100);
        assert!(p.should_print(t0));
        assert!(!p.should_print(Utc::from_secs(200)));
        assert!(p.should_print(Utc::from_secs(280)));
        p.reset();
        assert!(p.should_print(Utc::from_secs(281)));
    }

    // -----------------------------------------------------------------------
    // Freeze
    // -----------------------------------------------------------------------

    #[test]
    fn disabled_never_freezes() {
        let (wall, f) = freezer(false);
        wall.advance(Duration::from_secs(3600));
        assert!(!f.determine_freeze());
        f.check_dml().unwrap();
    }

    #[test]
    fn freeze_after_timeout_and_heartbeat_clears() {
        let (wall, f) = freezer(true);
        wall.advance(Duration::from_secs(10));
        assert!(!f.determine_freeze(), "exactly the timeout is not frozen");
        wall.advance(Duration::from_secs(1));
        assert!(f.determine_freeze());
        assert!(f.is_frozen());
        let err = f.check_dml().unwrap_err();
        assert!(matches!(err, TidemarkError::HeartbeatFreeze { elapsed_secs: 11 }));

        f.send_heartbeat();
        assert!(!f.is_frozen());
        f.check_dml().unwrap();
    }

    #[test]
    fn disabling_unfreezes() {
        let (wall, f) = freezer(true);
        wall.advance(Duration::from_secs(60));
        assert!(f.determine_freeze());
        f.set_enabled(false);
        assert!(!f.is_frozen());
        assert!(!f.determine_freeze());
    }

    #[test]
    fn apply_wait_returns_on_cancel() {
        let (wall, f) = freezer(true);
        wall.advance(Duration::from_secs(60));
        let cancel = AtomicBool::new(true);
        assert!(matches!(
            f.wait_while_frozen_for_apply(&cancel),
            Err(TidemarkError::ShuttingDown)
        ));
        f.send_heartbeat();
        f.wait_while_frozen_for_apply(&cancel).unwrap();
    }
}
