//! C2 Interrupt Controller — spec §4.2.
//!
//! Grounded on `outlayer-quickjs-executor`'s epoch-ticker thread: a watchdog
//! thread flips a deadline flag the embedded engine's interrupt handler polls.
//! QuickJS calls the interrupt handler on every bytecode-interpreter
//! checkpoint (function entry and loop back-edges both included), so the
//! same callback doubles as the wall-clock detector and the work-unit
//! counter described in spec §9's redesign note ("a coarse wall-clock +
//! host-call-count surrogate is acceptable").

use crate::error::{EngineError, TimeoutReason};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Inner {
    deadline: Instant,
    work_ceiling: u64,
    work_done: AtomicU64,
    poisoned: AtomicBool,
    cancelled: AtomicBool,
    reason: std::sync::Mutex<Option<TimeoutReason>>,
}

/// Arms a wall-clock deadline and a work-unit ceiling; exposes a callback
/// suitable for `rquickjs::Runtime::set_interrupt_handler`.
#[derive(Clone)]
pub struct InterruptController {
    inner: Arc<Inner>,
}

impl InterruptController {
    /// Arm the controller. `work_ceiling` bounds non-yielding computation
    /// (spec's "work units", e.g. tight loops with no host calls).
    pub fn start(deadline: Duration, work_ceiling: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                deadline: Instant::now() + deadline,
                work_ceiling,
                work_done: AtomicU64::new(0),
                poisoned: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                reason: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Signal cooperative cancellation from a parent scope (spec §5).
    /// Safe to call any number of times, from any thread.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// `true` once the controller has fired and poisoned the sandbox. Safe to
    /// call any number of times.
    pub fn is_poisoned(&self) -> bool {
        self.inner.poisoned.load(Ordering::Acquire)
    }

    pub fn timeout_reason(&self) -> Option<TimeoutReason> {
        *self.inner.reason.lock().unwrap()
    }

    /// Callback installed as the engine's interrupt handler. Returning `true`
    /// tells QuickJS to abort script execution. Idempotent: once fired, every
    /// subsequent call also returns `true` without re-deriving the reason.
    pub fn check(&self) -> bool {
        if self.inner.poisoned.load(Ordering::Acquire) {
            return true;
        }

        if self.inner.cancelled.load(Ordering::Acquire) {
            self.poison(TimeoutReason::Cancelled);
            return true;
        }

        if Instant::now() >= self.inner.deadline {
            self.poison(TimeoutReason::Deadline);
            return true;
        }

        let done = self.inner.work_done.fetch_add(1, Ordering::AcqRel) + 1;
        if done > self.inner.work_ceiling {
            self.poison(TimeoutReason::WorkUnitsExceeded);
            return true;
        }

        false
    }

    fn poison(&self, reason: TimeoutReason) {
        self.inner.poisoned.store(true, Ordering::Release);
        *self.inner.reason.lock().unwrap() = Some(reason);
    }

    /// Stop the controller; always safe, may be called any number of times.
    pub fn stop(&self) {
        self.inner.poisoned.store(true, Ordering::Release);
    }

    pub fn as_engine_error(&self) -> EngineError {
        EngineError::Timeout {
            reason: self.timeout_reason().unwrap_or(TimeoutReason::Deadline),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_on_deadline() {
        let ctl = InterruptController::start(Duration::from_millis(1), 1_000_000);
        std::thread::sleep(Duration::from_millis(20));
        assert!(ctl.check());
        assert_eq!(ctl.timeout_reason(), Some(TimeoutReason::Deadline));
    }

    #[test]
    fn fires_on_work_ceiling() {
        let ctl = InterruptController::start(Duration::from_secs(30), 5);
        for _ in 0..5 {
            assert!(!ctl.check());
        }
        assert!(ctl.check());
        assert_eq!(ctl.timeout_reason(), Some(TimeoutReason::WorkUnitsExceeded));
    }

    #[test]
    fn idempotent_after_firing() {
        let ctl = InterruptController::start(Duration::from_millis(0), 1_000_000);
        std::thread::sleep(Duration::from_millis(5));
        assert!(ctl.check());
        assert!(ctl.check());
        assert!(ctl.check());
    }

    #[test]
    fn cancel_is_observed_on_next_check() {
        let ctl = InterruptController::start(Duration::from_secs(30), 1_000_000);
        assert!(!ctl.check());
        ctl.cancel();
        assert!(ctl.check());
        assert_eq!(ctl.timeout_reason(), Some(TimeoutReason::Cancelled));
    }

    #[test]
    fn stop_is_safe_to_call_repeatedly() {
        let ctl = InterruptController::start(Duration::from_secs(30), 1_000_000);
        ctl.stop();
        ctl.stop();
        ctl.stop();
        assert!(ctl.is_poisoned());
    }
}
