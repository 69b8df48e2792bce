//! Pause gate: a flag plus condition variable that parks the scheduler.
//!
//! `pause()` and `resume()` hold the gate's mutex only while they flip the
//! flag and notify. The scheduler side is a plain check-under-lock and
//! condition-wait loop, so no lock is ever held across a call boundary.

use parking_lot::{Condvar, Mutex};

/// Result of a blocking wait on one of the gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The gate is open; go ahead.
    Proceed,
    /// The abort predicate fired while waiting (reset or kill).
    Aborted,
}

/// Suspends the scheduler loop until explicitly resumed.
#[derive(Debug, Default)]
pub struct PauseGate {
    /// Whether the loop is suspended.
    paused: Mutex<bool>,
    /// Signalled on resume and on `wake`.
    changed: Condvar,
}

impl PauseGate {
    /// Create an open gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the gate. Returns `false` if it was already closed.
    pub fn pause(&self) -> bool {
        let mut paused = self.paused.lock();
        if *paused {
            return false;
        }
        *paused = true;
        true
    }

    /// Open the gate and wake the waiter. Returns `false` if it was already open.
    pub fn resume(&self) -> bool {
        let mut paused = self.paused.lock();
        if !*paused {
            return false;
        }
        *paused = false;
        self.changed.notify_one();
        true
    }

    /// Current flag value.
    pub fn is_paused(&self) -> bool {
        *self.paused.lock()
    }

    /// Block while the gate is closed.
    ///
    /// `abort` is evaluated under the gate's lock before every sleep, so
    /// any flag it reads must be set before calling [`wake`](Self::wake)
    /// for the wakeup not to be lost.
    pub fn wait(&self, abort: impl Fn() -> bool) -> WaitOutcome {
        let mut paused = self.paused.lock();
        loop {
            if abort() {
                return WaitOutcome::Aborted;
            }
            if !*paused {
                return WaitOutcome::Proceed;
            }
            self.changed.wait(&mut paused);
        }
    }

    /// Wake all waiters so they re-evaluate their abort predicate.
    pub fn wake(&self) {
        let _paused = self.paused.lock();
        self.changed.notify_all();
    }
}
