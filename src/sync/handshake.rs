//! Handshake gate: the frame-sync rendezvous between scheduler and renderer.
//!
//! A single turn token guarded by one condition variable. Each side waits
//! until the token names it, does its work, then hands the token over.
//! Neither side can go twice in a row because only the holder can pass.
//!
//! ```text
//!   renderer                      scheduler
//!   wait(Renderer) ──┐            wait(Experiment) ◀─┐
//!   read state       │                               │
//!   finish(Renderer) ┴──────────▶ iterate()          │
//!                                 finish(Experiment) ┘──▶ (back to renderer)
//! ```
//!
//! Turning frame-sync off releases every blocked waiter with
//! [`TurnOutcome::Bypassed`]; turning it back on hands the token to the
//! renderer, the same as a fresh gate.

use parking_lot::{Condvar, Mutex};
use std::time::Instant;

/// Which party holds the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Turn {
    /// The scheduler may run one iteration.
    Experiment,
    /// The renderer may draw one frame.
    Renderer,
}

impl Turn {
    /// The other party.
    #[inline]
    pub const fn other(self) -> Self {
        match self {
            Self::Experiment => Self::Renderer,
            Self::Renderer => Self::Experiment,
        }
    }
}

/// Result of waiting for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Frame-sync is on and the caller now holds the token.
    Granted,
    /// Frame-sync is off; proceed without the token.
    Bypassed,
    /// The abort predicate fired.
    Aborted,
    /// The deadline passed before the turn came.
    TimedOut,
    /// The gate was shut down for good.
    Closed,
}

#[derive(Debug)]
struct Token {
    turn: Turn,
    enabled: bool,
    closed: bool,
}

/// Strict two-party alternation primitive.
#[derive(Debug)]
pub struct HandshakeGate {
    token: Mutex<Token>,
    changed: Condvar,
}

impl HandshakeGate {
    /// Create a gate. The renderer holds the first turn so its first wait
    /// does not block.
    pub fn new(enabled: bool) -> Self {
        Self {
            token: Mutex::new(Token {
                turn: Turn::Renderer,
                enabled,
                closed: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Whether frame-sync is engaged.
    pub fn is_enabled(&self) -> bool {
        self.token.lock().enabled
    }

    /// Who holds the token right now.
    pub fn turn(&self) -> Turn {
        self.token.lock().turn
    }

    /// Engage or disengage frame-sync, waking every blocked waiter.
    ///
    /// Returns the previous setting.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        let mut token = self.token.lock();
        let previous = token.enabled;
        if enabled && !previous {
            token.turn = Turn::Renderer;
        }
        token.enabled = enabled;
        self.changed.notify_all();
        previous
    }

    /// Block until `side` holds the token.
    ///
    /// `abort` is checked under the gate's lock; set its flag before
    /// calling [`wake`](Self::wake).
    pub fn wait_turn(
        &self,
        side: Turn,
        abort: impl Fn() -> bool,
        deadline: Option<Instant>,
    ) -> TurnOutcome {
        let mut token = self.token.lock();
        loop {
            if let Some(outcome) = Self::settle(&token, side) {
                return outcome;
            }
            if abort() {
                return TurnOutcome::Aborted;
            }
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut token, deadline).timed_out() {
                        return Self::settle(&token, side).unwrap_or(TurnOutcome::TimedOut);
                    }
                }
                None => self.changed.wait(&mut token),
            }
        }
    }

    fn settle(token: &Token, side: Turn) -> Option<TurnOutcome> {
        if token.closed {
            Some(TurnOutcome::Closed)
        } else if !token.enabled {
            Some(TurnOutcome::Bypassed)
        } else if token.turn == side {
            Some(TurnOutcome::Granted)
        } else {
            None
        }
    }

    /// Hand the token from `side` to the other party.
    ///
    /// Does nothing unless frame-sync is on and `side` holds the token.
    pub fn finish_turn(&self, side: Turn) -> bool {
        let mut token = self.token.lock();
        if token.closed || !token.enabled || token.turn != side {
            return false;
        }
        token.turn = side.other();
        self.changed.notify_all();
        true
    }

    /// Wake all waiters so they re-evaluate their abort predicate.
    pub fn wake(&self) {
        let _token = self.token.lock();
        self.changed.notify_all();
    }

    /// Shut the gate; every current and future wait returns `Closed`.
    pub fn close(&self) {
        let mut token = self.token.lock();
        token.closed = true;
        self.changed.notify_all();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.token.lock().closed
    }
}

impl Default for HandshakeGate {
    fn default() -> Self {
        Self::new(true)
    }
}
