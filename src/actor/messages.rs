//! Message types for actor communication.
//!
//! [`Command`] flows from the console side into the scheduler's control
//! surface; [`SchedulerEvent`] flows out of the scheduler to whoever is
//! listening (console, watchdog, tests).

use crate::state::Value;
use std::fmt;
use std::time::Duration;

/// Callback run between iterations with exclusive access to the experiment.
pub type SafeFn<E> = Box<dyn FnOnce(&mut E) + Send>;

/// Control requests delivered to the console thread.
pub enum Command<E> {
    /// Suspend before the next iteration.
    Pause,
    /// Continue after a pause.
    Resume,
    /// Pause if running, resume if paused.
    TogglePause,
    /// Reinitialize at the next loop boundary.
    Reset {
        /// Draw a new seed first.
        reseed: bool,
    },
    /// Set the target rate in iterations per second.
    Speed(f64),
    /// Multiply the current rate.
    ScaleSpeed(f64),
    /// Engage or disengage frame-sync.
    FrameSync(bool),
    /// Flip frame-sync.
    ToggleFrameSync,
    /// Write one registered attribute between iterations.
    Set {
        /// Target name.
        target: String,
        /// Attribute name.
        attribute: String,
        /// New value.
        value: Value,
    },
    /// Run a callback between iterations.
    Safe(SafeFn<E>),
    /// Shut everything down.
    Kill,
}

impl<E> fmt::Debug for Command<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pause => f.write_str("Pause"),
            Self::Resume => f.write_str("Resume"),
            Self::TogglePause => f.write_str("TogglePause"),
            Self::Reset { reseed } => f.debug_struct("Reset").field("reseed", reseed).finish(),
            Self::Speed(n) => f.debug_tuple("Speed").field(n).finish(),
            Self::ScaleSpeed(k) => f.debug_tuple("ScaleSpeed").field(k).finish(),
            Self::FrameSync(on) => f.debug_tuple("FrameSync").field(on).finish(),
            Self::ToggleFrameSync => f.write_str("ToggleFrameSync"),
            Self::Set {
                target,
                attribute,
                value,
            } => f
                .debug_struct("Set")
                .field("target", target)
                .field("attribute", attribute)
                .field("value", value)
                .finish(),
            Self::Safe(_) => f.write_str("Safe(..)"),
            Self::Kill => f.write_str("Kill"),
        }
    }
}

/// Where the scheduler thread currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Phase {
    /// Not started yet.
    Idle = 0,
    /// Inside `initialize()`.
    Initializing = 1,
    /// Waiting for its frame-sync turn.
    AwaitingTurn = 2,
    /// Parked on the pause gate.
    Paused = 3,
    /// Inside `iterate()`.
    Iterating = 4,
    /// Sleeping out the pacing interval.
    Sleeping = 5,
    /// Thread exited after a kill.
    Stopped = 6,
    /// Thread died from an experiment panic.
    Faulted = 7,
}

impl Phase {
    pub(crate) const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Initializing,
            2 => Self::AwaitingTurn,
            3 => Self::Paused,
            4 => Self::Iterating,
            5 => Self::Sleeping,
            6 => Self::Stopped,
            7 => Self::Faulted,
            _ => Self::Idle,
        }
    }

    /// Whether the thread is inside experiment code.
    pub const fn is_busy(self) -> bool {
        matches!(self, Self::Initializing | Self::Iterating)
    }

    /// Whether the thread has exited.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Faulted)
    }
}

/// Lifecycle notifications published by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// The scheduler thread started.
    Started {
        /// Seed of the first cycle.
        seed: u64,
    },
    /// `initialize()` completed.
    Initialized {
        /// Reset cycle number, starting at 1.
        cycle: u64,
        /// Seed used for this cycle.
        seed: u64,
    },
    /// The pause gate closed.
    Paused {
        /// Iterations completed so far.
        iteration: u64,
    },
    /// The pause gate opened.
    Resumed {
        /// Iterations completed so far.
        iteration: u64,
    },
    /// A reset was requested.
    ResetRequested {
        /// Whether a new seed was drawn.
        reseed: bool,
        /// Seed the next cycle will use.
        seed: u64,
    },
    /// The experiment panicked and the scheduler thread ended.
    Faulted {
        /// Panic message.
        message: String,
    },
    /// The watchdog saw the scheduler stuck in experiment code.
    Stalled {
        /// Phase it is stuck in.
        phase: Phase,
        /// How long since it last made progress.
        since: Duration,
    },
    /// The scheduler thread exited after a kill.
    Stopped {
        /// Iterations completed in the last cycle.
        iteration: u64,
    },
}
