//! Error types for the scheduler and its control surface.

use std::io;
use thiserror::Error;

/// Errors raised by the scheduler, its actors, and the state accessors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// `run()` was called while the scheduler thread is alive.
    #[error("scheduler is already running")]
    AlreadyRunning,

    /// An operation needed a live scheduler thread.
    #[error("scheduler is not running")]
    NotRunning,

    /// The scheduler was killed and cannot be started again.
    #[error("scheduler was killed")]
    Killed,

    /// `speed(n)` requires a finite rate above zero.
    #[error("invalid speed {0}: must be a finite number of iterations per second above zero")]
    InvalidSpeed(f64),

    /// No accessor was registered for this target/attribute pair.
    #[error("no accessor registered for {target}.{attribute}")]
    UnknownAccessor {
        /// Target name.
        target: String,
        /// Attribute name.
        attribute: String,
    },

    /// The value handed to a setter has the wrong type.
    #[error("type mismatch for {key}: expected {expected}, found {found}")]
    TypeMismatch {
        /// `target.attribute` key.
        key: String,
        /// Expected value kind.
        expected: &'static str,
        /// Provided value kind.
        found: &'static str,
    },

    /// The accessor has a getter but no setter.
    #[error("{0} is read-only")]
    ReadOnly(String),

    /// The OS refused to spawn an actor thread.
    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] io::Error),

    /// `initialize()` or `iterate()` panicked; the scheduler thread is gone.
    #[error("experiment panicked: {0}")]
    ExperimentPanicked(String),

    /// Terminal setup or polling failed.
    #[error("terminal error: {0}")]
    Terminal(#[source] io::Error),

    /// The other end of a channel hung up.
    #[error("channel disconnected")]
    Disconnected,
}

impl SchedulerError {
    /// Creates an unknown-accessor error.
    pub fn unknown(target: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self::UnknownAccessor {
            target: target.into(),
            attribute: attribute.into(),
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, SchedulerError>;
