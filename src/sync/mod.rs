//! Coordination primitives shared by the scheduler and renderer threads.
//!
//! - [`IterationLock`]: serializes writes to experiment state
//! - [`PauseGate`]: parks the scheduler until resumed
//! - [`HandshakeGate`]: frame-sync turn token

mod handshake;
mod iteration_lock;
mod pause_gate;

pub use handshake::{HandshakeGate, Turn, TurnOutcome};
pub use iteration_lock::IterationLock;
pub use pause_gate::{PauseGate, WaitOutcome};
