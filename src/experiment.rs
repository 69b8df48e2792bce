//! The pluggable simulation driven by the scheduler.

use rand_chacha::ChaCha8Rng;

/// Random source handed to the experiment.
///
/// Reseeded from the scheduler's seed before every `initialize()`, so a run
/// is reproducible from its seed alone.
pub type SimRng = ChaCha8Rng;

/// A stateful simulation.
///
/// The scheduler decides *when* these are called; the experiment decides
/// what they compute. All calls happen under the iteration lock.
///
/// # Example
///
/// ```rust
/// use lockstep::{Experiment, SimRng};
/// use rand::Rng;
///
/// struct Walker {
///     x: i64,
/// }
///
/// impl Experiment for Walker {
///     fn initialize(&mut self, _rng: &mut SimRng) {
///         self.x = 0;
///     }
///
///     fn iterate(&mut self, rng: &mut SimRng) {
///         self.x += if rng.gen::<bool>() { 1 } else { -1 };
///     }
/// }
/// ```
pub trait Experiment: Send + 'static {
    /// Reset internal state. Called once at startup and once per reset;
    /// must be safe to call any number of times.
    fn initialize(&mut self, rng: &mut SimRng);

    /// Advance the simulation by one step.
    ///
    /// Pacing is only meaningful if this takes roughly constant time.
    fn iterate(&mut self, rng: &mut SimRng);

    /// Whether a run-to-completion batch should stop.
    ///
    /// Only consulted by [`Scheduler::run_to_completion`](crate::Scheduler::run_to_completion).
    fn is_finished(&self) -> bool {
        false
    }
}
