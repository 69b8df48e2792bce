//! # Lockstep
//!
//! A scheduler that runs a user-supplied simulation step by step on its
//! own thread, while a renderer draws it and a console steers it.
//!
//! ## Core Concepts
//!
//! - **Iteration lock**: `iterate()` and every outside read or write of the
//!   experiment are mutually exclusive, so nobody sees a half-done step
//! - **Pause gate**: `pause()` returns only once no iteration is in flight
//! - **Frame-sync**: a turn token that makes the scheduler and renderer
//!   alternate, one iteration per frame
//! - **Actor model**: scheduler, renderer, console, input and watchdog
//!   threads talking over crossbeam channels
//!
//! ## Example
//!
//! ```rust
//! use lockstep::{Experiment, Mode, Scheduler, SchedulerConfig, SimRng};
//!
//! struct Countdown(u32);
//!
//! impl Experiment for Countdown {
//!     fn initialize(&mut self, _rng: &mut SimRng) {
//!         self.0 = 10;
//!     }
//!
//!     fn iterate(&mut self, _rng: &mut SimRng) {
//!         self.0 -= 1;
//!     }
//!
//!     fn is_finished(&self) -> bool {
//!         self.0 == 0
//!     }
//! }
//!
//! let config = SchedulerConfig::default().with_mode(Mode::Optimal).with_seed(1);
//! let mut scheduler = Scheduler::new(Countdown(0), config)?;
//! let report = scheduler.run_to_completion(None)?;
//! assert_eq!(report.iterations, 10);
//! # Ok::<(), lockstep::SchedulerError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod actor;
pub mod error;
pub mod experiment;
pub mod mode;
pub mod state;
pub mod sync;
pub mod timing;

// Re-exports for convenience
pub use actor::{
    Command, ConsoleActor, Engine, EngineConfig, Frame, FrameOutcome, InputActor, Phase,
    RenderStats, RendererActor, RunReport, Scheduler, SchedulerConfig, SchedulerEvent,
    SchedulerHandle, SchedulerState, View, Watchdog,
};
pub use error::{Result, SchedulerError};
pub use experiment::{Experiment, SimRng};
pub use mode::{Components, Mode};
pub use state::{AccessorKey, Accessors, Sample, StateValue, Tracker, Value};
pub use sync::{HandshakeGate, IterationLock, PauseGate, Turn, TurnOutcome, WaitOutcome};
pub use timing::{FrameClock, TimingController};
