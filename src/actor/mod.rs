//! Actor Model: the threads that make up a run.
//!
//! - **Scheduler**: drives `initialize`/`iterate`, owns the experiment
//! - **Renderer**: ticks at a frame rate and draws a [`View`]
//! - **Console**: applies [`Command`]s to the scheduler
//! - **Input**: turns key presses into commands
//! - **Watchdog**: reports a scheduler stuck in experiment code
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   Command    ┌──────────────┐
//! │ Input Thread │ ───────────▶ │   Console    │
//! └──────────────┘              └──────┬───────┘
//!                                      │ SchedulerHandle
//!                                      ▼
//! ┌──────────────┐   handshake  ┌──────────────┐
//! │Render Thread │ ◀──────────▶ │  Scheduler   │
//! └──────────────┘  + iteration └──────┬───────┘
//!                     lock             │ SchedulerEvent
//!                                      ▼
//!                               ┌──────────────┐
//!                               │   Watchdog   │
//!                               └──────────────┘
//! ```

mod console;
mod engine;
mod input;
mod messages;
mod renderer;
mod scheduler;
mod watchdog;

pub use console::{apply, ConsoleActor, Flow};
pub use engine::{Engine, EngineConfig};
pub use input::InputActor;
pub use messages::{Command, Phase, SafeFn, SchedulerEvent};
pub use renderer::{RenderStats, RendererActor, View};
pub use scheduler::{
    Frame, FrameOutcome, RunReport, Scheduler, SchedulerConfig, SchedulerHandle, SchedulerState,
};
pub use watchdog::Watchdog;
