//! Engine: main coordinator that ties the actors together.
//!
//! The Engine is the entry point for applications. It owns the scheduler
//! and brings up whichever actors the configured [`Mode`] calls for.

use super::console::ConsoleActor;
use super::input::InputActor;
use super::messages::Command;
use super::renderer::{RendererActor, View};
use super::scheduler::{RunReport, Scheduler, SchedulerConfig, SchedulerHandle};
use super::watchdog::Watchdog;
use crate::error::{Result, SchedulerError};
use crate::experiment::Experiment;
use crate::mode::{Components, Mode};
use crate::state::Accessors;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// Capacity of the command channel.
const COMMAND_CAPACITY: usize = 64;

/// How often [`Engine::wait`] re-checks the scheduler.
const WAIT_POLL: Duration = Duration::from_millis(10);

/// Configuration for the Engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Name shown by views and in logs.
    pub title: String,
    /// Operating mode.
    pub mode: Mode,
    /// Target iterations per second.
    pub speed: f64,
    /// Renderer ticks per second.
    pub fps: f64,
    /// Start with frame-sync engaged.
    pub frame_sync: bool,
    /// Initial seed; random when `None`.
    pub seed: Option<u64>,
    /// Read key bindings from the terminal.
    pub keyboard: bool,
    /// Input poll timeout.
    pub input_poll_timeout: Duration,
    /// Report iterations running longer than this.
    pub watchdog_timeout: Option<Duration>,
    /// Bound for run-to-completion.
    pub max_iterations: Option<u64>,
    /// Cap on tracked-variable histories.
    pub history_limit: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            title: "lockstep".to_string(),
            mode: Mode::Visual,
            speed: 1000.0,
            fps: 60.0,
            frame_sync: true,
            seed: None,
            keyboard: false,
            input_poll_timeout: Duration::from_millis(10),
            watchdog_timeout: None,
            max_iterations: None,
            history_limit: Some(10_000),
        }
    }
}

impl EngineConfig {
    /// Set the title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Set the mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the target iteration rate.
    #[must_use]
    pub const fn with_speed(mut self, per_second: f64) -> Self {
        self.speed = per_second;
        self
    }

    /// Set the renderer rate.
    #[must_use]
    pub const fn with_fps(mut self, fps: f64) -> Self {
        self.fps = fps;
        self
    }

    /// Engage or disengage frame-sync at startup.
    #[must_use]
    pub const fn with_frame_sync(mut self, enabled: bool) -> Self {
        self.frame_sync = enabled;
        self
    }

    /// Fix the initial seed.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Read key bindings from the terminal.
    #[must_use]
    pub const fn with_keyboard(mut self, enabled: bool) -> Self {
        self.keyboard = enabled;
        self
    }

    /// Enable the stall watchdog.
    #[must_use]
    pub const fn with_watchdog(mut self, timeout: Duration) -> Self {
        self.watchdog_timeout = Some(timeout);
        self
    }

    /// Bound run-to-completion.
    #[must_use]
    pub const fn with_max_iterations(mut self, max: u64) -> Self {
        self.max_iterations = Some(max);
        self
    }

    fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            mode: self.mode,
            speed: self.speed,
            frame_sync: self.frame_sync,
            seed: self.seed,
            history_limit: self.history_limit,
        }
    }
}

/// The main engine.
pub struct Engine<E: Experiment> {
    config: EngineConfig,
    scheduler: Scheduler<E>,
    commands_tx: Sender<Command<E>>,
    /// Handed to the console thread on start.
    commands_rx: Option<Receiver<Command<E>>>,
    view: Option<Box<dyn View<E>>>,
    renderer: Option<RendererActor>,
    console: Option<ConsoleActor>,
    input: Option<InputActor>,
    watchdog: Option<Watchdog>,
    started: bool,
}

impl<E: Experiment> Engine<E> {
    /// Create an engine with no accessors registered.
    pub fn new(experiment: E, config: EngineConfig) -> Result<Self> {
        Self::with_accessors(experiment, Accessors::new(), config)
    }

    /// Create an engine whose state is reachable through `accessors`.
    pub fn with_accessors(experiment: E, accessors: Accessors<E>, config: EngineConfig) -> Result<Self> {
        if config.frame_sync && !config.mode.allows_frame_sync() {
            warn!(mode = %config.mode, "frame-sync requested but the mode has no renderer; disabled");
        }
        let scheduler = Scheduler::with_accessors(experiment, accessors, config.scheduler_config())?;
        let (commands_tx, commands_rx) = bounded(COMMAND_CAPACITY);

        Ok(Self {
            config,
            scheduler,
            commands_tx,
            commands_rx: Some(commands_rx),
            view: None,
            renderer: None,
            console: None,
            input: None,
            watchdog: None,
            started: false,
        })
    }

    /// Attach the view the renderer draws into.
    #[must_use]
    pub fn with_view(mut self, view: impl View<E>) -> Self {
        self.view = Some(Box::new(view));
        self
    }

    /// The configuration.
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// A scheduler control handle.
    pub fn handle(&self) -> SchedulerHandle<E> {
        self.scheduler.handle()
    }

    /// Sender for console commands.
    pub fn commands(&self) -> Sender<Command<E>> {
        self.commands_tx.clone()
    }

    /// Queue a console command.
    ///
    /// Fails with [`SchedulerError::Disconnected`] once the console has
    /// stopped and dropped its end of the channel.
    pub fn send(&self, command: Command<E>) -> Result<()> {
        self.commands_tx
            .send(command)
            .map_err(|_| SchedulerError::Disconnected)
    }

    /// Bring up the scheduler thread and the actors the mode calls for.
    ///
    /// In [`Mode::Optimal`] nothing is spawned; use [`run`](Self::run).
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(SchedulerError::AlreadyRunning);
        }
        let components = self.config.mode.components();
        if !components.contains(Components::SCHEDULER_THREAD) {
            return Err(SchedulerError::NotRunning);
        }
        let handle = self.scheduler.handle();
        info!(title = %self.config.title, mode = %self.config.mode, "engine starting");

        if components.contains(Components::RENDERER) {
            if let Some(view) = self.view.take() {
                self.renderer = Some(RendererActor::spawn(handle.clone(), view, self.config.fps)?);
            } else if handle.frame_sync() {
                warn!("no view attached; frame-sync disabled");
                handle.set_frame_sync(false);
            }
        }

        if components.contains(Components::CONSOLE) {
            if let Some(receiver) = self.commands_rx.take() {
                self.console = Some(ConsoleActor::spawn(
                    handle.clone(),
                    receiver,
                    self.config.input_poll_timeout,
                )?);
            }
            if self.config.keyboard {
                self.input = Some(InputActor::spawn(
                    self.commands_tx.clone(),
                    self.config.input_poll_timeout,
                )?);
            }
        }

        if let Some(timeout) = self.config.watchdog_timeout {
            self.watchdog = Some(Watchdog::spawn(handle, timeout)?);
        }

        self.scheduler.run()?;
        self.started = true;
        Ok(())
    }

    /// Run the configured mode to its end.
    ///
    /// [`Mode::Optimal`] runs to completion on this thread and returns the
    /// report. Every other mode starts the actors and blocks until killed.
    pub fn run(&mut self) -> Result<Option<RunReport>> {
        if self.config.mode == Mode::Optimal {
            let report = self.scheduler.run_to_completion(self.config.max_iterations)?;
            return Ok(Some(report));
        }
        self.start()?;
        self.wait()?;
        Ok(None)
    }

    /// Block until the run is over, then stop the actors.
    ///
    /// The run is over once the scheduler is killed. If the experiment
    /// panics while a renderer is up, the frozen state stays on screen
    /// until the kill; the panic is returned after that.
    pub fn wait(&mut self) -> Result<()> {
        if !self.started {
            return Err(SchedulerError::NotRunning);
        }
        let handle = self.scheduler.handle();
        loop {
            let finished = self.scheduler.is_finished();
            if finished && (handle.is_killed() || self.renderer.is_none()) {
                break;
            }
            thread::sleep(WAIT_POLL);
        }
        self.stop_actors();
        self.scheduler.join()
    }

    /// Kill the scheduler and stop every actor.
    pub fn shutdown(&mut self) -> Result<()> {
        self.scheduler.handle().kill();
        self.stop_actors();
        self.scheduler.join()
    }

    fn stop_actors(&mut self) {
        if let Some(input) = self.input.take() {
            input.join();
        }
        if let Some(console) = self.console.take() {
            console.join();
        }
        if let Some(renderer) = self.renderer.take() {
            renderer.join();
        }
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.join();
        }
    }
}

impl<E: Experiment> Drop for Engine<E> {
    fn drop(&mut self) {
        self.scheduler.handle().kill();
        self.stop_actors();
    }
}
