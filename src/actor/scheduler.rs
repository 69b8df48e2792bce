//! Scheduler: the background loop that drives the experiment.
//!
//! The loop has two levels:
//!
//! - **Outer**: reseed the RNG from `seed`, call `initialize()`, then run
//!   the inner loop until a reset is requested. Exit if killed.
//! - **Inner**, once per iteration:
//!   1. frame-sync on: wait for the experiment's turn on the handshake
//!   2. wait on the pause gate
//!   3. `iterate()` under the iteration lock
//!   4. frame-sync on: hand the turn to the renderer; otherwise sleep out
//!      the rest of the pacing interval
//!
//! Reset and kill are flags observed at loop boundaries. Both also wake
//! the scheduler out of the pause gate and the handshake wait, so they
//! never have to wait for a resume or a render tick. An in-flight
//! `iterate()` is never interrupted.
//!
//! [`SchedulerHandle`] is the control surface. It is cheap to clone and
//! safe to use from any thread except the scheduler thread itself.

use super::messages::{Phase, SchedulerEvent};
use crate::error::{Result, SchedulerError};
use crate::experiment::{Experiment, SimRng};
use crate::mode::Mode;
use crate::state::{AccessorKey, Accessors, Tracker, Value};
use crate::sync::{HandshakeGate, IterationLock, PauseGate, Turn, TurnOutcome, WaitOutcome};
use crate::timing::{interval_for_rate, TimingController};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Capacity of the lifecycle event channel; the oldest events are evicted when full.
const EVENT_CAPACITY: usize = 256;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Operating mode.
    pub mode: Mode,
    /// Target rate in iterations per second (free-running pacing).
    pub speed: f64,
    /// Start with frame-sync engaged (ignored if the mode has no renderer).
    pub frame_sync: bool,
    /// Initial seed; random when `None`.
    pub seed: Option<u64>,
    /// Cap on each tracked variable's history.
    pub history_limit: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Visual,
            speed: 1000.0,
            frame_sync: true,
            seed: None,
            history_limit: Some(10_000),
        }
    }
}

impl SchedulerConfig {
    /// Set the mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the target rate.
    #[must_use]
    pub const fn with_speed(mut self, per_second: f64) -> Self {
        self.speed = per_second;
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

    /// Cap tracked histories.
    #[must_use]
    pub const fn with_history_limit(mut self, limit: Option<usize>) -> Self {
        self.history_limit = limit;
        self
    }
}

/// Everything guarded by the iteration lock.
struct Slot<E> {
    experiment: E,
    rng: SimRng,
    tracker: Tracker,
    /// Iterations in the current cycle.
    iteration: u64,
    /// Reset cycle, starting at 1 after the first `initialize()`.
    cycle: u64,
}

impl<E: Experiment> Slot<E> {
    fn initialize(&mut self, seed: u64, accessors: &Accessors<E>) {
        self.rng = SimRng::seed_from_u64(seed);
        self.experiment.initialize(&mut self.rng);
        self.iteration = 0;
        self.cycle += 1;
        self.tracker.clear();
        self.tracker.record(0, accessors, &self.experiment);
    }

    fn step(&mut self, accessors: &Accessors<E>) {
        self.experiment.iterate(&mut self.rng);
        self.iteration += 1;
        self.tracker.record(self.iteration, accessors, &self.experiment);
    }
}

/// Read-only view of the experiment handed to a renderer for one frame.
///
/// Holding a `Frame` means holding the iteration lock, so the state it
/// shows is never a half-completed iteration.
pub struct Frame<'a, E> {
    experiment: &'a E,
    tracker: &'a Tracker,
    iteration: u64,
    cycle: u64,
    synced: bool,
}

impl<'a, E> Frame<'a, E> {
    /// The experiment state.
    pub const fn experiment(&self) -> &'a E {
        self.experiment
    }

    /// Tracked-variable histories.
    pub const fn tracker(&self) -> &'a Tracker {
        self.tracker
    }

    /// Iterations completed in the current cycle.
    pub const fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Current reset cycle.
    pub const fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Whether this frame was granted by the frame-sync handshake.
    pub const fn is_synced(&self) -> bool {
        self.synced
    }
}

/// Result of a renderer tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome<R> {
    /// The frame was drawn; carries the draw callback's result.
    Drawn(R),
    /// The renderer's turn did not come before the deadline.
    TimedOut,
    /// The scheduler was killed.
    Closed,
}

/// Result of a run-to-completion batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Iterations executed.
    pub iterations: u64,
    /// Seed the run used.
    pub seed: u64,
    /// Wall time spent.
    pub elapsed: Duration,
}

/// Point-in-time copy of the scheduler's lifecycle state.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerState {
    /// Operating mode.
    pub mode: Mode,
    /// Where the scheduler thread is.
    pub phase: Phase,
    /// Whether the loop is active.
    pub running: bool,
    /// Whether the pause gate is closed.
    pub paused: bool,
    /// A reset is pending.
    pub reset_requested: bool,
    /// A kill is pending or done.
    pub kill_requested: bool,
    /// Whether frame-sync is engaged.
    pub frame_sync: bool,
    /// Target interval between iterations.
    pub speed: Duration,
    /// Seed of the current (or next, after a reseed) cycle.
    pub seed: u64,
    /// Iterations completed in the current cycle.
    pub iteration: u64,
    /// Iterations completed across all cycles.
    pub total_iterations: u64,
    /// Current reset cycle.
    pub cycle: u64,
}

struct Shared<E> {
    mode: Mode,
    experiment: IterationLock<Slot<E>>,
    accessors: Accessors<E>,
    pause: PauseGate,
    handshake: HandshakeGate,

    running: AtomicBool,
    reset_requested: AtomicBool,
    kill_requested: AtomicBool,
    speed_nanos: AtomicU64,
    seed: AtomicU64,
    /// Draws replacement seeds; seeded from the initial seed so reseed
    /// sequences are reproducible.
    seed_source: Mutex<SimRng>,

    phase: AtomicU8,
    epoch: Instant,
    heartbeat_nanos: AtomicU64,
    iterations: AtomicU64,
    total_iterations: AtomicU64,
    cycles: AtomicU64,
    frames: AtomicU64,
    fault: Mutex<Option<String>>,

    events_tx: Sender<SchedulerEvent>,
    events_rx: Receiver<SchedulerEvent>,
}

impl<E: Experiment> Shared<E> {
    fn publish(&self, event: SchedulerEvent) {
        // Non-blocking: a full queue loses its oldest event, never the newest
        let mut event = event;
        loop {
            match self.events_tx.try_send(event) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => return,
                Err(TrySendError::Full(rejected)) => {
                    let _ = self.events_rx.try_recv();
                    event = rejected;
                }
            }
        }
    }

    fn enter(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
        self.beat();
    }

    fn beat(&self) {
        let now = u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.heartbeat_nanos.store(now, Ordering::Release);
    }

    fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn speed(&self) -> Duration {
        Duration::from_nanos(self.speed_nanos.load(Ordering::Relaxed))
    }

    /// Whether the inner loop must exit at the next boundary.
    fn interrupted(&self) -> bool {
        self.reset_requested.load(Ordering::Acquire) || self.kill_requested.load(Ordering::Acquire)
    }

    /// Make blocked waits re-check their abort predicate.
    fn wake(&self) {
        self.pause.wake();
        self.handshake.wake();
    }

    fn draw_seed(&self) -> u64 {
        let current = self.seed.load(Ordering::Acquire);
        let mut source = self.seed_source.lock();
        let mut next = source.gen::<u64>();
        while next == current {
            next = source.gen::<u64>();
        }
        self.seed.store(next, Ordering::Release);
        next
    }

    fn initialize(&self) {
        self.enter(Phase::Initializing);
        let seed = self.seed.load(Ordering::Acquire);
        let cycle = {
            let mut slot = self.experiment.lock();
            slot.initialize(seed, &self.accessors);
            self.iterations.store(0, Ordering::Release);
            self.cycles.store(slot.cycle, Ordering::Release);
            slot.cycle
        };
        info!(cycle, seed, "experiment initialized");
        self.publish(SchedulerEvent::Initialized { cycle, seed });
    }

    fn run_loop(&self) {
        self.running.store(true, Ordering::Release);
        let mut timing = TimingController::new();

        while !self.kill_requested.load(Ordering::Acquire) {
            self.reset_requested.store(false, Ordering::Release);
            self.initialize();
            self.run_cycle(&mut timing);
        }

        self.running.store(false, Ordering::Release);
        self.enter(Phase::Stopped);
        let iteration = self.iterations.load(Ordering::Acquire);
        info!(iteration, "scheduler stopped");
        self.publish(SchedulerEvent::Stopped { iteration });
    }

    /// Inner loop: iterate until a reset or kill is observed.
    fn run_cycle(&self, timing: &mut TimingController) {
        let interrupted = || self.interrupted();

        loop {
            if self.interrupted() {
                return;
            }

            self.enter(Phase::AwaitingTurn);
            let synced = match self.handshake.wait_turn(Turn::Experiment, interrupted, None) {
                TurnOutcome::Granted => true,
                TurnOutcome::Bypassed => false,
                TurnOutcome::Aborted | TurnOutcome::TimedOut | TurnOutcome::Closed => return,
            };

            if self.pause.is_paused() {
                self.enter(Phase::Paused);
            }
            if self.pause.wait(interrupted) == WaitOutcome::Aborted {
                return;
            }

            {
                let mut slot = self.experiment.lock();
                // pause() may have landed between the gate and the lock
                if self.pause.is_paused() {
                    continue;
                }
                if self.interrupted() {
                    return;
                }
                self.enter(Phase::Iterating);
                timing.mark();
                slot.step(&self.accessors);
                self.iterations.store(slot.iteration, Ordering::Release);
                self.total_iterations.fetch_add(1, Ordering::AcqRel);
            }

            if synced {
                self.handshake.finish_turn(Turn::Experiment);
            } else {
                self.enter(Phase::Sleeping);
                timing.pace(self.speed());
            }
        }
    }

    fn record_fault(&self, message: String) {
        error!(%message, "experiment panicked; scheduler thread terminated");
        *self.fault.lock() = Some(message.clone());
        self.running.store(false, Ordering::Release);
        self.enter(Phase::Faulted);
        // Let a frame-synced renderer keep drawing the frozen state
        self.handshake.set_enabled(false);
        self.publish(SchedulerEvent::Faulted { message });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Cloneable control surface for a running scheduler.
pub struct SchedulerHandle<E> {
    shared: Arc<Shared<E>>,
}

impl<E> Clone for SchedulerHandle<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E: Experiment> SchedulerHandle<E> {
    /// Suspend the loop before its next iteration.
    ///
    /// Returns once no iteration is in flight; from then on `iterate()` is
    /// not called until [`resume`](Self::resume). A no-op when already
    /// paused. Returns the resulting paused state.
    ///
    /// Must not be called from inside `iterate()` or a [`safe`](Self::safe)
    /// callback.
    pub fn pause(&self) -> bool {
        if self.shared.pause.pause() {
            self.shared.experiment.barrier();
            let iteration = self.iterations();
            debug!(iteration, "paused");
            self.shared.publish(SchedulerEvent::Paused { iteration });
        }
        true
    }

    /// Let the loop continue. A no-op when not paused. Returns the
    /// resulting paused state.
    pub fn resume(&self) -> bool {
        if self.shared.pause.resume() {
            let iteration = self.iterations();
            debug!(iteration, "resumed");
            self.shared.publish(SchedulerEvent::Resumed { iteration });
        }
        false
    }

    /// Pause if running, resume if paused. Returns the new paused state.
    pub fn toggle_pause(&self) -> bool {
        if self.is_paused() {
            self.resume()
        } else {
            self.pause()
        }
    }

    /// Whether the pause gate is closed.
    pub fn is_paused(&self) -> bool {
        self.shared.pause.is_paused()
    }

    /// Reinitialize the experiment at the next loop boundary.
    ///
    /// With `reseed`, a new seed is drawn now and used by that
    /// `initialize()`. A reset while paused reinitializes without resuming.
    pub fn reset(&self, reseed: bool) {
        let seed = if reseed {
            self.shared.draw_seed()
        } else {
            self.seed()
        };
        self.shared.reset_requested.store(true, Ordering::Release);
        self.shared.wake();
        debug!(reseed, seed, "reset requested");
        self.shared
            .publish(SchedulerEvent::ResetRequested { reseed, seed });
    }

    /// Stop the scheduler at the next loop boundary. Final.
    pub fn kill(&self) {
        if self.shared.kill_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("kill requested");
        self.shared.handshake.close();
        self.reset(false);
    }

    /// Whether [`kill`](Self::kill) has been called.
    pub fn is_killed(&self) -> bool {
        self.shared.kill_requested.load(Ordering::Acquire)
    }

    /// Set the target rate to `per_second` iterations per second.
    ///
    /// Takes effect at the next pacing computation.
    pub fn set_speed(&self, per_second: f64) -> Result<()> {
        let interval =
            interval_for_rate(per_second).ok_or(SchedulerError::InvalidSpeed(per_second))?;
        let nanos = u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX);
        self.shared.speed_nanos.store(nanos, Ordering::Relaxed);
        debug!(per_second, ?interval, "speed changed");
        Ok(())
    }

    /// Target interval between iterations.
    pub fn speed(&self) -> Duration {
        self.shared.speed()
    }

    /// Target rate in iterations per second.
    pub fn rate(&self) -> f64 {
        let secs = self.speed().as_secs_f64();
        if secs > 0.0 {
            1.0 / secs
        } else {
            f64::INFINITY
        }
    }

    /// Engage or disengage frame-sync. Blocked waiters on either side are
    /// released when it is turned off. Returns the resulting setting.
    pub fn set_frame_sync(&self, enabled: bool) -> bool {
        if enabled && !self.shared.mode.allows_frame_sync() {
            warn!(mode = %self.shared.mode, "frame-sync needs a renderer; ignoring");
            return false;
        }
        if self.shared.handshake.is_closed() {
            return self.frame_sync();
        }
        self.shared.handshake.set_enabled(enabled);
        debug!(enabled, "frame-sync changed");
        enabled
    }

    /// Whether frame-sync is engaged.
    pub fn frame_sync(&self) -> bool {
        self.shared.handshake.is_enabled()
    }

    /// Write a registered attribute between iterations.
    pub fn safe_set(&self, target: &str, attribute: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.shared.experiment.with(|slot| {
            self.shared
                .accessors
                .set(&mut slot.experiment, target, attribute, &value)
        })
    }

    /// Read a registered attribute between iterations.
    pub fn safe_get(&self, target: &str, attribute: &str) -> Result<Value> {
        self.shared
            .experiment
            .with(|slot| self.shared.accessors.get(&slot.experiment, target, attribute))
    }

    /// Run `f` between iterations with exclusive access to the experiment.
    pub fn safe<R>(&self, f: impl FnOnce(&mut E) -> R) -> R {
        self.shared.experiment.with(|slot| f(&mut slot.experiment))
    }

    /// Start recording a registered attribute after every iteration.
    pub fn track(&self, target: &str, attribute: &str) -> Result<()> {
        let accessors = &self.shared.accessors;
        if !accessors.contains(target, attribute) {
            return Err(SchedulerError::unknown(target, attribute));
        }
        let key = AccessorKey::new(target, attribute);
        self.shared.experiment.with(|slot| {
            let Slot {
                experiment,
                tracker,
                iteration,
                ..
            } = slot;
            if tracker.track(key.clone()) {
                tracker.record_one(&key, *iteration, accessors, experiment);
            }
        });
        Ok(())
    }

    /// Stop recording an attribute. Returns `false` if it was not tracked.
    pub fn untrack(&self, target: &str, attribute: &str) -> bool {
        let key = AccessorKey::new(target, attribute);
        self.shared.experiment.with(|slot| slot.tracker.untrack(&key))
    }

    /// One renderer tick: wait for the renderer's turn (frame-sync) and
    /// run `draw` over the state, then hand the turn back.
    ///
    /// Without frame-sync the turn wait is skipped; `draw` still runs under
    /// the iteration lock.
    pub fn render_frame<R>(
        &self,
        deadline: Option<Instant>,
        draw: impl FnOnce(&Frame<'_, E>) -> R,
    ) -> FrameOutcome<R> {
        let synced = match self.shared.handshake.wait_turn(Turn::Renderer, || false, deadline) {
            TurnOutcome::Granted => true,
            TurnOutcome::Bypassed => false,
            TurnOutcome::Aborted | TurnOutcome::TimedOut => return FrameOutcome::TimedOut,
            TurnOutcome::Closed => return FrameOutcome::Closed,
        };

        let drawn = {
            let slot = self.shared.experiment.lock();
            draw(&Frame {
                experiment: &slot.experiment,
                tracker: &slot.tracker,
                iteration: slot.iteration,
                cycle: slot.cycle,
                synced,
            })
        };

        if synced {
            self.shared.handshake.finish_turn(Turn::Renderer);
        }
        self.shared.frames.fetch_add(1, Ordering::AcqRel);
        FrameOutcome::Drawn(drawn)
    }

    /// Run `draw` over the state under the iteration lock, ignoring the
    /// frame-sync turn.
    pub fn inspect<R>(&self, draw: impl FnOnce(&Frame<'_, E>) -> R) -> R {
        let slot = self.shared.experiment.lock();
        draw(&Frame {
            experiment: &slot.experiment,
            tracker: &slot.tracker,
            iteration: slot.iteration,
            cycle: slot.cycle,
            synced: false,
        })
    }

    /// The operating mode.
    pub fn mode(&self) -> Mode {
        self.shared.mode
    }

    /// Where the scheduler thread is.
    pub fn phase(&self) -> Phase {
        self.shared.phase()
    }

    /// Time since the scheduler thread last changed phase.
    pub fn heartbeat_age(&self) -> Duration {
        let beat = Duration::from_nanos(self.shared.heartbeat_nanos.load(Ordering::Acquire));
        self.shared.epoch.elapsed().saturating_sub(beat)
    }

    /// Seed of the current cycle (or the next one, after a reseed).
    pub fn seed(&self) -> u64 {
        self.shared.seed.load(Ordering::Acquire)
    }

    /// Iterations completed in the current cycle.
    pub fn iterations(&self) -> u64 {
        self.shared.iterations.load(Ordering::Acquire)
    }

    /// Iterations completed across all cycles.
    pub fn total_iterations(&self) -> u64 {
        self.shared.total_iterations.load(Ordering::Acquire)
    }

    /// Current reset cycle (0 before the first `initialize()`).
    pub fn cycle(&self) -> u64 {
        self.shared.cycles.load(Ordering::Acquire)
    }

    /// Frames drawn through [`render_frame`](Self::render_frame).
    pub fn frames(&self) -> u64 {
        self.shared.frames.load(Ordering::Acquire)
    }

    /// Whether the loop is active.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Panic message if the experiment killed the scheduler thread.
    pub fn fault(&self) -> Option<String> {
        self.shared.fault.lock().clone()
    }

    /// Receiver for lifecycle events.
    ///
    /// All receivers share one queue: each event goes to exactly one of them.
    pub fn events(&self) -> Receiver<SchedulerEvent> {
        self.shared.events_rx.clone()
    }

    pub(crate) fn publish(&self, event: SchedulerEvent) {
        self.shared.publish(event);
    }

    /// Snapshot of the lifecycle state.
    pub fn state(&self) -> SchedulerState {
        let shared = &self.shared;
        SchedulerState {
            mode: shared.mode,
            phase: shared.phase(),
            running: shared.running.load(Ordering::Acquire),
            paused: shared.pause.is_paused(),
            reset_requested: shared.reset_requested.load(Ordering::Acquire),
            kill_requested: shared.kill_requested.load(Ordering::Acquire),
            frame_sync: shared.handshake.is_enabled(),
            speed: shared.speed(),
            seed: shared.seed.load(Ordering::Acquire),
            iteration: shared.iterations.load(Ordering::Acquire),
            total_iterations: shared.total_iterations.load(Ordering::Acquire),
            cycle: shared.cycles.load(Ordering::Acquire),
        }
    }
}

/// Owns the scheduler thread.
pub struct Scheduler<E: Experiment> {
    handle: SchedulerHandle<E>,
    thread: Option<JoinHandle<()>>,
}

impl<E: Experiment> Scheduler<E> {
    /// Create a scheduler with no accessors registered.
    pub fn new(experiment: E, config: SchedulerConfig) -> Result<Self> {
        Self::with_accessors(experiment, Accessors::new(), config)
    }

    /// Create a scheduler whose state is reachable through `accessors`.
    pub fn with_accessors(
        experiment: E,
        accessors: Accessors<E>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let interval =
            interval_for_rate(config.speed).ok_or(SchedulerError::InvalidSpeed(config.speed))?;
        let seed = config.seed.unwrap_or_else(rand::random);
        let frame_sync = config.frame_sync && config.mode.allows_frame_sync();
        if config.frame_sync && !frame_sync {
            debug!(mode = %config.mode, "mode has no renderer; frame-sync disabled");
        }
        let (events_tx, events_rx) = bounded(EVENT_CAPACITY);

        let shared = Shared {
            mode: config.mode,
            experiment: IterationLock::new(Slot {
                experiment,
                rng: SimRng::seed_from_u64(seed),
                tracker: Tracker::new(config.history_limit),
                iteration: 0,
                cycle: 0,
            }),
            accessors,
            pause: PauseGate::new(),
            handshake: HandshakeGate::new(frame_sync),
            running: AtomicBool::new(false),
            reset_requested: AtomicBool::new(false),
            kill_requested: AtomicBool::new(false),
            speed_nanos: AtomicU64::new(u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX)),
            seed: AtomicU64::new(seed),
            seed_source: Mutex::new(SimRng::seed_from_u64(seed.wrapping_mul(0x9e37_79b9_7f4a_7c15))),
            phase: AtomicU8::new(Phase::Idle as u8),
            epoch: Instant::now(),
            heartbeat_nanos: AtomicU64::new(0),
            iterations: AtomicU64::new(0),
            total_iterations: AtomicU64::new(0),
            cycles: AtomicU64::new(0),
            frames: AtomicU64::new(0),
            fault: Mutex::new(None),
            events_tx,
            events_rx,
        };

        Ok(Self {
            handle: SchedulerHandle {
                shared: Arc::new(shared),
            },
            thread: None,
        })
    }

    /// A control handle.
    pub fn handle(&self) -> SchedulerHandle<E> {
        self.handle.clone()
    }

    /// Refuse to start once killed, faulted, or already running.
    fn check_startable(&self) -> Result<()> {
        if let Some(message) = self.handle.fault() {
            return Err(SchedulerError::ExperimentPanicked(message));
        }
        if self.handle.is_killed() {
            return Err(SchedulerError::Killed);
        }
        if self.thread.as_ref().is_some_and(|t| !t.is_finished()) || self.handle.is_running() {
            return Err(SchedulerError::AlreadyRunning);
        }
        Ok(())
    }

    /// Start the scheduler thread.
    ///
    /// A scheduler whose experiment panicked cannot be started again; the
    /// panic is returned instead.
    pub fn run(&mut self) -> Result<()> {
        self.check_startable()?;

        let shared = Arc::clone(&self.handle.shared);
        let seed = shared.seed.load(Ordering::Acquire);
        let thread = thread::Builder::new()
            .name("lockstep-scheduler".to_string())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| shared.run_loop()));
                if let Err(payload) = outcome {
                    shared.record_fault(panic_message(payload.as_ref()));
                }
            })
            .map_err(SchedulerError::Spawn)?;

        info!(mode = %self.handle.mode(), seed, "scheduler started");
        self.handle.publish(SchedulerEvent::Started { seed });
        self.thread = Some(thread);
        Ok(())
    }

    /// Run to completion on the calling thread: initialize, then iterate
    /// with no pacing and no handshake until the experiment reports it is
    /// finished, `max_iterations` is reached, or the scheduler is killed.
    pub fn run_to_completion(&mut self, max_iterations: Option<u64>) -> Result<RunReport> {
        self.check_startable()?;

        let shared = &self.handle.shared;
        let seed = shared.seed.load(Ordering::Acquire);
        let started = Instant::now();
        info!(seed, ?max_iterations, "running to completion");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            shared.running.store(true, Ordering::Release);
            shared.initialize();
            loop {
                if shared.kill_requested.load(Ordering::Acquire) {
                    break;
                }
                let mut slot = shared.experiment.lock();
                if slot.experiment.is_finished()
                    || max_iterations.is_some_and(|max| slot.iteration >= max)
                {
                    break;
                }
                shared.enter(Phase::Iterating);
                slot.step(&shared.accessors);
                shared.iterations.store(slot.iteration, Ordering::Release);
                shared.total_iterations.fetch_add(1, Ordering::AcqRel);
            }
            shared.running.store(false, Ordering::Release);
            shared.enter(Phase::Stopped);
            shared.iterations.load(Ordering::Acquire)
        }));

        match outcome {
            Ok(iterations) => {
                let elapsed = started.elapsed();
                info!(iterations, ?elapsed, "run complete");
                shared.publish(SchedulerEvent::Stopped {
                    iteration: iterations,
                });
                Ok(RunReport {
                    iterations,
                    seed,
                    elapsed,
                })
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                shared.record_fault(message.clone());
                Err(SchedulerError::ExperimentPanicked(message))
            }
        }
    }

    /// Whether the scheduler thread has exited (or never started).
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the scheduler thread to exit.
    ///
    /// Returns the experiment's panic if that is what ended it.
    pub fn join(&mut self) -> Result<()> {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        match self.handle.fault() {
            Some(message) => Err(SchedulerError::ExperimentPanicked(message)),
            None => Ok(()),
        }
    }

    /// Kill and wait.
    pub fn shutdown(&mut self) -> Result<()> {
        self.handle.kill();
        self.join()
    }
}

impl<E: Experiment> Drop for Scheduler<E> {
    fn drop(&mut self) {
        self.handle.kill();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Poll `cond` until it holds or `timeout` passes.
    fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[derive(Default)]
    struct Counter {
        value: u64,
        log: Vec<&'static str>,
    }

    impl Experiment for Counter {
        fn initialize(&mut self, _rng: &mut SimRng) {
            self.value = 0;
            self.log.push("init");
        }

        fn iterate(&mut self, _rng: &mut SimRng) {
            self.value += 1;
            self.log.push("iter");
        }
    }

    #[derive(Default)]
    struct Draws {
        first: u64,
    }

    impl Experiment for Draws {
        fn initialize(&mut self, rng: &mut SimRng) {
            self.first = rng.gen();
        }

        fn iterate(&mut self, _rng: &mut SimRng) {}
    }

    fn unsynced(seed: u64, speed: f64) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_mode(Mode::Unsafe)
            .with_seed(seed)
            .with_speed(speed)
            .with_frame_sync(false)
    }

    #[test]
    fn test_pacing_hits_target_rate() {
        let mut scheduler = Scheduler::new(Counter::default(), unsynced(42, 100.0)).unwrap();
        let handle = scheduler.handle();
        scheduler.run().unwrap();

        thread::sleep(Duration::from_secs(1));
        let count = handle.iterations();
        scheduler.shutdown().unwrap();

        assert!((90..=110).contains(&count), "iterations in 1s: {count}");
    }

    #[test]
    fn test_pause_holds_then_resume_continues() {
        let mut scheduler = Scheduler::new(Counter::default(), unsynced(42, 100.0)).unwrap();
        let handle = scheduler.handle();
        scheduler.run().unwrap();

        thread::sleep(Duration::from_millis(500));
        assert!(handle.pause());
        let frozen = handle.iterations();
        assert!(frozen > 0);

        thread::sleep(Duration::from_millis(200));
        assert_eq!(handle.iterations(), frozen);
        assert_eq!(handle.phase(), Phase::Paused);

        assert!(!handle.resume());
        // Counting picks up within a pacing interval or so
        assert!(wait_until(Duration::from_millis(20), || handle.iterations() > frozen));

        // No iteration skipped or duplicated across the pause
        let (value, count) = handle.safe(|c| (c.value, c.log.len()));
        assert_eq!(value, handle.iterations());
        assert_eq!(count as u64, value + 1);
        scheduler.shutdown().unwrap();
    }

    #[test]
    fn test_double_pause_and_stray_resume_are_noops() {
        let scheduler = Scheduler::new(Counter::default(), unsynced(1, 1000.0)).unwrap();
        let handle = scheduler.handle();

        assert!(!handle.resume());
        assert!(handle.pause());
        assert!(handle.pause());
        assert!(handle.is_paused());
        assert!(!handle.resume());
        assert!(!handle.resume());
        assert!(handle.toggle_pause());
        assert!(!handle.toggle_pause());
    }

    #[test]
    fn test_frame_sync_one_iteration_per_frame() {
        let config = SchedulerConfig::default().with_seed(7).with_frame_sync(true);
        let mut scheduler = Scheduler::new(Counter::default(), config).unwrap();
        let handle = scheduler.handle();
        scheduler.run().unwrap();

        for tick in 0..10u64 {
            let deadline = Instant::now() + Duration::from_secs(2);
            let seen = handle.render_frame(Some(deadline), |frame| {
                assert!(frame.is_synced());
                frame.iteration()
            });
            // Renderer goes first, so tick k sees exactly k iterations
            assert_eq!(seen, FrameOutcome::Drawn(tick));
        }

        assert!(wait_until(Duration::from_secs(1), || handle.iterations() == 10));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(handle.iterations(), 10);
        assert_eq!(handle.frames(), 10);
        assert_eq!(handle.phase(), Phase::AwaitingTurn);
        scheduler.shutdown().unwrap();
    }

    #[test]
    fn test_disabling_frame_sync_releases_scheduler() {
        let config = SchedulerConfig::default().with_seed(3).with_speed(1000.0);
        let mut scheduler = Scheduler::new(Counter::default(), config).unwrap();
        let handle = scheduler.handle();
        scheduler.run().unwrap();

        // Nobody renders: the scheduler sits waiting for its turn
        thread::sleep(Duration::from_millis(50));
        assert_eq!(handle.iterations(), 0);

        assert!(!handle.set_frame_sync(false));
        assert!(wait_until(Duration::from_secs(1), || handle.iterations() > 5));
        scheduler.shutdown().unwrap();
    }

    #[test]
    fn test_frame_sync_refused_without_renderer() {
        let config = SchedulerConfig::default().with_mode(Mode::Safe);
        let scheduler = Scheduler::new(Counter::default(), config).unwrap();
        let handle = scheduler.handle();
        assert!(!handle.frame_sync());
        assert!(!handle.set_frame_sync(true));
        assert!(!handle.frame_sync());
    }

    #[test]
    fn test_reset_initializes_exactly_once_before_next_iterate() {
        let mut scheduler = Scheduler::new(Counter::default(), unsynced(5, 1000.0)).unwrap();
        let handle = scheduler.handle();
        scheduler.run().unwrap();

        assert!(wait_until(Duration::from_secs(1), || handle.iterations() >= 5));
        handle.reset(false);
        assert!(wait_until(Duration::from_secs(1), || handle.cycle() == 2
            && handle.iterations() >= 3));
        handle.pause();

        let log = handle.safe(|c| c.log.clone());
        assert_eq!(log[0], "init");
        assert_eq!(log.iter().filter(|e| **e == "init").count(), 2);
        let second = log.iter().rposition(|e| *e == "init").unwrap();
        assert!(log[1..second].iter().all(|e| *e == "iter"));
        assert!(log[second + 1..].iter().all(|e| *e == "iter"));
        assert_eq!(handle.seed(), 5);
        scheduler.shutdown().unwrap();
    }

    #[test]
    fn test_reset_while_paused_reinitializes_and_stays_paused() {
        let mut scheduler = Scheduler::new(Counter::default(), unsynced(5, 1000.0)).unwrap();
        let handle = scheduler.handle();
        scheduler.run().unwrap();

        assert!(wait_until(Duration::from_secs(1), || handle.iterations() >= 3));
        handle.pause();
        handle.reset(false);

        assert!(wait_until(Duration::from_secs(1), || handle.cycle() == 2));
        thread::sleep(Duration::from_millis(50));
        assert!(handle.is_paused());
        assert_eq!(handle.iterations(), 0);
        assert_eq!(handle.safe(|c| c.value), 0);
        scheduler.shutdown().unwrap();
    }

    #[test]
    fn test_reseed_changes_seed_and_draws() {
        let mut scheduler = Scheduler::new(Draws::default(), unsynced(42, 1000.0)).unwrap();
        let handle = scheduler.handle();
        scheduler.run().unwrap();

        assert!(wait_until(Duration::from_secs(1), || handle.cycle() == 1));
        let first = handle.safe(|d| d.first);
        assert_eq!(handle.seed(), 42);

        handle.reset(true);
        let reseeded = handle.seed();
        assert_ne!(reseeded, 42);
        assert!(wait_until(Duration::from_secs(1), || handle.cycle() == 2));
        let second = handle.safe(|d| d.first);
        assert_ne!(first, second);

        // Plain reset replays the same seed
        handle.reset(false);
        assert!(wait_until(Duration::from_secs(1), || handle.cycle() == 3));
        assert_eq!(handle.safe(|d| d.first), second);
        scheduler.shutdown().unwrap();

        // Same starting seed, same reseed sequence
        let other = Scheduler::new(Draws::default(), unsynced(42, 1000.0)).unwrap();
        other.handle().reset(true);
        assert_eq!(other.handle().seed(), reseeded);
    }

    #[test]
    fn test_safe_mutation_is_atomic() {
        struct Pair {
            a: u64,
            b: u64,
            torn: u64,
        }

        impl Experiment for Pair {
            fn initialize(&mut self, _rng: &mut SimRng) {}

            fn iterate(&mut self, _rng: &mut SimRng) {
                if self.a != self.b {
                    self.torn += 1;
                }
            }
        }

        let mut accessors = Accessors::new();
        accessors.register(
            "pair",
            "value",
            |p: &Pair| p.a,
            |p, v: u64| {
                p.a = v;
                thread::yield_now();
                p.b = v;
            },
        );

        let pair = Pair { a: 0, b: 0, torn: 0 };
        let mut scheduler =
            Scheduler::with_accessors(pair, accessors, unsynced(9, 10_000.0)).unwrap();
        let handle = scheduler.handle();
        scheduler.run().unwrap();

        let writers: Vec<_> = (0..2u64)
            .map(|w| {
                let handle = handle.clone();
                thread::spawn(move || {
                    for i in 0..300 {
                        let value = i64::try_from(w * 1000 + i).unwrap();
                        handle.safe_set("pair", "value", value).unwrap();
                        handle.safe(|p| {
                            p.a += 1;
                            thread::yield_now();
                            p.b += 1;
                        });
                    }
                })
            })
            .collect();

        for _ in 0..200 {
            let outcome = handle.render_frame(None, |frame| {
                let p = frame.experiment();
                p.a == p.b
            });
            assert_eq!(outcome, FrameOutcome::Drawn(true));
        }

        for w in writers {
            w.join().unwrap();
        }
        assert_eq!(handle.safe(|p| p.torn), 0);
        let a = handle.safe(|p| i64::try_from(p.a).unwrap());
        assert_eq!(handle.safe_get("pair", "value").unwrap(), Value::Int(a));
        scheduler.shutdown().unwrap();
    }

    #[test]
    fn test_safe_set_errors_propagate() {
        let scheduler = Scheduler::new(Counter::default(), unsynced(1, 1000.0)).unwrap();
        let handle = scheduler.handle();
        assert!(matches!(
            handle.safe_set("counter", "value", 3),
            Err(SchedulerError::UnknownAccessor { .. })
        ));
        assert!(matches!(
            handle.track("counter", "value"),
            Err(SchedulerError::UnknownAccessor { .. })
        ));
    }

    #[test]
    fn test_tracked_history_restarts_on_reset() {
        let mut accessors = Accessors::new();
        accessors.register_read_only("counter", "value", |c: &Counter| c.value);

        let mut scheduler =
            Scheduler::with_accessors(Counter::default(), accessors, unsynced(2, 1000.0)).unwrap();
        let handle = scheduler.handle();
        handle.track("counter", "value").unwrap();
        scheduler.run().unwrap();

        assert!(wait_until(Duration::from_secs(1), || handle.iterations() >= 10));
        handle.pause();
        let samples = handle
            .render_frame(None, |f| f.tracker().history("counter", "value").map(|h| h.len()));
        let iterations = handle.iterations();
        // Sample at iteration 0 plus one per iteration
        assert_eq!(samples, FrameOutcome::Drawn(Some(usize::try_from(iterations).unwrap() + 1)));

        handle.reset(false);
        assert!(wait_until(Duration::from_secs(1), || handle.cycle() == 2));
        let history = handle.render_frame(None, |f| {
            f.tracker()
                .history("counter", "value")
                .map(|h| h.iter().map(|s| s.iteration).collect::<Vec<_>>())
        });
        assert_eq!(history, FrameOutcome::Drawn(Some(vec![0])));

        assert!(handle.untrack("counter", "value"));
        scheduler.shutdown().unwrap();
    }

    #[test]
    fn test_invalid_speed_rejected() {
        let scheduler = Scheduler::new(Counter::default(), unsynced(1, 1000.0)).unwrap();
        let handle = scheduler.handle();
        assert!(matches!(handle.set_speed(0.0), Err(SchedulerError::InvalidSpeed(_))));
        handle.set_speed(100.0).unwrap();
        assert!((handle.speed().as_secs_f64() - 0.01).abs() < 1e-9);
        assert!((handle.rate() - 100.0).abs() < 1e-6);

        assert!(matches!(
            Scheduler::new(Counter::default(), unsynced(1, -1.0)),
            Err(SchedulerError::InvalidSpeed(_))
        ));
    }

    #[test]
    fn test_kill_exits_from_pause_and_handshake() {
        // Paused
        let mut scheduler = Scheduler::new(Counter::default(), unsynced(1, 1000.0)).unwrap();
        let handle = scheduler.handle();
        scheduler.run().unwrap();
        handle.pause();
        handle.kill();
        assert!(wait_until(Duration::from_secs(1), || handle.phase() == Phase::Stopped));
        scheduler.join().unwrap();
        assert!(matches!(scheduler.run(), Err(SchedulerError::Killed)));

        // Blocked on its turn with no renderer
        let config = SchedulerConfig::default().with_seed(1);
        let mut scheduler = Scheduler::new(Counter::default(), config).unwrap();
        let handle = scheduler.handle();
        scheduler.run().unwrap();
        thread::sleep(Duration::from_millis(20));
        handle.kill();
        assert!(wait_until(Duration::from_secs(1), || scheduler.is_finished()));
        assert_eq!(handle.render_frame(None, |_| ()), FrameOutcome::Closed);
        scheduler.join().unwrap();
    }

    #[test]
    fn test_run_twice_rejected() {
        let mut scheduler = Scheduler::new(Counter::default(), unsynced(1, 1000.0)).unwrap();
        scheduler.run().unwrap();
        assert!(matches!(scheduler.run(), Err(SchedulerError::AlreadyRunning)));
        assert!(matches!(
            scheduler.run_to_completion(Some(1)),
            Err(SchedulerError::AlreadyRunning)
        ));
        scheduler.shutdown().unwrap();
    }

    #[test]
    fn test_experiment_panic_is_surfaced() {
        struct Fragile;

        impl Experiment for Fragile {
            fn initialize(&mut self, _rng: &mut SimRng) {}

            fn iterate(&mut self, _rng: &mut SimRng) {
                panic!("boom");
            }
        }

        let mut scheduler = Scheduler::new(Fragile, unsynced(1, 1000.0)).unwrap();
        let handle = scheduler.handle();
        let events = handle.events();
        scheduler.run().unwrap();

        assert!(wait_until(Duration::from_secs(1), || handle.fault().is_some()));
        assert_eq!(handle.phase(), Phase::Faulted);
        assert!(!handle.is_running());
        assert!(matches!(
            scheduler.join(),
            Err(SchedulerError::ExperimentPanicked(msg)) if msg == "boom"
        ));

        let faulted = events
            .try_iter()
            .any(|e| matches!(e, SchedulerEvent::Faulted { ref message } if message == "boom"));
        assert!(faulted);
    }

    #[test]
    fn test_fault_survives_full_event_queue() {
        struct Fragile;

        impl Experiment for Fragile {
            fn initialize(&mut self, _rng: &mut SimRng) {}

            fn iterate(&mut self, _rng: &mut SimRng) {
                panic!("boom");
            }
        }

        let mut scheduler = Scheduler::new(Fragile, unsynced(1, 1000.0)).unwrap();
        let handle = scheduler.handle();
        let events = handle.events();
        for _ in 0..EVENT_CAPACITY {
            handle.pause();
            handle.resume();
        }
        assert_eq!(events.len(), EVENT_CAPACITY);

        scheduler.run().unwrap();
        assert!(wait_until(Duration::from_secs(1), || handle.fault().is_some()));
        assert!(scheduler.join().is_err());

        let seen: Vec<SchedulerEvent> = events.try_iter().collect();
        assert_eq!(seen.len(), EVENT_CAPACITY);
        assert!(seen
            .iter()
            .any(|e| matches!(e, SchedulerEvent::Faulted { message } if message == "boom")));
        assert!(seen.iter().any(|e| matches!(e, SchedulerEvent::Started { .. })));
    }

    #[test]
    fn test_faulted_scheduler_cannot_restart() {
        struct PanicsOnce {
            panicked: bool,
        }

        impl Experiment for PanicsOnce {
            fn initialize(&mut self, _rng: &mut SimRng) {}

            fn iterate(&mut self, _rng: &mut SimRng) {
                if !self.panicked {
                    self.panicked = true;
                    panic!("first");
                }
            }
        }

        let experiment = PanicsOnce { panicked: false };
        let mut scheduler = Scheduler::new(experiment, unsynced(1, 1000.0)).unwrap();
        let handle = scheduler.handle();
        scheduler.run().unwrap();
        assert!(wait_until(Duration::from_secs(1), || scheduler.is_finished()));

        assert!(matches!(
            scheduler.run(),
            Err(SchedulerError::ExperimentPanicked(msg)) if msg == "first"
        ));
        assert!(matches!(
            scheduler.run_to_completion(Some(5)),
            Err(SchedulerError::ExperimentPanicked(msg)) if msg == "first"
        ));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(handle.total_iterations(), 0);
        assert!(!handle.is_running());
        assert_eq!(handle.phase(), Phase::Faulted);
    }

    #[test]
    fn test_run_to_completion() {
        struct Finite {
            n: u64,
        }

        impl Experiment for Finite {
            fn initialize(&mut self, _rng: &mut SimRng) {
                self.n = 0;
            }

            fn iterate(&mut self, _rng: &mut SimRng) {
                self.n += 1;
            }

            fn is_finished(&self) -> bool {
                self.n >= 25
            }
        }

        let config = SchedulerConfig::default().with_mode(Mode::Optimal).with_seed(11);
        let mut scheduler = Scheduler::new(Finite { n: 99 }, config.clone()).unwrap();
        let report = scheduler.run_to_completion(None).unwrap();
        assert_eq!(report.iterations, 25);
        assert_eq!(report.seed, 11);
        assert_eq!(scheduler.handle().phase(), Phase::Stopped);

        let mut bounded = Scheduler::new(Counter::default(), config).unwrap();
        let report = bounded.run_to_completion(Some(10)).unwrap();
        assert_eq!(report.iterations, 10);
    }

    #[test]
    fn test_events_follow_lifecycle() {
        let mut scheduler = Scheduler::new(Counter::default(), unsynced(8, 1000.0)).unwrap();
        let handle = scheduler.handle();
        let events = handle.events();
        scheduler.run().unwrap();

        assert!(wait_until(Duration::from_secs(1), || handle.iterations() > 0));
        handle.pause();
        handle.resume();
        scheduler.shutdown().unwrap();

        let seen: Vec<SchedulerEvent> = events.try_iter().collect();
        assert!(seen.contains(&SchedulerEvent::Started { seed: 8 }));
        assert!(seen.contains(&SchedulerEvent::Initialized { cycle: 1, seed: 8 }));
        assert!(seen.iter().any(|e| matches!(e, SchedulerEvent::Paused { .. })));
        assert!(seen.iter().any(|e| matches!(e, SchedulerEvent::Resumed { .. })));
        assert!(matches!(seen.last(), Some(SchedulerEvent::Stopped { .. })));
    }

    #[test]
    fn test_state_snapshot() {
        let config = unsynced(77, 50.0);
        let scheduler = Scheduler::new(Counter::default(), config).unwrap();
        let state = scheduler.handle().state();
        assert_eq!(state.mode, Mode::Unsafe);
        assert_eq!(state.phase, Phase::Idle);
        assert!(!state.running);
        assert!(!state.paused);
        assert!(!state.frame_sync);
        assert_eq!(state.seed, 77);
        assert!((state.speed.as_secs_f64() - 0.02).abs() < 1e-9);
        assert_eq!(state.cycle, 0);
    }
}
