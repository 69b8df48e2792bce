//! Console Actor: applies control commands to the scheduler.
//!
//! Anything that wants to steer a run (key bindings, a script, a test)
//! sends [`Command`]s down a channel; this thread is the only one that
//! turns them into calls on the [`SchedulerHandle`].

use super::messages::Command;
use super::scheduler::SchedulerHandle;
use crate::error::{Result, SchedulerError};
use crate::experiment::Experiment;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Console actor that owns the command receiver.
pub struct ConsoleActor {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

/// Whether the console should keep reading after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep going.
    Continue,
    /// A kill was applied.
    Stop,
}

/// Apply one command.
pub fn apply<E: Experiment>(scheduler: &SchedulerHandle<E>, command: Command<E>) -> Result<Flow> {
    debug!(?command, "applying command");
    match command {
        Command::Pause => {
            scheduler.pause();
        }
        Command::Resume => {
            scheduler.resume();
        }
        Command::TogglePause => {
            let paused = scheduler.toggle_pause();
            info!(paused, "pause toggled");
        }
        Command::Reset { reseed } => scheduler.reset(reseed),
        Command::Speed(rate) => scheduler.set_speed(rate)?,
        Command::ScaleSpeed(factor) => {
            let rate = scheduler.rate() * factor;
            scheduler.set_speed(rate)?;
            info!(rate, "speed changed");
        }
        Command::FrameSync(enabled) => {
            scheduler.set_frame_sync(enabled);
        }
        Command::ToggleFrameSync => {
            let enabled = scheduler.set_frame_sync(!scheduler.frame_sync());
            info!(enabled, "frame-sync toggled");
        }
        Command::Set {
            target,
            attribute,
            value,
        } => scheduler.safe_set(&target, &attribute, value)?,
        Command::Safe(f) => scheduler.safe(f),
        Command::Kill => {
            scheduler.kill();
            return Ok(Flow::Stop);
        }
    }
    Ok(Flow::Continue)
}

impl ConsoleActor {
    /// Spawn the console thread reading from `receiver`.
    ///
    /// `poll_timeout` bounds how long it waits before re-checking shutdown.
    pub fn spawn<E: Experiment>(
        scheduler: SchedulerHandle<E>,
        receiver: Receiver<Command<E>>,
        poll_timeout: Duration,
    ) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let handle = thread::Builder::new()
            .name("lockstep-console".to_string())
            .spawn(move || Self::run_loop(&scheduler, &receiver, &shutdown_clone, poll_timeout))
            .map_err(SchedulerError::Spawn)?;

        Ok(Self {
            handle: Some(handle),
            shutdown,
        })
    }

    fn run_loop<E: Experiment>(
        scheduler: &SchedulerHandle<E>,
        receiver: &Receiver<Command<E>>,
        shutdown: &AtomicBool,
        poll_timeout: Duration,
    ) {
        while !shutdown.load(Ordering::Relaxed) {
            match receiver.recv_timeout(poll_timeout) {
                Ok(command) => match apply(scheduler, command) {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Stop) => break,
                    Err(e) => warn!(error = %e, "command rejected"),
                },
                Err(RecvTimeoutError::Timeout) => {
                    if scheduler.is_killed() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("command channel closed");
                    break;
                }
            }
        }
    }

    /// Whether the console thread has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Signal the console thread to shutdown.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Wait for the console thread to finish.
    pub fn join(mut self) {
        self.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ConsoleActor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
