//! Watchdog Actor: reports a scheduler stuck inside experiment code.
//!
//! Pause, reset and kill only take effect between iterations, so an
//! `iterate()` that never returns makes them all hang. The watchdog cannot
//! fix that, but it makes it visible: when the scheduler has been inside
//! `initialize()` or `iterate()` longer than the timeout it logs a warning
//! and publishes [`SchedulerEvent::Stalled`], once per stall.

use super::messages::SchedulerEvent;
use super::scheduler::SchedulerHandle;
use crate::error::{Result, SchedulerError};
use crate::experiment::Experiment;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Watchdog actor polling the scheduler's heartbeat.
pub struct Watchdog {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl Watchdog {
    /// Spawn the watchdog, flagging busy phases older than `timeout`.
    pub fn spawn<E: Experiment>(scheduler: SchedulerHandle<E>, timeout: Duration) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let poll = (timeout / 4).clamp(Duration::from_millis(1), Duration::from_millis(250));

        let handle = thread::Builder::new()
            .name("lockstep-watchdog".to_string())
            .spawn(move || Self::run_loop(&scheduler, &shutdown_clone, timeout, poll))
            .map_err(SchedulerError::Spawn)?;

        Ok(Self {
            handle: Some(handle),
            shutdown,
        })
    }

    fn run_loop<E: Experiment>(
        scheduler: &SchedulerHandle<E>,
        shutdown: &AtomicBool,
        timeout: Duration,
        poll: Duration,
    ) {
        let mut stalled = false;

        while !shutdown.load(Ordering::Relaxed) {
            let phase = scheduler.phase();
            if phase.is_terminal() {
                if let Some(message) = scheduler.fault() {
                    error!(%message, "scheduler faulted; watchdog exiting");
                }
                break;
            }

            let age = scheduler.heartbeat_age();
            if phase.is_busy() && age > timeout {
                if !stalled {
                    warn!(?phase, ?age, "scheduler stalled in experiment code");
                    scheduler.publish(SchedulerEvent::Stalled { phase, since: age });
                    stalled = true;
                }
            } else if stalled {
                debug!(?phase, "scheduler recovered");
                stalled = false;
            }

            thread::sleep(poll);
        }
    }

    /// Whether the watchdog thread has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Signal the watchdog thread to shutdown.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Wait for the watchdog thread to finish.
    pub fn join(mut self) {
        self.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}
