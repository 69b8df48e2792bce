//! Input Actor: dedicated thread for polling the keyboard.
//!
//! Polls crossterm for key presses, translates them through the key
//! bindings below, and forwards the resulting [`Command`]s to the console.
//!
//! | Key            | Command                    |
//! |----------------|----------------------------|
//! | `space`, `p`   | toggle pause               |
//! | `r`            | reset                      |
//! | `R`            | reset with a new seed      |
//! | `f`            | toggle frame-sync          |
//! | `+`, `=`       | double the speed           |
//! | `-`            | halve the speed            |
//! | `q`, `Esc`, `Ctrl-C` | kill                 |

use super::messages::Command;
use crate::error::{Result, SchedulerError};
use crossbeam_channel::Sender;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Speed multiplier for one `+`/`-` press.
const SPEED_STEP: f64 = 2.0;

/// Input actor that polls terminal key events.
pub struct InputActor {
    /// Handle to the input thread.
    handle: Option<JoinHandle<()>>,
    /// Flag to signal shutdown.
    shutdown: Arc<AtomicBool>,
}

impl InputActor {
    /// Spawn the input actor thread.
    ///
    /// The terminal should already be in raw mode, or keys only arrive
    /// after Enter.
    pub fn spawn<E: Send + 'static>(sender: Sender<Command<E>>, poll_timeout: Duration) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let handle = thread::Builder::new()
            .name("lockstep-input".to_string())
            .spawn(move || {
                Self::run_loop(&sender, &shutdown_clone, poll_timeout);
            })
            .map_err(SchedulerError::Spawn)?;

        Ok(Self {
            handle: Some(handle),
            shutdown,
        })
    }

    /// Signal the input thread to shutdown.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Wait for the input thread to finish.
    pub fn join(mut self) {
        self.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Main input polling loop.
    fn run_loop<E>(sender: &Sender<Command<E>>, shutdown: &AtomicBool, poll_timeout: Duration) {
        while !shutdown.load(Ordering::Relaxed) {
            match event::poll(poll_timeout) {
                Ok(true) => match event::read() {
                    Ok(Event::Key(key)) => {
                        let Some(command) = Self::command_for(key) else {
                            continue;
                        };
                        let stop = matches!(command, Command::Kill);
                        if sender.send(command).is_err() {
                            // Console gone
                            break;
                        }
                        if stop {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "failed to read terminal event"),
                },
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "terminal polling failed; input thread exiting");
                    break;
                }
            }
        }
        debug!("input thread exiting");
    }

    /// Translate a key press into a command.
    pub fn command_for<E>(key: KeyEvent) -> Option<Command<E>> {
        // Only process key press events (not release or repeat)
        if key.kind != KeyEventKind::Press {
            return None;
        }

        Some(match key.code {
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Command::Kill,
            KeyCode::Char(' ' | 'p') => Command::TogglePause,
            KeyCode::Char('r') => Command::Reset { reseed: false },
            KeyCode::Char('R') => Command::Reset { reseed: true },
            KeyCode::Char('f') => Command::ToggleFrameSync,
            KeyCode::Char('+' | '=') => Command::ScaleSpeed(SPEED_STEP),
            KeyCode::Char('-') => Command::ScaleSpeed(1.0 / SPEED_STEP),
            KeyCode::Char('q') | KeyCode::Esc => Command::Kill,
            _ => return None,
        })
    }
}

impl Drop for InputActor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
