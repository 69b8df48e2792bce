//! Renderer Actor: dedicated thread that draws the experiment.
//!
//! The actor ticks at a fixed frame rate. Each tick it asks the scheduler
//! for a [`Frame`] (waiting for its turn when frame-sync is on) and hands
//! it to a [`View`]. The view never touches the experiment outside a frame,
//! so it never sees a half-finished iteration.

use super::scheduler::{Frame, FrameOutcome, SchedulerHandle};
use crate::error::{Result, SchedulerError};
use crate::experiment::Experiment;
use crate::timing::{interval_for_rate, FrameClock};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

/// Longest the render thread sleeps before re-checking for shutdown.
const IDLE_CAP: Duration = Duration::from_millis(16);

/// Something that can display the experiment.
pub trait View<E>: Send + 'static {
    /// Draw one frame.
    fn render(&mut self, frame: &Frame<'_, E>) -> io::Result<()>;

    /// The experiment was reinitialized; drop any accumulated visuals.
    ///
    /// Called before the first `render` of every cycle.
    fn reset(&mut self, frame: &Frame<'_, E>) -> io::Result<()> {
        let _ = frame;
        Ok(())
    }
}

impl<E, V: View<E> + ?Sized> View<E> for Box<V> {
    fn render(&mut self, frame: &Frame<'_, E>) -> io::Result<()> {
        (**self).render(frame)
    }

    fn reset(&mut self, frame: &Frame<'_, E>) -> io::Result<()> {
        (**self).reset(frame)
    }
}

/// Render statistics for debugging/profiling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderStats {
    /// Frames handed to the view.
    pub frames: u64,
    /// Ticks skipped because the scheduler was paused.
    pub skipped: u64,
    /// Ticks where the renderer's turn did not come in time.
    pub timed_out: u64,
    /// Times the view was reset.
    pub resets: u64,
    /// Average draw time in microseconds.
    pub avg_render_us: u64,
    /// Last draw time in microseconds.
    pub last_render_us: u64,
}

impl RenderStats {
    fn record_draw(&mut self, elapsed: Duration) {
        self.frames += 1;
        self.last_render_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);

        // Smoothed average
        if self.avg_render_us == 0 {
            self.avg_render_us = self.last_render_us;
        } else {
            self.avg_render_us = (self.avg_render_us * 15 + self.last_render_us) / 16;
        }
    }
}

/// Renderer actor that drives a [`View`].
pub struct RendererActor {
    /// Handle to the render thread.
    handle: Option<JoinHandle<()>>,
    /// Flag to signal shutdown.
    shutdown: Arc<AtomicBool>,
    /// Frame interval in nanoseconds, read at every tick.
    interval_nanos: Arc<AtomicU64>,
    stats: Arc<Mutex<RenderStats>>,
}

struct RenderLoop<E, V> {
    scheduler: SchedulerHandle<E>,
    view: V,
    shutdown: Arc<AtomicBool>,
    interval_nanos: Arc<AtomicU64>,
    stats: Arc<Mutex<RenderStats>>,
    /// Cycle the view last drew; a change triggers `View::reset`.
    cycle: u64,
}

impl<E: Experiment, V: View<E>> RenderLoop<E, V> {
    fn interval(&self) -> Duration {
        Duration::from_nanos(self.interval_nanos.load(Ordering::Relaxed))
    }

    fn run(&mut self) -> io::Result<()> {
        let scheduler = self.scheduler.clone();
        let mut clock = FrameClock::new(self.interval());

        while !self.shutdown.load(Ordering::Relaxed) {
            let interval = self.interval();
            if interval != clock.interval() {
                clock.set_interval(interval);
            }

            let now = Instant::now();
            if clock.poll(now).is_none() {
                thread::sleep(clock.until_next(now).min(IDLE_CAP));
                continue;
            }

            if scheduler.is_paused() {
                // Still show a reset that happened while paused
                if scheduler.cycle() != self.cycle {
                    scheduler.inspect(|frame| self.draw(frame))?;
                } else {
                    self.stats.lock().skipped += 1;
                }
                continue;
            }

            let deadline = Instant::now() + interval;
            match scheduler.render_frame(Some(deadline), |frame| self.draw(frame)) {
                FrameOutcome::Drawn(result) => result?,
                FrameOutcome::TimedOut => {
                    trace!("renderer turn timed out");
                    self.stats.lock().timed_out += 1;
                }
                FrameOutcome::Closed => {
                    debug!("scheduler closed; renderer exiting");
                    break;
                }
            }
        }

        Ok(())
    }

    fn draw(&mut self, frame: &Frame<'_, E>) -> io::Result<()> {
        let start = Instant::now();
        if frame.cycle() != self.cycle {
            self.view.reset(frame)?;
            self.cycle = frame.cycle();
            self.stats.lock().resets += 1;
        }
        self.view.render(frame)?;
        self.stats.lock().record_draw(start.elapsed());
        Ok(())
    }
}

impl RendererActor {
    /// Spawn the renderer actor thread ticking at `fps` frames per second.
    pub fn spawn<E, V>(scheduler: SchedulerHandle<E>, view: V, fps: f64) -> Result<Self>
    where
        E: Experiment,
        V: View<E>,
    {
        let interval = interval_for_rate(fps).ok_or(SchedulerError::InvalidSpeed(fps))?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let interval_nanos = Arc::new(AtomicU64::new(
            u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX),
        ));
        let stats = Arc::new(Mutex::new(RenderStats::default()));

        let mut render_loop = RenderLoop {
            scheduler,
            view,
            shutdown: Arc::clone(&shutdown),
            interval_nanos: Arc::clone(&interval_nanos),
            stats: Arc::clone(&stats),
            cycle: 0,
        };

        let handle = thread::Builder::new()
            .name("lockstep-render".to_string())
            .spawn(move || {
                if let Err(e) = render_loop.run() {
                    error!(error = %e, "render thread error");
                }
            })
            .map_err(SchedulerError::Spawn)?;

        debug!(fps, "renderer started");
        Ok(Self {
            handle: Some(handle),
            shutdown,
            interval_nanos,
            stats,
        })
    }

    /// Change the frame rate.
    pub fn set_fps(&self, fps: f64) -> Result<()> {
        let interval = interval_for_rate(fps).ok_or(SchedulerError::InvalidSpeed(fps))?;
        self.interval_nanos.store(
            u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        Ok(())
    }

    /// Snapshot of the render statistics.
    pub fn stats(&self) -> RenderStats {
        self.stats.lock().clone()
    }

    /// Whether the render thread has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Signal the render thread to shutdown.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Wait for the render thread to finish.
    pub fn join(mut self) {
        self.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RendererActor {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::scheduler::{Scheduler, SchedulerConfig};
    use crate::experiment::SimRng;
    use crate::mode::Mode;

    #[derive(Default)]
    struct Counter {
        value: u64,
    }

    impl Experiment for Counter {
        fn initialize(&mut self, _rng: &mut SimRng) {
            self.value = 0;
        }

        fn iterate(&mut self, _rng: &mut SimRng) {
            self.value += 1;
        }
    }

    /// Records `(cycle, iteration)` per render and the cycle per reset.
    #[derive(Clone, Default)]
    struct Recorder {
        frames: Arc<Mutex<Vec<(u64, u64)>>>,
        resets: Arc<Mutex<Vec<u64>>>,
    }

    impl View<Counter> for Recorder {
        fn render(&mut self, frame: &Frame<'_, Counter>) -> io::Result<()> {
            assert_eq!(frame.experiment().value, frame.iteration());
            self.frames.lock().push((frame.cycle(), frame.iteration()));
            Ok(())
        }

        fn reset(&mut self, frame: &Frame<'_, Counter>) -> io::Result<()> {
            self.resets.lock().push(frame.cycle());
            Ok(())
        }
    }

    fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_frame_sync_draws_every_iteration() {
        let config = SchedulerConfig::default().with_seed(7);
        let mut scheduler = Scheduler::new(Counter::default(), config).unwrap();
        let recorder = Recorder::default();
        let renderer = RendererActor::spawn(scheduler.handle(), recorder.clone(), 500.0).unwrap();
        scheduler.run().unwrap();

        assert!(wait_until(Duration::from_secs(2), || recorder.frames.lock().len() >= 20));
        scheduler.handle().kill();
        renderer.join();
        scheduler.join().unwrap();

        let frames = recorder.frames.lock().clone();
        // Each frame shows exactly one more iteration than the previous one
        for pair in frames.windows(2) {
            assert_eq!(pair[1].1, pair[0].1 + 1, "frames: {frames:?}");
        }
        assert_eq!(recorder.resets.lock().first(), Some(&1));
    }

    #[test]
    fn test_paused_ticks_are_skipped() {
        let config = SchedulerConfig::default()
            .with_mode(Mode::Unsafe)
            .with_seed(3)
            .with_speed(500.0);
        let mut scheduler = Scheduler::new(Counter::default(), config).unwrap();
        let handle = scheduler.handle();
        let recorder = Recorder::default();
        let renderer = RendererActor::spawn(handle.clone(), recorder.clone(), 200.0).unwrap();
        scheduler.run().unwrap();

        assert!(wait_until(Duration::from_secs(2), || recorder.frames.lock().len() >= 5));
        handle.pause();
        thread::sleep(Duration::from_millis(30));
        let drawn = recorder.frames.lock().len();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(recorder.frames.lock().len(), drawn);
        assert!(renderer.stats().skipped > 0);

        // A reset while paused is still shown once
        handle.reset(false);
        assert!(wait_until(Duration::from_secs(2), || recorder
            .resets
            .lock()
            .contains(&2)));
        assert_eq!(recorder.frames.lock().last(), Some(&(2, 0)));

        scheduler.shutdown().unwrap();
        renderer.join();
    }

    #[test]
    fn test_exits_when_scheduler_killed() {
        let config = SchedulerConfig::default().with_seed(1);
        let mut scheduler = Scheduler::new(Counter::default(), config).unwrap();
        let renderer = RendererActor::spawn(scheduler.handle(), Recorder::default(), 100.0).unwrap();
        scheduler.run().unwrap();
        scheduler.shutdown().unwrap();

        assert!(wait_until(Duration::from_secs(1), || renderer.is_finished()));
    }

    #[test]
    fn test_invalid_fps_rejected() {
        let scheduler = Scheduler::new(Counter::default(), SchedulerConfig::default()).unwrap();
        assert!(RendererActor::spawn(scheduler.handle(), Recorder::default(), 0.0).is_err());

        let renderer = RendererActor::spawn(scheduler.handle(), Recorder::default(), 30.0).unwrap();
        assert!(renderer.set_fps(f64::NAN).is_err());
        renderer.set_fps(60.0).unwrap();
        renderer.join();
    }
}
