//! Pacing for the two loops.
//!
//! [`TimingController`] paces the scheduler when frame-sync is off: after
//! each iteration it sleeps whatever is left of the target interval. A slow
//! iteration simply skips the sleep; nothing is owed afterwards, so there
//! are no catch-up bursts.
//!
//! [`FrameClock`] paces the renderer loop with a running deadline. When the
//! renderer falls behind it re-anchors instead of queueing missed ticks.

use std::thread;
use std::time::{Duration, Instant};

/// Convert an iterations-per-second rate into an interval.
///
/// Returns `None` for rates that are not finite and positive.
pub fn interval_for_rate(per_second: f64) -> Option<Duration> {
    if per_second.is_finite() && per_second > 0.0 {
        Duration::try_from_secs_f64(1.0 / per_second).ok()
    } else {
        None
    }
}

/// Free-running scheduler pacing.
#[derive(Debug, Clone)]
pub struct TimingController {
    /// Start of the iteration being paced.
    mark: Instant,
}

impl TimingController {
    /// Create a controller anchored at now.
    pub fn new() -> Self {
        Self {
            mark: Instant::now(),
        }
    }

    /// Record the start of an iteration.
    #[inline]
    pub fn mark(&mut self) {
        self.mark = Instant::now();
    }

    /// `max(0, speed - elapsed)`.
    #[inline]
    pub fn sleep_for(speed: Duration, elapsed: Duration) -> Duration {
        speed.saturating_sub(elapsed)
    }

    /// How long to sleep, measured from the last [`mark`](Self::mark).
    pub fn remaining(&self, speed: Duration) -> Duration {
        Self::sleep_for(speed, self.mark.elapsed())
    }

    /// Sleep out the rest of the interval. Returns the time slept.
    pub fn pace(&self, speed: Duration) -> Duration {
        let remaining = self.remaining(speed);
        if !remaining.is_zero() {
            thread::sleep(remaining);
        }
        remaining
    }
}

impl Default for TimingController {
    fn default() -> Self {
        Self::new()
    }
}

/// Renderer tick deadline.
#[derive(Debug, Clone)]
pub struct FrameClock {
    /// Time between ticks.
    interval: Duration,
    /// When the next tick is due.
    next_tick: Instant,
    /// Ticks handed out so far.
    frame: u64,
}

impl FrameClock {
    /// Create a clock whose first tick is one interval from now.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_tick: Instant::now() + interval,
            frame: 0,
        }
    }

    /// Time between ticks.
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Change the tick rate; applies from the next tick on.
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Frames ticked so far.
    pub const fn frame(&self) -> u64 {
        self.frame
    }

    /// Non-blocking: if the deadline has passed, consume one tick.
    pub fn poll(&mut self, now: Instant) -> Option<u64> {
        if now < self.next_tick {
            return None;
        }
        let frame = self.frame;
        self.frame += 1;
        self.next_tick += self.interval;

        // Behind: skip missed ticks instead of queueing them
        if self.next_tick < now {
            self.next_tick = now + self.interval;
        }
        Some(frame)
    }

    /// How long until the next tick is due.
    pub fn until_next(&self, now: Instant) -> Duration {
        self.next_tick.saturating_duration_since(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_interval_for_rate() {
        assert_eq!(interval_for_rate(100.0), Some(Duration::from_millis(10)));
        assert_eq!(interval_for_rate(1.0), Some(Duration::from_secs(1)));
        assert_eq!(interval_for_rate(0.0), None);
        assert_eq!(interval_for_rate(-5.0), None);
        assert_eq!(interval_for_rate(f64::NAN), None);
        assert_eq!(interval_for_rate(f64::INFINITY), None);
    }

    #[test]
    fn test_slow_iteration_skips_sleep() {
        let speed = Duration::from_millis(10);
        assert_eq!(
            TimingController::sleep_for(speed, Duration::from_millis(25)),
            Duration::ZERO
        );
        assert_eq!(
            TimingController::sleep_for(speed, Duration::from_millis(4)),
            Duration::from_millis(6)
        );
    }

    #[test]
    fn test_pace_fills_interval() {
        let mut timing = TimingController::new();
        timing.mark();
        let start = Instant::now();
        timing.pace(Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_frame_clock_ticks_once_per_deadline() {
        let mut clock = FrameClock::new(Duration::from_millis(10));
        let base = Instant::now();
        assert_eq!(clock.poll(base), None);

        let later = base + Duration::from_millis(11);
        assert_eq!(clock.poll(later), Some(0));
        assert_eq!(clock.poll(later), None);
    }

    #[test]
    fn test_frame_clock_does_not_queue_missed_ticks() {
        let mut clock = FrameClock::new(Duration::from_millis(10));
        let much_later = Instant::now() + Duration::from_millis(100);

        assert_eq!(clock.poll(much_later), Some(0));
        // Re-anchored one interval past `much_later`
        assert_eq!(clock.poll(much_later), None);
        assert!(clock.until_next(much_later) <= Duration::from_millis(10));
        assert_eq!(clock.frame(), 1);
    }

    proptest! {
        #[test]
        fn prop_sleep_never_exceeds_speed(speed_us in 0u64..1_000_000, elapsed_us in 0u64..2_000_000) {
            let speed = Duration::from_micros(speed_us);
            let elapsed = Duration::from_micros(elapsed_us);
            let sleep = TimingController::sleep_for(speed, elapsed);

            prop_assert!(sleep <= speed);
            if elapsed < speed {
                prop_assert_eq!(sleep + elapsed, speed);
            } else {
                prop_assert_eq!(sleep, Duration::ZERO);
            }
        }
    }
}
