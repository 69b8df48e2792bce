//! Iteration lock: serializes every write to experiment state.
//!
//! The scheduler holds it for exactly one `iterate()` (or `initialize()`)
//! call, the safe-mutation channel for exactly one write or callback, and
//! the renderer for one frame's worth of reads.

use parking_lot::{Mutex, MutexGuard};

/// Mutual-exclusion region around the experiment state.
///
/// The lock is not reentrant. Calling back into the scheduler's control
/// surface while holding it (from `iterate()` or a `safe()` callback)
/// deadlocks.
#[derive(Debug, Default)]
pub struct IterationLock<T> {
    inner: Mutex<T>,
}

impl<T> IterationLock<T> {
    /// Wrap a value.
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Acquire the lock.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    /// Run `f` with exclusive access and release before returning.
    #[inline]
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }

    /// Wait until nobody holds the lock.
    ///
    /// Used as a barrier: once this returns, any critical section that was
    /// in flight when it was called has finished.
    pub fn barrier(&self) {
        drop(self.inner.lock());
    }

    /// Consume the lock and return the value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[derive(Default)]
    struct Pair {
        a: u64,
        b: u64,
    }

    #[test]
    fn test_with_returns_value() {
        let lock = IterationLock::new(5u32);
        let doubled = lock.with(|v| {
            *v *= 2;
            *v
        });
        assert_eq!(doubled, 10);
        assert_eq!(lock.into_inner(), 10);
    }

    #[test]
    fn test_writers_never_interleave() {
        let lock = Arc::new(IterationLock::new(Pair::default()));
        let mut writers = Vec::new();

        for _ in 0..4 {
            let lock = lock.clone();
            writers.push(thread::spawn(move || {
                for _ in 0..1_000 {
                    lock.with(|p| {
                        p.a += 1;
                        thread::yield_now();
                        p.b += 1;
                    });
                }
            }));
        }

        let reader = {
            let lock = lock.clone();
            thread::spawn(move || {
                for _ in 0..1_000 {
                    lock.with(|p| assert_eq!(p.a, p.b));
                }
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();
        assert_eq!(lock.lock().a, 4_000);
    }
}
