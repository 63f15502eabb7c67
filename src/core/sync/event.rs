/*!
 * Condvar-Based Events
 *
 * A boolean signal guarded by a `parking_lot::Mutex` with a `Condvar` for
 * waiters. Manual reset events stay signaled until `reset`; auto reset
 * events release exactly one waiter per `set` and clear themselves.
 */

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// How an event clears after releasing a waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    Manual,
    Auto,
}

/// Waitable event
#[repr(C, align(64))] // Cache-line aligned to prevent false sharing
pub struct Event {
    signaled: Mutex<bool>,
    condvar: Condvar,
    waiters: AtomicUsize,
    mode: ResetMode,
}

impl Event {
    /// Create a manual reset event
    pub fn manual(initially_signaled: bool) -> Self {
        Self::with_mode(ResetMode::Manual, initially_signaled)
    }

    /// Create an auto reset event, initially clear
    pub fn auto() -> Self {
        Self::with_mode(ResetMode::Auto, false)
    }

    pub fn with_mode(mode: ResetMode, initially_signaled: bool) -> Self {
        Self {
            signaled: Mutex::new(initially_signaled),
            condvar: Condvar::new(),
            waiters: AtomicUsize::new(0),
            mode,
        }
    }

    /// Signal the event
    pub fn set(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        match self.mode {
            ResetMode::Manual => {
                self.condvar.notify_all();
            }
            ResetMode::Auto => {
                self.condvar.notify_one();
            }
        }
    }

    /// Clear the event
    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        *self.signaled.lock()
    }

    /// Number of threads currently parked on the event
    #[inline]
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    /// Block until the event is signaled, without timeout
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        self.waiters.fetch_add(1, Ordering::AcqRel);
        while !*signaled {
            self.condvar.wait(&mut signaled);
        }
        self.waiters.fetch_sub(1, Ordering::AcqRel);
        if self.mode == ResetMode::Auto {
            *signaled = false;
        }
    }

    /// Block until signaled or `timeout` elapses
    ///
    /// Returns `true` if the event was signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.signaled.lock();
        self.waiters.fetch_add(1, Ordering::AcqRel);
        while !*signaled {
            if self.condvar.wait_until(&mut signaled, deadline).timed_out() {
                break;
            }
        }
        self.waiters.fetch_sub(1, Ordering::AcqRel);
        let was_signaled = *signaled;
        if was_signaled && self.mode == ResetMode::Auto {
            *signaled = false;
        }
        was_signaled
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("mode", &self.mode)
            .field("signaled", &self.is_set())
            .field("waiters", &self.waiters())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_manual_event_stays_signaled() {
        let event = Event::manual(false);
        assert!(!event.is_set());
        event.set();
        event.wait();
        event.wait();
        assert!(event.is_set());
        event.reset();
        assert!(!event.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn test_auto_event_clears_after_wait() {
        let event = Event::auto();
        event.set();
        assert!(event.wait_timeout(Duration::from_millis(5)));
        assert!(!event.is_set());
        assert!(!event.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn test_wait_wakes_on_set_from_other_thread() {
        let event = Arc::new(Event::auto());
        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.wait())
        };

        while event.waiters() == 0 {
            thread::yield_now();
        }
        event.set();
        waiter.join().unwrap();
        assert_eq!(event.waiters(), 0);
    }

    #[test]
    fn test_manual_event_releases_all_waiters() {
        let event = Arc::new(Event::manual(false));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let event = Arc::clone(&event);
                thread::spawn(move || event.wait())
            })
            .collect();

        while event.waiters() < 4 {
            thread::yield_now();
        }
        event.set();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
