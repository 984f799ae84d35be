// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Reactor substrate.
//!
//! The scheduler only needs two things from whatever delivers time and
//! readiness: a clock, and a way to sleep until a deadline passes or
//! something wakes it. `ThreadDriver` parks the OS thread; coroutine
//! wakers unpark it, so wakeups from other threads end the park early.
//! `VirtualDriver` runs on a manual clock and never blocks.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Time and readiness source consumed by the scheduler.
pub trait Driver {
    fn now(&self) -> Instant;

    /// Block until `deadline` passes or the scheduler thread is unparked.
    /// `None` waits for an unpark only.
    fn park(&self, deadline: Option<Instant>);
}

/// Wall clock, parking the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadDriver;

impl Driver for ThreadDriver {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn park(&self, deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if deadline > now {
                    std::thread::park_timeout(deadline - now);
                }
            }
            None => std::thread::park(),
        }
    }
}

/// Deterministic clock. Parking jumps straight to the deadline.
///
/// Clones share the same clock, so a test can keep one and hand the other
/// to the scheduler.
#[derive(Debug, Clone)]
pub struct VirtualDriver {
    start: Instant,
    now: Rc<Cell<Instant>>,
}

impl VirtualDriver {
    pub fn new() -> Self {
        let start = Instant::now();
        Self {
            start,
            now: Rc::new(Cell::new(start)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }

    /// Virtual time since creation.
    pub fn elapsed(&self) -> Duration {
        self.now.get() - self.start
    }
}

impl Default for VirtualDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for VirtualDriver {
    fn now(&self) -> Instant {
        self.now.get()
    }

    fn park(&self, deadline: Option<Instant>) {
        if let Some(deadline) = deadline {
            if deadline > self.now.get() {
                self.now.set(deadline);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_park_jumps_to_deadline() {
        let driver = VirtualDriver::new();
        let shared = driver.clone();
        let target = driver.now() + Duration::from_secs(5);
        driver.park(Some(target));
        assert_eq!(shared.now(), target);
        assert_eq!(shared.elapsed(), Duration::from_secs(5));

        // Never moves backwards.
        driver.park(Some(target - Duration::from_secs(1)));
        assert_eq!(driver.now(), target);
        driver.park(None);
        assert_eq!(driver.now(), target);
    }

    #[test]
    fn virtual_advance() {
        let driver = VirtualDriver::new();
        driver.advance(Duration::from_millis(250));
        assert_eq!(driver.elapsed(), Duration::from_millis(250));
    }

    #[test]
    fn thread_park_until_deadline() {
        let driver = ThreadDriver;
        let start = driver.now();
        driver.park(Some(start + Duration::from_millis(10)));
        // park_timeout may return early, so only check the clock moved.
        assert!(driver.now() >= start);
    }
}
