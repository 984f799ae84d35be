// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timer set.
//!
//! One-shot and repeating timers ordered by deadline, ties broken by
//! registration order. Repeating timers keep their id across firings.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

/// Handle returned by `delay` and `interval`, consumed by `clear`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// Callback of a repeating timer.
///
/// `release` runs exactly once when the timer is cleared or the
/// scheduler stops, so per-interval resources are never leaked. Plain
/// `FnMut()` closures implement this with a no-op release.
pub trait IntervalTask {
    fn tick(&mut self);

    fn release(&mut self) {}
}

impl<F: FnMut()> IntervalTask for F {
    fn tick(&mut self) {
        self()
    }
}

pub(crate) enum TimerCallback {
    Once(Box<dyn FnOnce()>),
    Repeat {
        period: Duration,
        task: Box<dyn IntervalTask>,
    },
}

impl TimerCallback {
    /// Dispose of a callback that will never fire again.
    pub fn release(self) {
        if let TimerCallback::Repeat { mut task, .. } = self {
            task.release();
        }
    }
}

pub(crate) struct TimerEntry {
    pub deadline: Instant,
    pub callback: TimerCallback,
    seq: u64,
}

#[derive(Default)]
pub(crate) struct TimerSet {
    order: BTreeMap<(Instant, u64), TimerId>,
    entries: HashMap<TimerId, TimerEntry>,
    next_id: u64,
    next_seq: u64,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an id without scheduling anything.
    pub fn allocate(&mut self) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, deadline: Instant, callback: TimerCallback) -> TimerId {
        let id = self.allocate();
        self.schedule(id, deadline, callback);
        id
    }

    /// (Re)schedule `id`. A fresh sequence number puts it behind timers
    /// already waiting on the same deadline.
    pub fn schedule(&mut self, id: TimerId, deadline: Instant, callback: TimerCallback) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert((deadline, seq), id);
        self.entries.insert(
            id,
            TimerEntry {
                deadline,
                callback,
                seq,
            },
        );
    }

    pub fn remove(&mut self, id: TimerId) -> Option<TimerEntry> {
        let entry = self.entries.remove(&id)?;
        self.order.remove(&(entry.deadline, entry.seq));
        Some(entry)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.order.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Ids due at `now`, in firing order.
    pub fn due(&self, now: Instant) -> Vec<TimerId> {
        self.order
            .range(..=(now, u64::MAX))
            .map(|(_, id)| *id)
            .collect()
    }

    pub fn drain(&mut self) -> Vec<TimerCallback> {
        self.order.clear();
        let mut entries: Vec<_> = self.entries.drain().map(|(_, e)| e).collect();
        entries.sort_by_key(|e| (e.deadline, e.seq));
        entries.into_iter().map(|e| e.callback).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
