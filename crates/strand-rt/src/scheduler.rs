// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative scheduler.
//!
//! One thread of control drives every coroutine. A turn drains wakeups
//! into the run queue, polls runnable coroutines in FIFO order (running
//! deferred callbacks after each), then fires the timers that are due.
//! Between turns the driver parks until the next timer deadline or a
//! wakeup.
//!
//! Nothing is polled or called back while the scheduler state is
//! borrowed, so coroutines and callbacks may freely re-enter it.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::{Future as StdFuture, IntoFuture};
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use indexmap::IndexMap;

use crate::cancel::CancellationToken;
use crate::channel::{self, Receiver, Sender};
use crate::config::SchedulerConfig;
use crate::coroutine::{
    panic_message, take_suspend_reason, Coroutine, CoroutineId, CoroutineState, Task, WakeQueue,
};
use crate::driver::{Driver, ThreadDriver};
use crate::error::Error;
use crate::promise::{self, Future};
use crate::queue::Queue;
use crate::select;
use crate::timer::{IntervalTask, TimerCallback, TimerId, TimerSet};

/// Shortest interval period. A zero period would refire within one turn
/// forever.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Deadlines that would overflow `Instant` are clamped to this far out.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `from + after`, clamped instead of overflowing.
fn deadline_after(from: Instant, after: Duration) -> Instant {
    from.checked_add(after)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

struct State {
    tasks: HashMap<CoroutineId, Task>,
    run_queue: VecDeque<CoroutineId>,
    deferred: VecDeque<Box<dyn FnOnce()>>,
    timers: TimerSet,
    /// Timer whose callback is running right now.
    firing: Option<TimerId>,
    /// `clear` was called on the firing timer.
    firing_cleared: bool,
    next_id: u64,
    stopped: bool,
    driving: bool,
}

pub(crate) struct Core {
    state: RefCell<State>,
    wakeups: Arc<WakeQueue>,
    driver: Box<dyn Driver>,
    config: SchedulerConfig,
}

/// Handle to a cooperative scheduler. Clones drive the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    core: Rc<Core>,
}

/// Non-owning handle, held by futures that live inside coroutines.
#[derive(Clone)]
pub(crate) struct WeakScheduler(Weak<Core>);

impl WeakScheduler {
    pub fn upgrade(&self) -> Option<Scheduler> {
        self.0.upgrade().map(|core| Scheduler { core })
    }
}

/// Marks the scheduler as being driven; cleared on drop.
struct Driving<'a>(&'a Core);

impl Drop for Driving<'_> {
    fn drop(&mut self) {
        self.0.state.borrow_mut().driving = false;
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Wall-clock scheduler with default configuration.
    pub fn new() -> Self {
        Self::build(SchedulerConfig::default(), Box::new(ThreadDriver))
    }

    /// Default configuration on the given driver.
    pub fn with_driver(driver: impl Driver + 'static) -> Self {
        Self::build(SchedulerConfig::default(), Box::new(driver))
    }

    pub fn with_config(config: SchedulerConfig, driver: impl Driver + 'static) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self::build(config, Box::new(driver)))
    }

    /// Applies `report_unhandled_rejections` to the current thread; see
    /// [`SchedulerConfig::report_unhandled_rejections`].
    fn build(config: SchedulerConfig, driver: Box<dyn Driver>) -> Self {
        promise::set_rejection_reporting(config.report_unhandled_rejections);
        Self {
            core: Rc::new(Core {
                state: RefCell::new(State {
                    tasks: HashMap::new(),
                    run_queue: VecDeque::new(),
                    deferred: VecDeque::new(),
                    timers: TimerSet::new(),
                    firing: None,
                    firing_cleared: false,
                    next_id: 0,
                    stopped: false,
                    driving: false,
                }),
                wakeups: Arc::new(WakeQueue::new()),
                driver,
                config,
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakScheduler {
        WeakScheduler(Rc::downgrade(&self.core))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.core.config
    }

    /// Current time on the scheduler's clock.
    pub fn now(&self) -> Instant {
        self.core.driver.now()
    }

    // --- Work submission ---

    /// Start a coroutine. It runs on the next turn; the handle is returned
    /// right away.
    ///
    /// After [`Scheduler::stop_all`] the coroutine is still created but
    /// fails with [`Error::Stopped`] without running its body.
    pub fn run<T, F>(&self, work: F) -> Coroutine<T>
    where
        T: 'static,
        F: StdFuture<Output = Result<T, Error>> + 'static,
    {
        let mut state = self.core.state.borrow_mut();
        let id = CoroutineId(state.next_id);
        state.next_id += 1;
        let (task, handle) = Task::new(id, self.core.wakeups.clone(), work);
        if state.stopped {
            log::warn!("coroutine {id} rejected: scheduler stopped");
            task.header.abort(Error::Stopped, true);
        } else {
            log::debug!("coroutine {id} spawned");
        }
        task.header.set_state(CoroutineState::Runnable);
        state.run_queue.push_back(id);
        state.tasks.insert(id, task);
        handle
    }

    /// Run `callback` once the current coroutine's poll is over, before
    /// this turn's timers.
    pub fn defer(&self, callback: impl FnOnce() + 'static) {
        let mut state = self.core.state.borrow_mut();
        if state.stopped {
            log::warn!("deferred callback dropped: scheduler stopped");
            return;
        }
        state.deferred.push_back(Box::new(callback));
    }

    /// Run `callback` once, `after` from now.
    pub fn delay(&self, after: Duration, callback: impl FnOnce() + 'static) -> TimerId {
        let deadline = deadline_after(self.now(), after);
        let mut state = self.core.state.borrow_mut();
        if state.stopped {
            log::warn!("delay rejected: scheduler stopped");
            return state.timers.allocate();
        }
        let id = state.timers.insert(deadline, TimerCallback::Once(Box::new(callback)));
        log::trace!("{id} armed for {after:?}");
        id
    }

    /// Run `task` every `period` until cleared. Its release hook runs once
    /// when the timer is cleared or the scheduler stops.
    pub fn interval(&self, period: Duration, task: impl IntervalTask + 'static) -> TimerId {
        let period = period.max(MIN_INTERVAL);
        let deadline = deadline_after(self.now(), period);
        let mut task: Box<dyn IntervalTask> = Box::new(task);
        let id = {
            let mut state = self.core.state.borrow_mut();
            if state.stopped {
                state.timers.allocate()
            } else {
                let id = state
                    .timers
                    .insert(deadline, TimerCallback::Repeat { period, task });
                log::trace!("{id} armed every {period:?}");
                return id;
            }
        };
        log::warn!("interval rejected: scheduler stopped");
        task.release();
        id
    }

    /// Cancel a timer. Unknown and already fired ids are ignored.
    pub fn clear(&self, id: TimerId) {
        let removed = {
            let mut state = self.core.state.borrow_mut();
            if state.firing == Some(id) {
                state.firing_cleared = true;
            }
            state.timers.remove(id)
        };
        if let Some(entry) = removed {
            log::trace!("{id} cleared");
            entry.callback.release();
        }
    }

    /// Fail every live coroutine with `error` (default [`Error::Stopped`])
    /// at its next suspension point and drop every timer. Returns whether
    /// any coroutine was affected.
    ///
    /// The scheduler refuses new work until [`Scheduler::reset`].
    pub fn stop_all(&self, error: Option<Error>) -> bool {
        let error = error.unwrap_or(Error::Stopped);
        let (affected, timers) = {
            let mut state = self.core.state.borrow_mut();
            state.stopped = true;
            if state.firing.is_some() {
                state.firing_cleared = true;
            }
            let affected = state
                .tasks
                .values()
                .filter(|task| task.header.abort(error.clone(), true))
                .count();
            (affected, state.timers.drain())
        };
        log::warn!(
            "scheduler stopped: {affected} coroutine(s) failed with \"{error}\", {} timer(s) dropped",
            timers.len()
        );
        for callback in timers {
            callback.release();
        }
        affected > 0
    }

    /// Accept new work again after [`Scheduler::stop_all`].
    pub fn reset(&self) {
        self.core.state.borrow_mut().stopped = false;
        log::debug!("scheduler reset");
    }

    pub fn is_stopped(&self) -> bool {
        self.core.state.borrow().stopped
    }

    /// Coroutines that have not finished.
    pub fn live_coroutines(&self) -> usize {
        self.core.state.borrow().tasks.len()
    }

    pub fn pending_timers(&self) -> usize {
        self.core.state.borrow().timers.len()
    }

    /// Route unhandled rejections on this thread to `hook`.
    ///
    /// The hook belongs to the thread, not to this scheduler: it replaces
    /// any hook installed before, including by another scheduler.
    pub fn on_unhandled_rejection(&self, hook: impl Fn(&Error) + 'static) {
        promise::set_rejection_hook(Some(Rc::new(hook)));
    }

    // --- Factories ---

    pub fn create_channel_pair<T: 'static>(&self, capacity: usize) -> (Sender<T>, Receiver<T>) {
        channel::pair(capacity)
    }

    pub fn create_queue<T: 'static>(&self, capacity: usize) -> Queue<T> {
        Queue::new(capacity)
    }

    // --- Await combinators ---

    /// See [`select::wait`].
    pub async fn wait<K, T, I>(
        &self,
        futures: I,
        cancellation: Option<&CancellationToken>,
    ) -> Result<IndexMap<K, T>, Error>
    where
        K: Hash + Eq,
        T: Clone,
        I: IntoIterator<Item = (K, Future<T>)>,
    {
        select::wait(futures, cancellation).await
    }

    /// See [`select::wait_all`].
    pub async fn wait_all<K, T, I>(
        &self,
        futures: I,
        cancellation: Option<&CancellationToken>,
    ) -> Result<IndexMap<K, T>, Error>
    where
        K: Hash + Eq,
        T: Clone,
        I: IntoIterator<Item = (K, Future<T>)>,
    {
        select::wait_all(futures, cancellation).await
    }

    /// See [`select::wait_first`].
    pub async fn wait_first<K, T, I>(
        &self,
        futures: I,
        cancellation: Option<&CancellationToken>,
    ) -> Result<T, Error>
    where
        T: Clone,
        I: IntoIterator<Item = (K, Future<T>)>,
    {
        select::wait_first(futures, cancellation).await
    }

    /// See [`select::wait_any`].
    pub async fn wait_any<K, T, I>(
        &self,
        futures: I,
        cancellation: Option<&CancellationToken>,
    ) -> Result<T, Error>
    where
        T: Clone,
        I: IntoIterator<Item = (K, Future<T>)>,
    {
        select::wait_any(futures, cancellation).await
    }

    /// See [`select::wait_all_without_error`].
    pub async fn wait_all_without_error<K, T, I>(
        &self,
        futures: I,
        cancellation: Option<&CancellationToken>,
    ) -> Result<IndexMap<K, Result<T, Error>>, Error>
    where
        K: Hash + Eq,
        T: Clone,
        I: IntoIterator<Item = (K, Future<T>)>,
    {
        select::wait_all_without_error(futures, cancellation).await
    }

    // --- Driving ---

    fn enter(&self) -> Result<Driving<'_>, Error> {
        let mut state = self.core.state.borrow_mut();
        if state.driving {
            return Err(Error::Logic(
                "scheduler driven from inside its own coroutine or callback".to_string(),
            ));
        }
        state.driving = true;
        Ok(Driving(&self.core))
    }

    /// Run one turn. Returns whether anything ran.
    pub fn tick(&self) -> Result<bool, Error> {
        let _driving = self.enter()?;
        let mut progressed = false;
        let mut polls = 0;
        let budget = self.core.config.max_polls_per_turn;
        loop {
            let ran = self.run_deferred(budget.saturating_sub(polls));
            if ran > 0 {
                progressed = true;
                polls += ran;
            }
            self.collect_wakeups();
            if polls >= budget {
                log::trace!("poll budget spent, yielding to timers");
                break;
            }
            let next = self.core.state.borrow_mut().run_queue.pop_front();
            let Some(id) = next else { break };
            if self.poll_task(id) {
                progressed = true;
                polls += 1;
            }
        }
        progressed |= self.fire_timers();
        Ok(progressed)
    }

    /// Turn until nothing is runnable and no timer is due. Does not wait
    /// for future deadlines.
    pub fn run_until_idle(&self) -> Result<(), Error> {
        loop {
            self.tick()?;
            if !self.has_ready_work() {
                return Ok(());
            }
        }
    }

    /// Drive the scheduler until every coroutine has finished and no
    /// timer remains. An uncleared interval keeps this running.
    pub fn run_to_completion(&self) -> Result<(), Error> {
        loop {
            self.run_until_idle()?;
            let done = {
                let state = self.core.state.borrow();
                state.tasks.is_empty() && state.timers.is_empty()
            };
            if done {
                return Ok(());
            }
            self.idle_wait()?;
        }
    }

    /// Run `work` as a coroutine and drive the scheduler until it finishes.
    pub fn block_on<T, F>(&self, work: F) -> Result<T, Error>
    where
        T: 'static,
        F: StdFuture<Output = Result<T, Error>> + 'static,
    {
        if self.core.state.borrow().driving {
            return Err(Error::Logic(
                "block_on called from inside a coroutine".to_string(),
            ));
        }
        let result = self.run(work).result();
        loop {
            self.tick()?;
            if let Some(outcome) = result.take_owned() {
                return outcome;
            }
            self.idle_wait()?;
        }
    }

    /// Await any future to completion on this scheduler.
    pub fn block_on_future<F, T>(&self, future: F) -> Result<T, Error>
    where
        T: 'static,
        F: IntoFuture<Output = Result<T, Error>>,
        F::IntoFuture: 'static,
    {
        self.block_on(future.into_future())
    }

    fn has_ready_work(&self) -> bool {
        let now = self.now();
        let state = self.core.state.borrow();
        !state.run_queue.is_empty()
            || !state.deferred.is_empty()
            || !self.core.wakeups.is_empty()
            || state.timers.next_deadline().is_some_and(|d| d <= now)
    }

    /// Nothing is runnable: park until the next deadline or a wakeup.
    fn idle_wait(&self) -> Result<(), Error> {
        if self.has_ready_work() {
            return Ok(());
        }
        let (deadline, live) = {
            let state = self.core.state.borrow();
            (state.timers.next_deadline(), state.tasks.len())
        };
        match deadline {
            Some(deadline) => {
                log::trace!("parking until next timer");
                self.core.driver.park(Some(deadline));
            }
            None if self.core.config.park_when_idle => {
                log::trace!("parking until woken");
                self.core.driver.park(None);
            }
            None => {
                return Err(Error::Logic(format!(
                    "deadlock: {live} coroutine(s) blocked with no timer pending"
                )));
            }
        }
        Ok(())
    }

    /// Run the callbacks deferred so far, at most `limit` of them.
    /// Callbacks they defer wait for the next pass.
    fn run_deferred(&self, limit: usize) -> usize {
        let batch = self.core.state.borrow().deferred.len().min(limit);
        for ran in 0..batch {
            let next = self.core.state.borrow_mut().deferred.pop_front();
            let Some(callback) = next else { return ran };
            callback();
        }
        batch
    }

    fn collect_wakeups(&self) {
        let ids = self.core.wakeups.drain();
        if ids.is_empty() {
            return;
        }
        let mut guard = self.core.state.borrow_mut();
        let State {
            tasks, run_queue, ..
        } = &mut *guard;
        for id in ids {
            let Some(task) = tasks.get(&id) else { continue };
            match task.header.state() {
                CoroutineState::Created | CoroutineState::Suspended(_) => {
                    task.header.set_state(CoroutineState::Runnable);
                    run_queue.push_back(id);
                }
                _ => {}
            }
        }
    }

    /// Poll one coroutine. Returns false if it was gone.
    fn poll_task(&self, id: CoroutineId) -> bool {
        let (header, mut future) = {
            let mut state = self.core.state.borrow_mut();
            let Some(task) = state.tasks.get_mut(&id) else {
                return false;
            };
            let Some(future) = task.future.take() else {
                return false;
            };
            (task.header.clone(), future)
        };

        header.set_state(CoroutineState::Running);
        let _ = take_suspend_reason();
        log::trace!("polling coroutine {id}");
        let mut cx = Context::from_waker(&header.waker);
        let poll = future.as_mut().poll(&mut cx);
        let reason = take_suspend_reason();

        match poll {
            Poll::Ready(()) => {
                let task = self.core.state.borrow_mut().tasks.remove(&id);
                drop(task);
                drop(future);
            }
            Poll::Pending => {
                // A wake from inside the poll is already queued and makes
                // the coroutine runnable again on the next collection.
                header.set_state(CoroutineState::Suspended(reason));
                let mut state = self.core.state.borrow_mut();
                if let Some(task) = state.tasks.get_mut(&id) {
                    task.future = Some(future);
                }
            }
        }
        true
    }

    /// Fire every timer due now, in deadline order.
    fn fire_timers(&self) -> bool {
        let now = self.now();
        let due = self.core.state.borrow().timers.due(now);
        let mut fired = false;
        for id in due {
            let entry = {
                let mut state = self.core.state.borrow_mut();
                let entry = state.timers.remove(id);
                if entry.is_some() {
                    state.firing = Some(id);
                    state.firing_cleared = false;
                }
                entry
            };
            // Cleared by a callback that fired earlier in this batch.
            let Some(entry) = entry else { continue };
            fired = true;
            log::trace!("{id} fired");

            match entry.callback {
                TimerCallback::Once(callback) => {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(callback));
                    self.core.state.borrow_mut().firing = None;
                    if let Err(payload) = outcome {
                        log::error!("{id} callback panicked: {}", panic_message(&*payload));
                    }
                }
                TimerCallback::Repeat { period, mut task } => {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| task.tick()));
                    let keep = {
                        let mut state = self.core.state.borrow_mut();
                        state.firing = None;
                        !state.firing_cleared && !state.stopped
                    };
                    if let Err(payload) = &outcome {
                        let msg = panic_message(&**payload);
                        log::error!("{id} tick panicked, dropping interval: {msg}");
                    }
                    if keep && outcome.is_ok() {
                        let mut next = deadline_after(entry.deadline, period);
                        if next <= now {
                            next = deadline_after(now, period);
                        }
                        let callback = TimerCallback::Repeat { period, task };
                        self.core.state.borrow_mut().timers.schedule(id, next, callback);
                    } else {
                        task.release();
                    }
                }
            }
        }
        fired
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.state.borrow();
        f.debug_struct("Scheduler")
            .field("coroutines", &state.tasks.len())
            .field("runnable", &state.run_queue.len())
            .field("timers", &state.timers.len())
            .field("stopped", &state.stopped)
            .finish()
    }
}
