// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Coroutines.
//!
//! A coroutine is a boxed local future driven by the scheduler. Its body
//! is wrapped so that it always ends by settling a result future, whether
//! it returns, fails, panics, or is aborted at a suspension point.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future as StdFuture;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::Thread;

use crate::error::Error;
use crate::promise::{self, Future, Wait};

/// Opaque coroutine identity, unique per scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoroutineId(pub(crate) u64);

impl fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a suspended coroutine is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    Send,
    Receive,
    Push,
    Advance,
    Await,
    Sleep,
    Yield,
    /// A future from outside this crate.
    Foreign,
}

/// Coroutine lifecycle.
#[derive(Debug, Clone)]
pub enum CoroutineState {
    /// Constructed, not yet queued.
    Created,
    /// In the run queue.
    Runnable,
    /// Currently being polled.
    Running,
    /// Parked until something wakes it.
    Suspended(SuspendReason),
    Completed,
    Failed(Error),
}

impl CoroutineState {
    pub fn is_finished(&self) -> bool {
        matches!(self, CoroutineState::Completed | CoroutineState::Failed(_))
    }
}

thread_local! {
    static SUSPEND_REASON: Cell<Option<SuspendReason>> = const { Cell::new(None) };
}

/// Record why the coroutine being polled is about to return `Pending`.
pub(crate) fn note_suspend(reason: SuspendReason) {
    let _ = SUSPEND_REASON.try_with(|slot| slot.set(Some(reason)));
}

pub(crate) fn take_suspend_reason() -> SuspendReason {
    SUSPEND_REASON
        .try_with(|slot| slot.take())
        .ok()
        .flatten()
        .unwrap_or(SuspendReason::Foreign)
}

/// Cross-thread wakeup feed. Wakers push ids here; the scheduler drains
/// it into its run queue between polls.
pub(crate) struct WakeQueue {
    ids: Mutex<VecDeque<CoroutineId>>,
    thread: Thread,
}

impl WakeQueue {
    pub fn new() -> Self {
        Self {
            ids: Mutex::new(VecDeque::new()),
            thread: std::thread::current(),
        }
    }

    pub fn push(&self, id: CoroutineId) {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(id);
        self.thread.unpark();
    }

    pub fn drain(&self) -> Vec<CoroutineId> {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

/// Waker that hands the coroutine id back to its scheduler.
struct TaskWaker {
    id: CoroutineId,
    queue: Arc<WakeQueue>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.queue.push(self.id);
    }
}

/// State shared between the scheduler's task slot and user handles.
pub(crate) struct TaskHeader {
    pub id: CoroutineId,
    state: RefCell<CoroutineState>,
    /// Error to deliver at the next suspension point.
    abort: RefCell<Option<Error>>,
    /// Result rejection should not be reported as unhandled.
    quiet: Cell<bool>,
    pub waker: Waker,
}

impl TaskHeader {
    fn new(id: CoroutineId, queue: Arc<WakeQueue>) -> Self {
        Self {
            id,
            state: RefCell::new(CoroutineState::Created),
            abort: RefCell::new(None),
            quiet: Cell::new(false),
            waker: Waker::from(Arc::new(TaskWaker { id, queue })),
        }
    }

    pub fn state(&self) -> CoroutineState {
        self.state.borrow().clone()
    }

    pub fn set_state(&self, state: CoroutineState) {
        *self.state.borrow_mut() = state;
    }

    pub fn is_finished(&self) -> bool {
        self.state.borrow().is_finished()
    }

    /// Ask the coroutine to fail with `error` at its next suspension point.
    /// Returns false if it already finished.
    pub fn abort(&self, error: Error, quiet: bool) -> bool {
        if self.is_finished() {
            return false;
        }
        self.abort.borrow_mut().get_or_insert(error);
        if quiet {
            self.quiet.set(true);
        }
        self.waker.wake_by_ref();
        true
    }
}

pub(crate) type LocalBoxFuture = Pin<Box<dyn StdFuture<Output = ()>>>;

/// A coroutine as the scheduler stores it.
pub(crate) struct Task {
    pub header: Rc<TaskHeader>,
    /// Taken out while being polled.
    pub future: Option<LocalBoxFuture>,
}

impl Task {
    pub fn new<T, F>(id: CoroutineId, queue: Arc<WakeQueue>, work: F) -> (Task, Coroutine<T>)
    where
        T: 'static,
        F: StdFuture<Output = Result<T, Error>> + 'static,
    {
        let header = Rc::new(TaskHeader::new(id, queue));
        let (promise, result) = promise::pair();

        let guarded = Guarded {
            header: header.clone(),
            work: Box::pin(work),
        };
        let finish = header.clone();
        let body = async move {
            let outcome = guarded.await;
            match outcome {
                Ok(value) => {
                    finish.set_state(CoroutineState::Completed);
                    log::debug!("coroutine {} completed", finish.id);
                    let _ = promise.resolve(value);
                }
                Err(err) => {
                    log::debug!("coroutine {} failed: {}", finish.id, err);
                    finish.set_state(CoroutineState::Failed(err.clone()));
                    if finish.quiet.get() {
                        promise.ignore();
                    }
                    let _ = promise.reject(err);
                }
            }
        };

        let task = Task {
            header: header.clone(),
            future: Some(Box::pin(body)),
        };
        (task, Coroutine { header, result })
    }
}

/// Polls the user body, turning panics and aborts into errors.
struct Guarded<T> {
    header: Rc<TaskHeader>,
    work: Pin<Box<dyn StdFuture<Output = Result<T, Error>>>>,
}

impl<T> StdFuture for Guarded<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(err) = this.header.abort.borrow_mut().take() {
            return Poll::Ready(Err(err));
        }
        let work = &mut this.work;
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| work.as_mut().poll(cx))) {
            Ok(poll) => poll,
            Err(payload) => Poll::Ready(Err(Error::Panicked(panic_message(&*payload)))),
        }
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle to a running coroutine.
///
/// Dropping the handle does not stop the coroutine. Awaiting it (inside
/// another coroutine) yields the coroutine's outcome.
pub struct Coroutine<T> {
    header: Rc<TaskHeader>,
    result: Future<T>,
}

impl<T> Coroutine<T> {
    pub fn id(&self) -> CoroutineId {
        self.header.id
    }

    pub fn state(&self) -> CoroutineState {
        self.header.state()
    }

    pub fn is_complete(&self) -> bool {
        self.header.is_finished()
    }

    /// The future settled with this coroutine's outcome.
    pub fn result(&self) -> Future<T> {
        self.result.clone()
    }

    /// Fail the coroutine at its next suspension point.
    ///
    /// Uses [`Error::Stopped`] when no error is given. Returns false if the
    /// coroutine already finished.
    pub fn abort(&self, error: Option<Error>) -> bool {
        self.header.abort(error.unwrap_or(Error::Stopped), false)
    }
}

impl<T> fmt::Debug for Coroutine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.header.id)
            .field("state", &self.header.state())
            .finish()
    }
}

impl<T: Clone> std::future::IntoFuture for Coroutine<T> {
    type Output = Result<T, Error>;
    type IntoFuture = Wait<T>;

    fn into_future(self) -> Wait<T> {
        self.result.into_future()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::Context;

    fn queue() -> Arc<WakeQueue> {
        Arc::new(WakeQueue::new())
    }

    fn poll_task(task: &mut Task) -> bool {
        let waker = task.header.waker.clone();
        let mut cx = Context::from_waker(&waker);
        let fut = task.future.as_mut().expect("task already finished");
        fut.as_mut().poll(&mut cx).is_ready()
    }

    #[test]
    fn completed_task_resolves_result() {
        let (mut task, handle) = Task::new(CoroutineId(1), queue(), async { Ok(42) });
        assert!(matches!(handle.state(), CoroutineState::Created));
        assert!(poll_task(&mut task));
        assert!(matches!(handle.state(), CoroutineState::Completed));
        assert_eq!(handle.result().try_get().unwrap().unwrap(), 42);
    }

    #[test]
    fn failing_task_rejects_result() {
        let (mut task, handle) =
            Task::new(CoroutineId(2), queue(), async { Err::<(), _>(Error::msg("bad input")) });
        handle.result().ignore();
        assert!(poll_task(&mut task));
        match handle.state() {
            CoroutineState::Failed(err) => assert_eq!(err.to_string(), "bad input"),
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[test]
    fn panicking_task_fails() {
        let (mut task, handle) = Task::new(CoroutineId(3), queue(), async {
            if true {
                panic!("boom");
            }
            Ok(())
        });
        handle.result().ignore();
        assert!(poll_task(&mut task));
        match handle.state() {
            CoroutineState::Failed(Error::Panicked(msg)) => assert!(msg.contains("boom")),
            other => panic!("expected Panicked, got {:?}", other),
        }
    }

    #[test]
    fn abort_before_first_poll_skips_body() {
        let ran = Rc::new(Cell::new(false));
        let r = ran.clone();
        let q = queue();
        let (mut task, handle) = Task::new(CoroutineId(4), q.clone(), async move {
            r.set(true);
            Ok(())
        });
        handle.result().ignore();
        assert!(handle.abort(None));
        assert_eq!(q.drain(), vec![CoroutineId(4)]);
        assert!(poll_task(&mut task));
        assert!(!ran.get());
        assert!(matches!(handle.state(), CoroutineState::Failed(Error::Stopped)));
        assert!(!handle.abort(None));
    }

    #[test]
    fn suspend_reason_defaults_to_foreign() {
        assert_eq!(take_suspend_reason(), SuspendReason::Foreign);
        note_suspend(SuspendReason::Receive);
        assert_eq!(take_suspend_reason(), SuspendReason::Receive);
        assert_eq!(take_suspend_reason(), SuspendReason::Foreign);
    }
}
