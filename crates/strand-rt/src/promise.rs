// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Single-assignment result cells.
//!
//! [`Promise`] is the producing half and [`Future`] the observing half of
//! one cell. The cell settles once. Observers fire at most once, in
//! registration order; an observer registered after settlement fires
//! before `subscribe` returns.
//!
//! A settled outcome never changes. Every handle, and every observer no
//! matter when it registers, sees the same outcome, so reading a resolved
//! value hands out a clone.
//!
//! A rejection nobody observed and nobody marked with [`Future::ignore`]
//! is reported to the thread's rejection hook when the cell is dropped.

use std::cell::RefCell;
use std::fmt;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::coroutine::{note_suspend, SuspendReason};
use crate::error::Error;

/// Handle returned by [`Future::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer<T> = Box<dyn FnOnce(&Result<T, Error>)>;

enum State<T> {
    Pending,
    Settled(Rc<Result<T, Error>>),
    /// Resolved, and the only handle left moved the value out.
    Moved,
}

struct Cell<T> {
    state: State<T>,
    observers: Vec<(ObserverId, Observer<T>)>,
    next_observer: u64,
    /// Somebody observed or consumed the outcome.
    handled: bool,
    ignored: bool,
}

impl<T> Drop for Cell<T> {
    fn drop(&mut self) {
        if self.handled || self.ignored {
            return;
        }
        if let State::Settled(outcome) = &self.state {
            if let Err(err) = outcome.as_ref() {
                report_unhandled(err);
            }
        }
    }
}

/// Create a pending cell, returning its producing and observing halves.
pub fn pair<T>() -> (Promise<T>, Future<T>) {
    let cell = Rc::new(RefCell::new(Cell {
        state: State::Pending,
        observers: Vec::new(),
        next_observer: 0,
        handled: false,
        ignored: false,
    }));
    (Promise { cell: cell.clone() }, Future { cell })
}

/// Producing half. Dropping it while still pending rejects the future.
pub struct Promise<T> {
    cell: Rc<RefCell<Cell<T>>>,
}

impl<T> Promise<T> {
    pub fn resolve(&self, value: T) -> Result<(), Error> {
        self.settle(Ok(value))
    }

    pub fn reject(&self, error: Error) -> Result<(), Error> {
        self.settle(Err(error))
    }

    pub fn is_complete(&self) -> bool {
        !matches!(self.cell.borrow().state, State::Pending)
    }

    /// Another handle to the observing half.
    pub fn future(&self) -> Future<T> {
        Future {
            cell: self.cell.clone(),
        }
    }

    /// Suppress unhandled-rejection reporting for this cell.
    pub fn ignore(&self) -> &Self {
        self.cell.borrow_mut().ignored = true;
        self
    }

    fn settle(&self, outcome: Result<T, Error>) -> Result<(), Error> {
        let (outcome, observers) = {
            let mut cell = self.cell.borrow_mut();
            if !matches!(cell.state, State::Pending) {
                let err = Error::Logic("future settled twice".to_string());
                log::error!("{err}");
                return Err(err);
            }
            let outcome = Rc::new(outcome);
            cell.state = State::Settled(outcome.clone());
            let observers = std::mem::take(&mut cell.observers);
            if !observers.is_empty() {
                cell.handled = true;
            }
            (outcome, observers)
        };
        for (_, observer) in observers {
            observer(&outcome);
        }
        Ok(())
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if matches!(self.cell.borrow().state, State::Pending) {
            self.cell.borrow_mut().ignored = true;
            let _ = self.settle(Err(Error::Logic(
                "promise dropped before it was settled".to_string(),
            )));
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Observing half. Cloning yields another handle to the same cell.
pub struct Future<T> {
    cell: Rc<RefCell<Cell<T>>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T> Future<T> {
    /// An already resolved future.
    pub fn ready(value: T) -> Self {
        let (promise, future) = pair();
        let _ = promise.resolve(value);
        future
    }

    /// An already rejected future.
    pub fn failed(error: Error) -> Self {
        let (promise, future) = pair();
        let _ = promise.reject(error);
        future
    }

    pub fn is_complete(&self) -> bool {
        !matches!(self.cell.borrow().state, State::Pending)
    }

    /// Suppress unhandled-rejection reporting for this cell.
    pub fn ignore(&self) -> &Self {
        self.cell.borrow_mut().ignored = true;
        self
    }

    /// Register an observer. Fires immediately if the future is settled.
    pub fn subscribe(&self, observer: impl FnOnce(&Result<T, Error>) + 'static) -> ObserverId {
        self.observe(observer, true)
    }

    /// Observe without counting as handling a rejection.
    pub(crate) fn watch(&self, observer: impl FnOnce(&Result<T, Error>) + 'static) -> ObserverId {
        self.observe(observer, false)
    }

    /// Remove an observer that has not fired. Returns whether it was found.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let removed = {
            let mut cell = self.cell.borrow_mut();
            cell.observers
                .iter()
                .position(|(oid, _)| *oid == id)
                .map(|pos| cell.observers.remove(pos))
        };
        removed.is_some()
    }

    fn observe(&self, observer: impl FnOnce(&Result<T, Error>) + 'static, handles: bool) -> ObserverId {
        let (id, settled) = {
            let mut guard = self.cell.borrow_mut();
            let cell = &mut *guard;
            let id = ObserverId(cell.next_observer);
            cell.next_observer += 1;
            if handles {
                cell.handled = true;
            }
            match &cell.state {
                State::Pending => {
                    cell.observers.push((id, Box::new(observer)));
                    return id;
                }
                State::Settled(outcome) => (id, outcome.clone()),
                State::Moved => (id, Rc::new(Err(moved()))),
            }
        };
        observer(&settled);
        id
    }

    /// The outcome, if the future has settled. Counts as handling a
    /// rejection.
    pub fn try_get(&self) -> Option<Result<T, Error>>
    where
        T: Clone,
    {
        let mut cell = self.cell.borrow_mut();
        cell.handled = true;
        match &cell.state {
            State::Pending => None,
            State::Settled(outcome) => Some(outcome.as_ref().clone()),
            State::Moved => Some(Err(moved())),
        }
    }

    /// Move a resolved value out. Only the last handle to the cell may do
    /// this; with other handles alive the cell keeps its outcome and a
    /// `Logic` error comes back instead.
    pub(crate) fn take_owned(&self) -> Option<Result<T, Error>> {
        let sole = Rc::strong_count(&self.cell) == 1;
        let mut cell = self.cell.borrow_mut();
        cell.handled = true;
        let outcome = match &cell.state {
            State::Pending => return None,
            State::Moved => return Some(Err(moved())),
            State::Settled(outcome) => outcome.clone(),
        };
        if let Err(err) = outcome.as_ref() {
            return Some(Err(err.clone()));
        }
        if !sole {
            return Some(Err(Error::Logic(
                "resolved value is shared and cannot be moved".to_string(),
            )));
        }
        cell.state = State::Moved;
        match Rc::try_unwrap(outcome) {
            Ok(outcome) => Some(outcome),
            Err(shared) => {
                // An observer is still running with the outcome borrowed.
                cell.state = State::Settled(shared);
                None
            }
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cell = self.cell.borrow();
        let state = match &cell.state {
            State::Pending => "pending",
            State::Settled(outcome) if outcome.is_ok() => "resolved",
            State::Settled(_) => "rejected",
            State::Moved => "moved",
        };
        f.debug_struct("Future").field("state", &state).finish()
    }
}

impl<T: Clone> std::future::IntoFuture for Future<T> {
    type Output = Result<T, Error>;
    type IntoFuture = Wait<T>;

    fn into_future(self) -> Wait<T> {
        Wait::new(self, SuspendReason::Await)
    }
}

fn moved() -> Error {
    Error::Logic("resolved value was moved out".to_string())
}

type Read<T> = fn(&Future<T>) -> Option<Result<T, Error>>;

/// Suspends a coroutine until a [`Future`] settles, then reads its outcome.
pub struct Wait<T> {
    future: Future<T>,
    read: Read<T>,
    reason: SuspendReason,
    observer: Option<ObserverId>,
    waker: Rc<RefCell<Option<Waker>>>,
}

impl<T> Wait<T> {
    pub(crate) fn new(future: Future<T>, reason: SuspendReason) -> Self
    where
        T: Clone,
    {
        Self::reading(future, reason, Future::try_get)
    }

    /// Wait on a future nobody else holds, moving the value out.
    pub(crate) fn owned(future: Future<T>, reason: SuspendReason) -> Self {
        Self::reading(future, reason, Future::take_owned)
    }

    fn reading(future: Future<T>, reason: SuspendReason, read: Read<T>) -> Self {
        Self {
            future,
            read,
            reason,
            observer: None,
            waker: Rc::new(RefCell::new(None)),
        }
    }
}

impl<T> std::future::Future for Wait<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(outcome) = (this.read)(&this.future) {
            this.observer = None;
            return Poll::Ready(outcome);
        }

        *this.waker.borrow_mut() = Some(cx.waker().clone());
        if this.observer.is_none() {
            let slot = this.waker.clone();
            this.observer = Some(this.future.watch(move |_| {
                if let Some(waker) = slot.borrow_mut().take() {
                    waker.wake();
                }
            }));
        }
        note_suspend(this.reason);
        Poll::Pending
    }
}

impl<T> Drop for Wait<T> {
    fn drop(&mut self) {
        if let Some(id) = self.observer.take() {
            self.future.unsubscribe(id);
        }
    }
}

// --- Unhandled rejection reporting ---

type RejectionHook = Rc<dyn Fn(&Error)>;

thread_local! {
    static REJECTION_HOOK: RefCell<Option<RejectionHook>> = RefCell::new(None);
    static REPORTING: std::cell::Cell<bool> = const { std::cell::Cell::new(true) };
}

/// Install the sink for unhandled rejections on this thread.
///
/// `None` restores the default, which logs at error level.
pub fn set_rejection_hook(hook: Option<Rc<dyn Fn(&Error)>>) {
    let _ = REJECTION_HOOK.try_with(|slot| *slot.borrow_mut() = hook);
}

/// Turn unhandled-rejection reporting on or off for this thread.
pub fn set_rejection_reporting(enabled: bool) {
    let _ = REPORTING.try_with(|flag| flag.set(enabled));
}

fn report_unhandled(err: &Error) {
    if !REPORTING.try_with(|flag| flag.get()).unwrap_or(false) {
        return;
    }
    let hook = REJECTION_HOOK
        .try_with(|slot| slot.borrow().clone())
        .ok()
        .flatten();
    match hook {
        Some(hook) => hook(err),
        None => log::error!("unhandled rejection: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn capture_rejections() -> Rc<RefCell<Vec<String>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        set_rejection_hook(Some(Rc::new(move |err: &Error| {
            sink.borrow_mut().push(err.to_string())
        })));
        seen
    }

    #[test]
    fn resolved_value_stays_readable() {
        let (promise, future) = pair();
        let other = promise.future();
        assert!(!future.is_complete());
        promise.resolve(7).unwrap();
        assert!(future.is_complete());
        assert_eq!(future.try_get().unwrap().unwrap(), 7);
        assert_eq!(future.try_get().unwrap().unwrap(), 7);
        assert_eq!(other.try_get().unwrap().unwrap(), 7);

        let hit = Rc::new(RefCell::new(None));
        let h = hit.clone();
        other.subscribe(move |r| *h.borrow_mut() = Some(*r.as_ref().unwrap()));
        assert_eq!(*hit.borrow(), Some(7));
    }

    #[test]
    fn last_handle_moves_value_out() {
        let (promise, future) = pair::<String>();
        let spare = future.clone();
        promise.resolve("owned".to_string()).unwrap();
        drop(promise);
        match future.take_owned() {
            Some(Err(Error::Logic(_))) => {}
            other => panic!("expected Logic, got {:?}", other),
        }
        drop(future);
        assert_eq!(spare.take_owned().unwrap().unwrap(), "owned");
    }

    #[test]
    fn second_settle_is_logic_error() {
        let (promise, future) = pair();
        promise.resolve(1).unwrap();
        assert!(matches!(promise.resolve(2), Err(Error::Logic(_))));
        assert!(matches!(promise.reject(Error::Stopped), Err(Error::Logic(_))));
        assert_eq!(future.try_get().unwrap().unwrap(), 1);
    }

    #[test]
    fn observers_fire_in_order_once() {
        let (promise, future) = pair::<i32>();
        let log = Rc::new(RefCell::new(Vec::new()));
        for n in 0..3 {
            let log = log.clone();
            future.subscribe(move |r| log.borrow_mut().push((n, *r.as_ref().unwrap())));
        }
        promise.resolve(5).unwrap();
        let _ = promise.resolve(6);
        assert_eq!(*log.borrow(), vec![(0, 5), (1, 5), (2, 5)]);
    }

    #[test]
    fn late_observer_fires_immediately() {
        let future = Future::ready("done");
        let hit = Rc::new(RefCell::new(None));
        let h = hit.clone();
        future.subscribe(move |r| *h.borrow_mut() = Some(*r.as_ref().unwrap()));
        assert_eq!(*hit.borrow(), Some("done"));
    }

    #[test]
    fn unsubscribe_prevents_firing() {
        let (promise, future) = pair::<()>();
        let hit = Rc::new(RefCell::new(false));
        let h = hit.clone();
        let id = future.subscribe(move |_| *h.borrow_mut() = true);
        assert!(future.unsubscribe(id));
        promise.resolve(()).unwrap();
        assert!(!*hit.borrow());
    }

    #[test]
    fn observer_may_reenter_future() {
        let (promise, future) = pair::<u8>();
        let again = future.clone();
        let hit = Rc::new(RefCell::new(false));
        let h = hit.clone();
        future.subscribe(move |_| {
            again.subscribe(move |_| *h.borrow_mut() = true);
        });
        promise.resolve(1).unwrap();
        assert!(*hit.borrow());
    }

    #[test]
    fn unhandled_rejection_is_reported() {
        let seen = capture_rejections();
        {
            let (promise, _future) = pair::<()>();
            promise.reject(Error::msg("nobody listened")).unwrap();
        }
        assert_eq!(*seen.borrow(), vec!["nobody listened".to_string()]);
        set_rejection_hook(None);
    }

    #[test]
    fn ignored_or_observed_rejection_is_quiet() {
        let seen = capture_rejections();
        {
            let (promise, future) = pair::<()>();
            future.ignore();
            promise.reject(Error::msg("ignored")).unwrap();
        }
        {
            let (promise, future) = pair::<()>();
            future.subscribe(|_| {});
            promise.reject(Error::msg("observed")).unwrap();
        }
        assert!(seen.borrow().is_empty());
        set_rejection_hook(None);
    }

    #[test]
    fn dropped_promise_rejects_quietly() {
        let seen = capture_rejections();
        let (promise, future) = pair::<i32>();
        drop(promise);
        assert!(matches!(future.try_get(), Some(Err(Error::Logic(_)))));
        drop(future);
        assert!(seen.borrow().is_empty());
        set_rejection_hook(None);
    }

    #[test]
    fn rejection_is_visible_to_every_handle() {
        let future = Future::<i32>::failed(Error::Stopped);
        let other = future.clone();
        assert!(matches!(future.try_get(), Some(Err(Error::Stopped))));
        assert!(matches!(other.try_get(), Some(Err(Error::Stopped))));
    }
}
