// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Await combinators.
//!
//! Each combinator takes keyed futures and reports them in the order they
//! settle. Futures already settled when the wait starts count as settling
//! in input order, ahead of anything that settles later.
//!
//! Futures a combinator stops caring about (losers of a race, stragglers
//! after a failure, everything after a cancellation) are marked ignored so
//! their later rejections are not reported as unhandled.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::hash::Hash;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use indexmap::IndexMap;

use crate::cancel::{CallbackId, CancellationToken};
use crate::coroutine::{note_suspend, SuspendReason};
use crate::error::Error;
use crate::promise::{Future, ObserverId};

struct Entry<K, T> {
    /// Taken when the outcome is reported.
    key: Option<K>,
    future: Future<T>,
    observer: Option<ObserverId>,
}

/// Watches a set of futures, yielding them in settlement order.
struct Race<K, T> {
    entries: Vec<Entry<K, T>>,
    settled: Rc<RefCell<VecDeque<usize>>>,
    waker: Rc<RefCell<Option<Waker>>>,
    cancelled: Rc<RefCell<Option<String>>>,
    listener: Option<(CancellationToken, CallbackId)>,
    remaining: usize,
}

impl<K, T: Clone> Race<K, T> {
    fn new<I>(futures: I, cancellation: Option<&CancellationToken>) -> Self
    where
        I: IntoIterator<Item = (K, Future<T>)>,
    {
        let mut race = Race {
            entries: futures
                .into_iter()
                .map(|(key, future)| Entry {
                    key: Some(key),
                    future,
                    observer: None,
                })
                .collect(),
            settled: Rc::new(RefCell::new(VecDeque::new())),
            waker: Rc::new(RefCell::new(None)),
            cancelled: Rc::new(RefCell::new(None)),
            listener: None,
            remaining: 0,
        };
        race.remaining = race.entries.len();

        for (index, entry) in race.entries.iter_mut().enumerate() {
            let settled = race.settled.clone();
            let waker = race.waker.clone();
            entry.observer = Some(entry.future.watch(move |_| {
                settled.borrow_mut().push_back(index);
                wake(&waker);
            }));
        }

        if let Some(token) = cancellation {
            let cancelled = race.cancelled.clone();
            let waker = race.waker.clone();
            let id = token.on_cancel(move |reason| {
                *cancelled.borrow_mut() = Some(reason.to_string());
                wake(&waker);
            });
            race.listener = Some((token.clone(), id));
        }
        race
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn poll_next(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<(K, Result<T, Error>)>, Error>> {
        if let Some(reason) = self.cancelled.borrow().clone() {
            return Poll::Ready(Err(Error::Cancelled(reason)));
        }

        let next = self.settled.borrow_mut().pop_front();
        if let Some(index) = next {
            let entry = &mut self.entries[index];
            entry.observer = None;
            let outcome = entry
                .future
                .try_get()
                .unwrap_or_else(|| Err(Error::Logic("settled future has no outcome".to_string())));
            self.remaining -= 1;
            return match entry.key.take() {
                Some(key) => Poll::Ready(Ok(Some((key, outcome)))),
                None => Poll::Ready(Err(Error::Logic("future reported twice".to_string()))),
            };
        }

        if self.remaining == 0 {
            return Poll::Ready(Ok(None));
        }
        *self.waker.borrow_mut() = Some(cx.waker().clone());
        note_suspend(SuspendReason::Await);
        Poll::Pending
    }

    /// Next settled future as `(key, outcome)`; `None` once all are reported.
    async fn next(&mut self) -> Result<Option<(K, Result<T, Error>)>, Error> {
        std::future::poll_fn(|cx| self.poll_next(cx)).await
    }
}

impl<K, T> Drop for Race<K, T> {
    fn drop(&mut self) {
        if let Some((token, id)) = self.listener.take() {
            token.off(id);
        }
        for entry in &mut self.entries {
            if entry.key.is_none() {
                continue;
            }
            if let Some(observer) = entry.observer.take() {
                entry.future.unsubscribe(observer);
            }
            entry.future.ignore();
        }
    }
}

fn wake(slot: &Rc<RefCell<Option<Waker>>>) {
    let waker = slot.borrow().clone();
    if let Some(waker) = waker {
        waker.wake();
    }
}

/// Wait for every future. The first rejection fails the whole wait.
///
/// The map is ordered by settlement, not by input position.
pub async fn wait_all<K, T, I>(
    futures: I,
    cancellation: Option<&CancellationToken>,
) -> Result<IndexMap<K, T>, Error>
where
    K: Hash + Eq,
    T: Clone,
    I: IntoIterator<Item = (K, Future<T>)>,
{
    let mut race = Race::new(futures, cancellation);
    let mut values = IndexMap::with_capacity(race.len());
    while let Some((key, outcome)) = race.next().await? {
        values.insert(key, outcome?);
    }
    Ok(values)
}

/// Same as [`wait_all`].
pub async fn wait<K, T, I>(
    futures: I,
    cancellation: Option<&CancellationToken>,
) -> Result<IndexMap<K, T>, Error>
where
    K: Hash + Eq,
    T: Clone,
    I: IntoIterator<Item = (K, Future<T>)>,
{
    wait_all(futures, cancellation).await
}

/// Outcome of whichever future settles first, success or failure.
pub async fn wait_first<K, T, I>(
    futures: I,
    cancellation: Option<&CancellationToken>,
) -> Result<T, Error>
where
    T: Clone,
    I: IntoIterator<Item = (K, Future<T>)>,
{
    let mut race = Race::new(futures, cancellation);
    match race.next().await? {
        Some((_, outcome)) => outcome,
        None => Err(Error::Logic("wait_first over no futures".to_string())),
    }
}

/// Value of the first future to resolve. Fails with every rejection, in
/// settlement order, if none resolves.
pub async fn wait_any<K, T, I>(
    futures: I,
    cancellation: Option<&CancellationToken>,
) -> Result<T, Error>
where
    T: Clone,
    I: IntoIterator<Item = (K, Future<T>)>,
{
    let mut race = Race::new(futures, cancellation);
    if race.len() == 0 {
        return Err(Error::Logic("wait_any over no futures".to_string()));
    }
    let mut errors = Vec::new();
    while let Some((_, outcome)) = race.next().await? {
        match outcome {
            Ok(value) => return Ok(value),
            Err(err) => errors.push(err),
        }
    }
    Err(Error::Aggregate(errors))
}

/// Wait for every future and report each outcome. Fails only when
/// cancelled.
pub async fn wait_all_without_error<K, T, I>(
    futures: I,
    cancellation: Option<&CancellationToken>,
) -> Result<IndexMap<K, Result<T, Error>>, Error>
where
    K: Hash + Eq,
    T: Clone,
    I: IntoIterator<Item = (K, Future<T>)>,
{
    let mut race = Race::new(futures, cancellation);
    let mut outcomes = IndexMap::with_capacity(race.len());
    while let Some((key, outcome)) = race.next().await? {
        outcomes.insert(key, outcome);
    }
    Ok(outcomes)
}
