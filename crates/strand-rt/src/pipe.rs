// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Bounded buffer with FIFO waiter lists.
//!
//! Shared core of channels and queues. Producers that find the buffer full
//! park with their value; consumers that find it empty park with a promise.
//! Capacity 0 is a rendezvous: a value is accepted only when a consumer
//! takes it.
//!
//! Every promise is settled after the state borrow is released, so
//! observers may call back into the same pipe.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future as StdFuture;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::cancel::CancellationToken;
use crate::coroutine::SuspendReason;
use crate::error::{Error, Resource};
use crate::promise::{self, Future, Promise, Wait};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WaiterId(u64);

/// FIFO of parked waiters, removable by id.
pub(crate) struct WaitList<W> {
    entries: VecDeque<(WaiterId, W)>,
    next_id: u64,
}

impl<W> WaitList<W> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            next_id: 0,
        }
    }

    pub fn push(&mut self, waiter: W) -> WaiterId {
        let id = WaiterId(self.next_id);
        self.next_id += 1;
        self.entries.push_back((id, waiter));
        id
    }

    pub fn pop_front(&mut self) -> Option<W> {
        self.entries.pop_front().map(|(_, w)| w)
    }

    pub fn remove(&mut self, id: WaiterId) -> Option<W> {
        let pos = self.entries.iter().position(|(wid, _)| *wid == id)?;
        self.entries.remove(pos).map(|(_, w)| w)
    }

    pub fn drain(&mut self) -> Vec<W> {
        self.entries.drain(..).map(|(_, w)| w).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A producer waiting for room, holding the value it wants to hand over.
struct Parked<T> {
    value: T,
    delivered: Promise<()>,
}

struct PipeState<T> {
    capacity: usize,
    buffer: VecDeque<T>,
    producers: WaitList<Parked<T>>,
    consumers: WaitList<Promise<Option<T>>>,
    closed: bool,
    /// Error handed to consumers once the buffer drains.
    failure: Option<Error>,
}

pub(crate) struct Pipe<T> {
    state: RefCell<PipeState<T>>,
    resource: Resource,
}

enum Offer<T> {
    Accepted(Promise<()>),
    Handoff(Promise<Option<T>>, T, Promise<()>),
    Closed(Promise<()>),
    Parked(WaiterId),
}

enum Pull<T> {
    Ready(Result<Option<T>, Error>, Option<Promise<()>>),
    Parked(WaiterId, Future<Option<T>>),
}

impl<T: 'static> Pipe<T> {
    pub fn new(capacity: usize, resource: Resource) -> Rc<Self> {
        Rc::new(Self {
            state: RefCell::new(PipeState {
                capacity,
                buffer: VecDeque::with_capacity(capacity),
                producers: WaitList::new(),
                consumers: WaitList::new(),
                closed: false,
                failure: None,
            }),
            resource,
        })
    }

    /// Hand a value to the pipe without suspending.
    ///
    /// The returned future resolves once the value is buffered or taken by
    /// a consumer. The waiter id is set when the producer had to park.
    pub fn offer(
        self: &Rc<Self>,
        value: T,
        cancellation: Option<&CancellationToken>,
    ) -> (Future<()>, Option<WaiterId>) {
        let (promise, delivered) = promise::pair();
        if let Some(token) = cancellation {
            if let Err(err) = token.check() {
                let _ = promise.reject(err);
                return (delivered, None);
            }
        }

        let offer = {
            let mut state = self.state.borrow_mut();
            if state.closed {
                Offer::Closed(promise)
            } else if let Some(consumer) = state.consumers.pop_front() {
                Offer::Handoff(consumer, value, promise)
            } else if state.buffer.len() < state.capacity {
                state.buffer.push_back(value);
                Offer::Accepted(promise)
            } else {
                Offer::Parked(state.producers.push(Parked {
                    value,
                    delivered: promise,
                }))
            }
        };

        match offer {
            Offer::Accepted(promise) => {
                let _ = promise.resolve(());
                (delivered, None)
            }
            Offer::Handoff(consumer, value, promise) => {
                let _ = consumer.resolve(Some(value));
                let _ = promise.resolve(());
                (delivered, None)
            }
            Offer::Closed(promise) => {
                let _ = promise.reject(Error::Closed(self.resource));
                (delivered, None)
            }
            Offer::Parked(id) => {
                if let Some(token) = cancellation {
                    self.cancel_producer_on(token, id, &delivered);
                }
                (delivered, Some(id))
            }
        }
    }

    /// Hand a value to the pipe, suspending until it is accepted.
    pub async fn push(
        self: &Rc<Self>,
        value: T,
        cancellation: Option<&CancellationToken>,
        reason: SuspendReason,
    ) -> Result<(), Error> {
        let (delivered, parked) = self.offer(value, cancellation);
        match parked {
            None => delivered.await,
            Some(id) => {
                let pipe = Rc::downgrade(self);
                let withdraw = move || {
                    if let Some(pipe) = pipe.upgrade() {
                        let parked = pipe.state.borrow_mut().producers.remove(id);
                        drop(parked);
                    }
                };
                Blocked::new(Wait::new(delivered, reason), withdraw).await
            }
        }
    }

    /// Take the next value, suspending while the pipe is empty.
    ///
    /// `Ok(None)` once the pipe is closed and drained; the failure error
    /// instead if it was closed through [`Pipe::fail`].
    pub async fn pull(
        self: &Rc<Self>,
        cancellation: Option<&CancellationToken>,
        reason: SuspendReason,
    ) -> Result<Option<T>, Error> {
        if let Some(token) = cancellation {
            token.check()?;
        }

        let (promise, future) = promise::pair();
        let pull = {
            let mut state = self.state.borrow_mut();
            if let Some(value) = state.buffer.pop_front() {
                // A parked producer takes the slot just freed.
                let released = state.producers.pop_front().map(|parked| {
                    state.buffer.push_back(parked.value);
                    parked.delivered
                });
                Pull::Ready(Ok(Some(value)), released)
            } else if let Some(parked) = state.producers.pop_front() {
                Pull::Ready(Ok(Some(parked.value)), Some(parked.delivered))
            } else if state.closed {
                let end = match &state.failure {
                    Some(err) => Err(err.clone()),
                    None => Ok(None),
                };
                Pull::Ready(end, None)
            } else {
                Pull::Parked(state.consumers.push(promise), future)
            }
        };

        match pull {
            Pull::Ready(result, released) => {
                if let Some(delivered) = released {
                    let _ = delivered.resolve(());
                }
                result
            }
            Pull::Parked(id, future) => {
                if let Some(token) = cancellation {
                    self.cancel_consumer_on(token, id, &future);
                }
                let pipe = Rc::downgrade(self);
                let withdraw = move || {
                    if let Some(pipe) = pipe.upgrade() {
                        let waiter = pipe.state.borrow_mut().consumers.remove(id);
                        drop(waiter);
                    }
                };
                Blocked::new(Wait::owned(future, reason), withdraw).await
            }
        }
    }

    fn cancel_producer_on(self: &Rc<Self>, token: &CancellationToken, id: WaiterId, delivered: &Future<()>) {
        let pipe = Rc::downgrade(self);
        let listener = token.on_cancel(move |reason| {
            let Some(pipe) = pipe.upgrade() else { return };
            let parked = pipe.state.borrow_mut().producers.remove(id);
            if let Some(parked) = parked {
                let _ = parked.delivered.reject(Error::Cancelled(reason.to_string()));
            }
        });
        let token = token.clone();
        delivered.watch(move |_| {
            token.off(listener);
        });
    }

    fn cancel_consumer_on(
        self: &Rc<Self>,
        token: &CancellationToken,
        id: WaiterId,
        future: &Future<Option<T>>,
    ) {
        let pipe = Rc::downgrade(self);
        let listener = token.on_cancel(move |reason| {
            let Some(pipe) = pipe.upgrade() else { return };
            let waiter = pipe.state.borrow_mut().consumers.remove(id);
            if let Some(promise) = waiter {
                let _ = promise.reject(Error::Cancelled(reason.to_string()));
            }
        });
        let token = token.clone();
        future.watch(move |_| {
            token.off(listener);
        });
    }

    /// Close the pipe. Parked producers fail with `Closed`; parked
    /// consumers see the end of the stream. Buffered values stay readable.
    pub fn close(&self) -> bool {
        self.shutdown(None)
    }

    /// Close the pipe, delivering `error` to consumers after the drain.
    pub fn fail(&self, error: Error) -> bool {
        self.shutdown(Some(error))
    }

    fn shutdown(&self, failure: Option<Error>) -> bool {
        let (producers, consumers) = {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return false;
            }
            state.closed = true;
            state.failure = failure.clone();
            (state.producers.drain(), state.consumers.drain())
        };
        log::debug!(
            "{} closed ({} producer(s), {} consumer(s) released)",
            self.resource,
            producers.len(),
            consumers.len()
        );
        for parked in producers {
            let _ = parked.delivered.reject(Error::Closed(self.resource));
        }
        for consumer in consumers {
            let _ = match &failure {
                Some(err) => consumer.reject(err.clone()),
                None => consumer.resolve(None),
            };
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    /// No buffered value and no parked producer holding one.
    pub fn is_empty(&self) -> bool {
        let state = self.state.borrow();
        state.buffer.is_empty() && state.producers.is_empty()
    }

    /// Buffer at capacity and no parked consumer to take a value directly.
    pub fn is_full(&self) -> bool {
        let state = self.state.borrow();
        state.buffer.len() >= state.capacity && state.consumers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.borrow().buffer.len()
    }

    pub fn capacity(&self) -> usize {
        self.state.borrow().capacity
    }

    #[cfg(test)]
    pub(crate) fn waiting(&self) -> (usize, usize) {
        let state = self.state.borrow();
        (state.producers.entries.len(), state.consumers.entries.len())
    }
}

/// A parked wait that leaves its waiter list if dropped before it settles.
pub(crate) struct Blocked<R> {
    wait: Wait<R>,
    withdraw: Option<Box<dyn FnOnce()>>,
}

impl<R> Blocked<R> {
    pub fn new(wait: Wait<R>, withdraw: impl FnOnce() + 'static) -> Self {
        Self {
            wait,
            withdraw: Some(Box::new(withdraw)),
        }
    }
}

impl<R> StdFuture for Blocked<R> {
    type Output = Result<R, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.wait).poll(cx) {
            Poll::Ready(outcome) => {
                this.withdraw = None;
                Poll::Ready(outcome)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<R> Drop for Blocked<R> {
    fn drop(&mut self) {
        if let Some(withdraw) = self.withdraw.take() {
            withdraw();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_list_fifo_and_remove() {
        let mut list = WaitList::new();
        let a = list.push("a");
        let _b = list.push("b");
        let _c = list.push("c");
        assert_eq!(list.remove(a), Some("a"));
        assert_eq!(list.remove(a), None);
        assert_eq!(list.pop_front(), Some("b"));
        assert_eq!(list.drain(), vec!["c"]);
        assert!(list.is_empty());
    }

    #[test]
    fn offer_buffers_until_full() {
        let pipe = Pipe::new(2, Resource::Channel);
        let (first, parked) = pipe.offer(1, None);
        assert!(first.is_complete() && parked.is_none());
        let (_, parked) = pipe.offer(2, None);
        assert!(parked.is_none());
        assert!(pipe.is_full());
        let (third, parked) = pipe.offer(3, None);
        assert!(!third.is_complete());
        assert!(parked.is_some());
        assert_eq!(pipe.len(), 2);
        assert_eq!(pipe.waiting(), (1, 0));
    }

    #[test]
    fn rendezvous_is_full_without_consumer() {
        let pipe = Pipe::<u8>::new(0, Resource::Channel);
        assert!(pipe.is_full());
        assert!(pipe.is_empty());
        let (delivered, parked) = pipe.offer(9, None);
        assert!(parked.is_some() && !delivered.is_complete());
        assert!(!pipe.is_empty());
    }

    #[test]
    fn offer_on_closed_pipe_fails() {
        let pipe = Pipe::new(1, Resource::Queue);
        assert!(pipe.close());
        assert!(!pipe.close());
        let (delivered, _) = pipe.offer(1, None);
        assert!(matches!(
            delivered.try_get(),
            Some(Err(Error::Closed(Resource::Queue)))
        ));
    }

    #[test]
    fn close_rejects_parked_producers() {
        let pipe = Pipe::new(0, Resource::Channel);
        let (delivered, _) = pipe.offer("x", None);
        pipe.close();
        assert!(matches!(delivered.try_get(), Some(Err(Error::Closed(_)))));
        assert_eq!(pipe.waiting(), (0, 0));
    }

    #[test]
    fn cancel_unparks_producer() {
        let pipe = Pipe::new(0, Resource::Channel);
        let token = CancellationToken::new();
        let (delivered, _) = pipe.offer(5, Some(&token));
        assert_eq!(token.listener_count(), 1);
        token.cancel_with("no longer needed");
        assert!(matches!(delivered.try_get(), Some(Err(Error::Cancelled(r))) if r == "no longer needed"));
        assert_eq!(pipe.waiting(), (0, 0));
    }

    #[test]
    fn delivered_offer_unhooks_token() {
        let pipe = Pipe::new(0, Resource::Channel);
        let token = CancellationToken::new();
        let (delivered, _) = pipe.offer(5, Some(&token));
        // Simulate a consumer taking the parked value.
        let parked = pipe.state.borrow_mut().producers.pop_front().unwrap();
        parked.delivered.resolve(()).unwrap();
        assert!(delivered.is_complete());
        assert_eq!(token.listener_count(), 0);
    }

    #[test]
    fn offer_with_cancelled_token_never_parks() {
        let pipe = Pipe::new(0, Resource::Channel);
        let token = CancellationToken::new();
        token.cancel();
        let (delivered, parked) = pipe.offer(1, Some(&token));
        assert!(parked.is_none());
        assert!(matches!(delivered.try_get(), Some(Err(Error::Cancelled(_)))));
        assert!(pipe.is_empty());
    }
}
