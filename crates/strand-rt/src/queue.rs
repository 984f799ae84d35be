// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Multi-producer queues.
//!
//! Producers share a [`Queue`] handle; the single consumer pulls values in
//! production order through a [`ConcurrentIterator`]. Closing ends the
//! stream once buffered values are drained.

use std::fmt;
use std::rc::Rc;

use crate::cancel::CancellationToken;
use crate::coroutine::SuspendReason;
use crate::error::{Error, Resource};
use crate::pipe::Pipe;
use crate::promise::Future;
use crate::Closable;

/// Bounded multi-producer queue. Clones share the same queue.
pub struct Queue<T: 'static> {
    pipe: Rc<Pipe<T>>,
}

impl<T: 'static> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            pipe: self.pipe.clone(),
        }
    }
}

impl<T: 'static> Queue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            pipe: Pipe::new(capacity, Resource::Queue),
        }
    }

    /// Push a value, suspending while the queue is full.
    pub async fn push(&self, value: T) -> Result<(), Error> {
        self.push_async(value, None).await
    }

    pub async fn push_async(
        &self,
        value: T,
        cancellation: Option<&CancellationToken>,
    ) -> Result<(), Error> {
        self.pipe.push(value, cancellation, SuspendReason::Push).await
    }

    /// Push without suspending; the future resolves once the value is
    /// accepted.
    pub fn push_with_promise(
        &self,
        value: T,
        cancellation: Option<&CancellationToken>,
    ) -> Future<()> {
        self.pipe.offer(value, cancellation).0
    }

    /// Cursor over the queue's stream.
    pub fn iterator(&self) -> ConcurrentIterator<T> {
        ConcurrentIterator {
            pipe: self.pipe.clone(),
            current: None,
        }
    }

    /// Close the queue; the consumer gets `error` after draining.
    pub fn fail(&self, error: Error) {
        self.pipe.fail(error);
    }

    pub fn is_empty(&self) -> bool {
        self.pipe.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.pipe.is_full()
    }

    pub fn len(&self) -> usize {
        self.pipe.len()
    }

    pub fn capacity(&self) -> usize {
        self.pipe.capacity()
    }
}

impl<T: 'static> Closable for Queue<T> {
    fn close(&self) {
        self.pipe.close();
    }

    fn is_closed(&self) -> bool {
        self.pipe.is_closed()
    }
}

impl<T: 'static> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("len", &self.pipe.len())
            .field("capacity", &self.pipe.capacity())
            .field("closed", &self.pipe.is_closed())
            .finish()
    }
}

/// Pull cursor over a queue.
///
/// `advance` takes `&mut self`, so one iterator has at most one advance in
/// flight.
pub struct ConcurrentIterator<T: 'static> {
    pipe: Rc<Pipe<T>>,
    current: Option<T>,
}

impl<T: 'static> ConcurrentIterator<T> {
    /// Wait for the next value. `Ok(false)` at the end of the stream.
    pub async fn advance(&mut self) -> Result<bool, Error> {
        self.advance_async(None).await
    }

    pub async fn advance_async(
        &mut self,
        cancellation: Option<&CancellationToken>,
    ) -> Result<bool, Error> {
        self.current = None;
        self.current = self.pipe.pull(cancellation, SuspendReason::Advance).await?;
        Ok(self.current.is_some())
    }

    /// Value produced by the last successful advance.
    pub fn current(&self) -> Option<&T> {
        self.current.as_ref()
    }

    pub fn take_current(&mut self) -> Option<T> {
        self.current.take()
    }

    /// Advance and take the value. `Ok(None)` at the end of the stream.
    pub async fn next(&mut self) -> Result<Option<T>, Error> {
        self.advance().await?;
        Ok(self.current.take())
    }

    /// Stop consuming. Blocked producers fail with `Closed`; buffered
    /// values are kept but nobody will read them through a new push.
    pub fn dispose(&self) {
        self.pipe.close();
    }
}

impl<T: 'static> fmt::Debug for ConcurrentIterator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentIterator")
            .field("has_current", &self.current.is_some())
            .field("closed", &self.pipe.is_closed())
            .finish()
    }
}
