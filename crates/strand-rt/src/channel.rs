// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Channels.
//!
//! A bounded channel with one sending and one receiving end. Capacity 0 is
//! a rendezvous: `send` completes only once a receiver has taken the value.
//! Blocked senders and receivers are released in arrival order.
//!
//! Dropping either end closes the channel.

use std::fmt;
use std::rc::Rc;

use crate::cancel::CancellationToken;
use crate::coroutine::SuspendReason;
use crate::error::{Error, Resource};
use crate::pipe::Pipe;
use crate::promise::Future;
use crate::Closable;

/// Create a channel holding up to `capacity` buffered values.
pub fn pair<T: 'static>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let pipe = Pipe::new(capacity, Resource::Channel);
    (Sender { pipe: pipe.clone() }, Receiver { pipe })
}

/// Sending end of a channel.
pub struct Sender<T: 'static> {
    pipe: Rc<Pipe<T>>,
}

impl<T: 'static> Sender<T> {
    /// Send a value, suspending until it is buffered or handed to a
    /// receiver.
    pub async fn send(&self, value: T) -> Result<(), Error> {
        self.send_async(value, None).await
    }

    /// Like [`Sender::send`], failing with `Cancelled` if the token fires
    /// while the sender is blocked.
    pub async fn send_async(
        &self,
        value: T,
        cancellation: Option<&CancellationToken>,
    ) -> Result<(), Error> {
        self.pipe.push(value, cancellation, SuspendReason::Send).await
    }

    /// Send without suspending. The returned future resolves once the value
    /// is delivered.
    pub fn send_with_promise(
        &self,
        value: T,
        cancellation: Option<&CancellationToken>,
    ) -> Future<()> {
        self.pipe.offer(value, cancellation).0
    }

    pub fn is_empty(&self) -> bool {
        self.pipe.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.pipe.is_full()
    }

    /// Buffered values.
    pub fn len(&self) -> usize {
        self.pipe.len()
    }

    pub fn capacity(&self) -> usize {
        self.pipe.capacity()
    }
}

/// Receiving end of a channel.
pub struct Receiver<T: 'static> {
    pipe: Rc<Pipe<T>>,
}

impl<T: 'static> Receiver<T> {
    /// Receive the next value, suspending while the channel is empty.
    ///
    /// Fails with `Closed` once the channel is closed and drained.
    pub async fn receive(&self) -> Result<T, Error> {
        self.receive_async(None).await
    }

    pub async fn receive_async(&self, cancellation: Option<&CancellationToken>) -> Result<T, Error> {
        self.pipe
            .pull(cancellation, SuspendReason::Receive)
            .await?
            .ok_or(Error::Closed(Resource::Channel))
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

impl<T: 'static> Closable for Sender<T> {
    fn close(&self) {
        self.pipe.close();
    }

    fn is_closed(&self) -> bool {
        self.pipe.is_closed()
    }
}

impl<T: 'static> Closable for Receiver<T> {
    fn close(&self) {
        self.pipe.close();
    }

    fn is_closed(&self) -> bool {
        self.pipe.is_closed()
    }
}

impl<T: 'static> Drop for Sender<T> {
    fn drop(&mut self) {
        self.pipe.close();
    }
}

impl<T: 'static> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.pipe.close();
    }
}

impl<T: 'static> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("len", &self.pipe.len())
            .field("capacity", &self.pipe.capacity())
            .field("closed", &self.pipe.is_closed())
            .finish()
    }
}

impl<T: 'static> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("len", &self.pipe.len())
            .field("capacity", &self.pipe.capacity())
            .field("closed", &self.pipe.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use crate::driver::VirtualDriver;
    use std::cell::RefCell;

    fn scheduler() -> Scheduler {
        Scheduler::with_driver(VirtualDriver::new())
    }

    #[test]
    fn buffered_send_receive() {
        let sched = scheduler();
        let (tx, rx) = pair(4);
        let got = sched
            .block_on(async move {
                for n in 0..3 {
                    tx.send(n).await?;
                }
                assert_eq!(tx.len(), 3);
                let mut out = Vec::new();
                for _ in 0..3 {
                    out.push(rx.receive().await?);
                }
                Ok(out)
            })
            .unwrap();
        assert_eq!(got, vec![0, 1, 2]);
    }

    #[test]
    fn closed_channel_drains_then_fails() {
        let sched = scheduler();
        let (tx, rx) = pair(2);
        let got = sched
            .block_on(async move {
                tx.send("a").await?;
                tx.send("b").await?;
                tx.close();
                assert!(tx.is_closed());
                assert!(matches!(tx.send("c").await, Err(Error::Closed(Resource::Channel))));
                let first = rx.receive().await?;
                let second = rx.receive().await?;
                let third = rx.receive().await;
                Ok((first, second, third.is_err()))
            })
            .unwrap();
        assert_eq!(got, ("a", "b", true));
    }

    #[test]
    fn dropping_sender_closes() {
        let (tx, rx) = pair::<u8>(1);
        drop(tx);
        assert!(rx.is_closed());
    }

    #[test]
    fn send_with_promise_resolves_on_delivery() {
        let sched = scheduler();
        let (tx, rx) = pair(0);
        let delivered = tx.send_with_promise(7, None);
        assert!(!delivered.is_complete());
        assert!(!rx.is_empty());
        let got = sched.block_on(async move { rx.receive().await }).unwrap();
        assert_eq!(got, 7);
        assert!(delivered.is_complete());
    }

    #[test]
    fn blocked_senders_release_in_order() {
        let sched = scheduler();
        let (tx, rx) = pair(0);
        let tx = Rc::new(tx);
        let order = Rc::new(RefCell::new(Vec::new()));
        for n in 0..3 {
            let tx = tx.clone();
            let order = order.clone();
            sched.run(async move {
                tx.send(n).await?;
                order.borrow_mut().push(n);
                Ok(())
            });
        }
        let got = sched
            .block_on(async move {
                let mut out = Vec::new();
                for _ in 0..3 {
                    out.push(rx.receive().await?);
                }
                Ok(out)
            })
            .unwrap();
        sched.run_until_idle().unwrap();
        assert_eq!(got, vec![0, 1, 2]);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }
}
