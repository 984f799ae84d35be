// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Sleep, yield and timeouts.
//!
//! All timing goes through the scheduler's timer set, so it follows the
//! scheduler's driver clock.

use std::fmt;
use std::future::{Future as StdFuture, IntoFuture};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::cancel::CancellationToken;
use crate::coroutine::{note_suspend, SuspendReason};
use crate::error::Error;
use crate::promise::{self, Wait};
use crate::scheduler::{Scheduler, WeakScheduler};
use crate::timer::TimerId;

/// Suspends the calling coroutine for a duration. Dropping it early
/// clears its timer.
pub struct Sleep {
    scheduler: WeakScheduler,
    timer: Option<TimerId>,
    wait: Wait<()>,
}

impl StdFuture for Sleep {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.wait).poll(cx) {
            Poll::Ready(outcome) => {
                this.timer = None;
                Poll::Ready(outcome)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let (Some(timer), Some(scheduler)) = (self.timer.take(), self.scheduler.upgrade()) {
            scheduler.clear(timer);
        }
    }
}

impl fmt::Debug for Sleep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sleep").field("timer", &self.timer).finish()
    }
}

/// Give other runnable coroutines a turn.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

#[derive(Debug)]
pub struct YieldNow {
    yielded: bool,
}

impl StdFuture for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        note_suspend(SuspendReason::Yield);
        Poll::Pending
    }
}

/// A cancellation token that fires when its timer runs out. Dropping the
/// guard clears the timer; the token itself stays usable.
pub struct TimeoutToken {
    token: CancellationToken,
    timer: TimerId,
    scheduler: WeakScheduler,
}

impl TimeoutToken {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_expired(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for TimeoutToken {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.clear(self.timer);
        }
    }
}

impl fmt::Debug for TimeoutToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutToken")
            .field("timer", &self.timer)
            .field("expired", &self.is_expired())
            .finish()
    }
}

fn timed_out(after: Duration) -> String {
    format!("timed out after {after:?}")
}

/// Races work against a timer.
struct Timeout<F> {
    work: Pin<Box<F>>,
    sleep: Sleep,
    after: Duration,
}

impl<F, T> StdFuture for Timeout<F>
where
    F: StdFuture<Output = Result<T, Error>>,
{
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Poll::Ready(outcome) = this.work.as_mut().poll(cx) {
            return Poll::Ready(outcome);
        }
        match Pin::new(&mut this.sleep).poll(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Err(Error::Cancelled(timed_out(this.after)))),
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Scheduler {
    /// Suspend the calling coroutine for `duration`.
    pub fn sleep(&self, duration: Duration) -> Sleep {
        let (promise, fired) = promise::pair();
        let timer = self.delay(duration, move || {
            let _ = promise.resolve(());
        });
        Sleep {
            scheduler: self.downgrade(),
            timer: Some(timer),
            wait: Wait::new(fired, SuspendReason::Sleep),
        }
    }

    pub fn yield_now(&self) -> YieldNow {
        yield_now()
    }

    /// Await `work`, failing with `Cancelled` if it takes longer than
    /// `after`. The work is dropped on timeout.
    pub async fn with_timeout<F, T>(&self, after: Duration, work: F) -> Result<T, Error>
    where
        F: IntoFuture<Output = Result<T, Error>>,
    {
        Timeout {
            work: Box::pin(work.into_future()),
            sleep: self.sleep(after),
            after,
        }
        .await
    }

    /// A token cancelled once `after` has elapsed.
    pub fn timeout_token(&self, after: Duration) -> TimeoutToken {
        let token = CancellationToken::new();
        let fire = token.clone();
        let timer = self.delay(after, move || fire.cancel_with(timed_out(after)));
        TimeoutToken {
            token,
            timer,
            scheduler: self.downgrade(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::VirtualDriver;
    use crate::promise::Future;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn scheduler() -> (Scheduler, VirtualDriver) {
        let clock = VirtualDriver::new();
        (Scheduler::with_driver(clock.clone()), clock)
    }

    #[test]
    fn sleep_advances_virtual_time() {
        let (sched, clock) = scheduler();
        let s = sched.clone();
        sched
            .block_on(async move { s.sleep(Duration::from_secs(3)).await })
            .unwrap();
        assert_eq!(clock.elapsed(), Duration::from_secs(3));
        assert_eq!(sched.pending_timers(), 0);
    }

    #[test]
    fn yield_lets_others_run() {
        let (sched, _) = scheduler();
        let log = Rc::new(RefCell::new(Vec::new()));
        for name in ["a", "b"] {
            let log = log.clone();
            sched.run(async move {
                log.borrow_mut().push(format!("{name}1"));
                yield_now().await;
                log.borrow_mut().push(format!("{name}2"));
                Ok(())
            });
        }
        sched.run_until_idle().unwrap();
        assert_eq!(*log.borrow(), vec!["a1", "b1", "a2", "b2"]);
    }

    #[test]
    fn with_timeout_expires() {
        let (sched, clock) = scheduler();
        let s = sched.clone();
        let (_producer, never) = promise::pair::<u8>();
        let err = sched
            .block_on(async move { s.with_timeout(Duration::from_millis(50), never).await })
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(ref r) if r.contains("timed out")));
        assert_eq!(clock.elapsed(), Duration::from_millis(50));
    }

    #[test]
    fn with_timeout_passes_through_and_clears_timer() {
        let (sched, _) = scheduler();
        let s = sched.clone();
        let got = sched
            .block_on(async move { s.with_timeout(Duration::from_secs(1), Future::ready(9)).await })
            .unwrap();
        assert_eq!(got, 9);
        assert_eq!(sched.pending_timers(), 0);
    }

    #[test]
    fn timeout_token_cancels_receive() {
        let (sched, _) = scheduler();
        let (_tx, rx) = sched.create_channel_pair::<u8>(0);
        let s = sched.clone();
        let err = sched
            .block_on(async move {
                let deadline = s.timeout_token(Duration::from_millis(20));
                rx.receive_async(Some(deadline.token())).await
            })
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn dropped_timeout_token_clears_timer() {
        let (sched, _) = scheduler();
        let guard = sched.timeout_token(Duration::from_secs(1));
        assert_eq!(sched.pending_timers(), 1);
        let token = guard.token().clone();
        drop(guard);
        assert_eq!(sched.pending_timers(), 0);
        sched.run_to_completion().unwrap();
        assert!(!token.is_cancelled());
    }
}
