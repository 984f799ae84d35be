// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Strand runtime.
//!
//! A cooperative, single-threaded coroutine runtime. Coroutines are local
//! futures driven by a [`Scheduler`]; they suspend only at explicit
//! points (channel and queue operations, iterator advance, await
//! combinators, sleeps) and never run in parallel with each other.
//!
//! Components:
//! - scheduler: run queue, deferred callbacks, timers and intervals
//! - promise: single-assignment futures with observers
//! - channel / queue: bounded FIFO message passing
//! - select: await combinators over keyed futures
//! - cancel: cancellation tokens
//! - timeout: sleep, yield and timeouts
//!
//! ```
//! use strand_rt::{Scheduler, VirtualDriver};
//!
//! let sched = Scheduler::with_driver(VirtualDriver::new());
//! let (tx, rx) = sched.create_channel_pair(0);
//! sched.run(async move { tx.send(42).await });
//! let got = sched.block_on(async move { rx.receive().await }).unwrap();
//! assert_eq!(got, 42);
//! ```

pub mod cancel;
pub mod channel;
pub mod config;
pub mod coroutine;
pub mod driver;
pub mod error;
mod pipe;
pub mod promise;
pub mod queue;
pub mod scheduler;
pub mod select;
pub mod timeout;
pub mod timer;

pub use cancel::{CallbackId, CancellationToken};
pub use channel::{Receiver, Sender};
pub use config::SchedulerConfig;
pub use coroutine::{Coroutine, CoroutineId, CoroutineState, SuspendReason};
pub use driver::{Driver, ThreadDriver, VirtualDriver};
pub use error::{Error, Resource, Result};
pub use promise::{set_rejection_hook, set_rejection_reporting, Future, ObserverId, Promise};
pub use queue::{ConcurrentIterator, Queue};
pub use scheduler::Scheduler;
pub use select::{wait, wait_all, wait_all_without_error, wait_any, wait_first};
pub use timeout::{yield_now, Sleep, TimeoutToken, YieldNow};
pub use timer::{IntervalTask, TimerId};

/// Something that can be closed for good.
pub trait Closable {
    /// Close. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}
