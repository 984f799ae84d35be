// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime errors.
//!
//! Every suspending operation reports failure as the result of the call
//! that suspended. The enum is `Clone` so one rejection can reach every
//! waiter of the same future.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The kind of closable resource an operation ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Channel,
    Queue,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Channel => write!(f, "channel"),
            Resource::Queue => write!(f, "queue"),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Send, push or receive on a closed channel or queue.
    #[error("{0} is closed")]
    Closed(Resource),

    /// A wait was aborted through a cancellation token.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// A future settled with an application error.
    #[error("{0}")]
    Rejected(Arc<dyn std::error::Error + Send + Sync>),

    /// Several underlying failures reported together.
    #[error("{} operations failed", .0.len())]
    Aggregate(Vec<Error>),

    /// Contract violation by calling code, e.g. settling a future twice.
    #[error("logic error: {0}")]
    Logic(String),

    /// Default error delivered by `Scheduler::stop_all`.
    #[error("scheduler stopped")]
    Stopped,

    /// A coroutine body panicked.
    #[error("coroutine panicked: {0}")]
    Panicked(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Plain-text application error used by [`Error::msg`].
#[derive(Debug, Error)]
#[error("{0}")]
struct Message(String);

impl Error {
    /// Wrap an application error as a rejection.
    pub fn rejected<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Rejected(Arc::new(err))
    }

    /// Rejection carrying only a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Error::Rejected(Arc::new(Message(message.into())))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// Underlying errors of an aggregate; a single error otherwise.
    pub fn errors(&self) -> &[Error] {
        match self {
            Error::Aggregate(errors) => errors,
            other => std::slice::from_ref(other),
        }
    }
}
