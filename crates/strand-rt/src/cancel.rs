// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative cancellation.
//!
//! A token moves from active to cancelled once. Listeners fire exactly
//! once, in registration order, with the cancellation reason. The token
//! does no cleanup itself: each waiting operation unhooks its own wait
//! state when notified.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::error::Error;

const DEFAULT_REASON: &str = "cancelled";

/// Handle returned by [`CancellationToken::on_cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

type Listener = Box<dyn FnOnce(&str)>;

struct TokenState {
    reason: Option<String>,
    listeners: Vec<(CallbackId, Listener)>,
    next_id: u64,
}

/// Cancellation token shared by every operation that observes it.
///
/// Cloning yields another handle to the same token.
#[derive(Clone)]
pub struct CancellationToken {
    state: Rc<RefCell<TokenState>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(TokenState {
                reason: None,
                listeners: Vec::new(),
                next_id: 0,
            })),
        }
    }

    /// Cancel with the default reason.
    pub fn cancel(&self) {
        self.cancel_with(DEFAULT_REASON);
    }

    /// Cancel with a reason. Only the first call has any effect.
    pub fn cancel_with(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let listeners = {
            let mut state = self.state.borrow_mut();
            if state.reason.is_some() {
                return;
            }
            state.reason = Some(reason.clone());
            std::mem::take(&mut state.listeners)
        };
        for (_, listener) in listeners {
            listener(&reason);
        }
    }

    /// Whether the token has fired.
    pub fn is_cancelled(&self) -> bool {
        self.state.borrow().reason.is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.state.borrow().reason.clone()
    }

    /// `Err(Cancelled)` once the token has fired.
    pub fn check(&self) -> Result<(), Error> {
        match self.reason() {
            Some(reason) => Err(Error::Cancelled(reason)),
            None => Ok(()),
        }
    }

    /// Register a listener. Fires on the spot if already cancelled.
    pub fn on_cancel(&self, listener: impl FnOnce(&str) + 'static) -> CallbackId {
        let (id, fired) = {
            let mut state = self.state.borrow_mut();
            let id = CallbackId(state.next_id);
            state.next_id += 1;
            match state.reason.clone() {
                Some(reason) => (id, Some(reason)),
                None => {
                    state.listeners.push((id, Box::new(listener)));
                    return id;
                }
            }
        };
        if let Some(reason) = fired {
            listener(&reason);
        }
        id
    }

    /// Remove a listener that has not fired yet. Returns whether it was found.
    pub fn off(&self, id: CallbackId) -> bool {
        let removed = {
            let mut state = self.state.borrow_mut();
            state
                .listeners
                .iter()
                .position(|(lid, _)| *lid == id)
                .map(|pos| state.listeners.remove(pos))
        };
        // Dropped outside the borrow: a listener may own other handles.
        removed.is_some()
    }

    /// A token cancelled together with this one (but not the other way round).
    pub fn child(&self) -> CancellationToken {
        let child = CancellationToken::new();
        let linked = child.clone();
        self.on_cancel(move |reason| linked.cancel_with(reason));
        child
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.state.borrow().listeners.len()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("CancellationToken")
            .field("reason", &state.reason)
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn cancel_sets_flag() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
        token.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(Error::Cancelled(r)) if r == "cancelled"));
    }

    #[test]
    fn listeners_fire_once_in_order() {
        let token = CancellationToken::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        for n in 0..3 {
            let log = log.clone();
            token.on_cancel(move |reason| log.borrow_mut().push(format!("{n}:{reason}")));
        }
        token.cancel_with("shutdown");
        token.cancel_with("again");
        assert_eq!(*log.borrow(), vec!["0:shutdown", "1:shutdown", "2:shutdown"]);
        assert_eq!(token.reason().as_deref(), Some("shutdown"));
    }

    #[test]
    fn late_listener_fires_immediately() {
        let token = CancellationToken::new();
        token.cancel();
        let hit = Rc::new(RefCell::new(false));
        let h = hit.clone();
        token.on_cancel(move |_| *h.borrow_mut() = true);
        assert!(*hit.borrow());
    }

    #[test]
    fn off_removes_listener() {
        let token = CancellationToken::new();
        let hit = Rc::new(RefCell::new(0));
        let h = hit.clone();
        let id = token.on_cancel(move |_| *h.borrow_mut() += 1);
        assert!(token.off(id));
        assert!(!token.off(id));
        token.cancel();
        assert_eq!(*hit.borrow(), 0);
    }

    #[test]
    fn listener_may_reenter_token() {
        let token = CancellationToken::new();
        let inner = token.clone();
        let hit = Rc::new(RefCell::new(false));
        let h = hit.clone();
        token.on_cancel(move |_| {
            inner.on_cancel(move |_| *h.borrow_mut() = true);
        });
        token.cancel();
        assert!(*hit.borrow());
    }

    #[test]
    fn child_follows_parent() {
        let parent = CancellationToken::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());

        let child = parent.child();
        parent.cancel_with("parent gone");
        assert_eq!(child.reason().as_deref(), Some("parent gone"));
    }
}
