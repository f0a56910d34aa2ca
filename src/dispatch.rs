//! Publish/subscribe dispatcher for one kind of link event.
//!
//! A [`Dispatcher`] keeps an insertion-ordered registration table of handlers
//! with bound arguments. The transport side calls [`Dispatcher::notify`] once
//! per event (an inbound line, or a link loss) and every current subscriber is
//! invoked inline on the notifying thread, so handlers must be fast and must
//! not block.

use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::error::{LinkError, LinkResult};

/// A subscriber callback.
///
/// Receives the subscription's bound arguments followed by the event payload.
/// Returning [`LinkError::ArgumentMismatch`] aborts the remaining dispatch for
/// the current notification; any other error is wrapped as
/// [`LinkError::ObserverFailure`].
pub type Handler<E> = Arc<dyn Fn(&[String], &E) -> LinkResult<()> + Send + Sync>;

/// A registered handler together with its bound arguments.
struct Subscription<E> {
    handler: Handler<E>,
    bound: Vec<String>,
}

impl<E> Clone for Subscription<E> {
    fn clone(&self) -> Self {
        Subscription {
            handler: Arc::clone(&self.handler),
            bound: self.bound.clone(),
        }
    }
}

impl<E> Subscription<E> {
    /// Check for exact identity: same callback, same bound arguments.
    fn matches(&self, handler: &Handler<E>, bound: &[String]) -> bool {
        Arc::ptr_eq(&self.handler, handler) && self.bound == bound
    }
}

/// Subscribe/notify hub for one event kind.
///
/// The subscription table is mutated from arbitrary threads and read by the
/// notifying thread; all access goes through a single mutex scoped to the
/// dispatcher instance.
pub struct Dispatcher<E> {
    subscriptions: Mutex<Vec<Subscription<E>>>,
}

impl<E> Dispatcher<E> {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Dispatcher {
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Register a handler with no bound arguments.
    ///
    /// Idempotent: re-subscribing an identical (handler, bound) pair is a no-op.
    pub fn subscribe(&self, handler: Handler<E>) {
        self.subscribe_with(handler, &[]);
    }

    /// Register a handler with bound arguments that are passed to every
    /// invocation ahead of the event payload.
    pub fn subscribe_with(&self, handler: Handler<E>, bound: &[&str]) {
        let bound: Vec<String> = bound.iter().map(|s| s.to_string()).collect();
        let mut subs = self.subscriptions.lock().unwrap();
        if !subs.iter().any(|s| s.matches(&handler, &bound)) {
            subs.push(Subscription { handler, bound });
        }
    }

    /// Remove the single subscription matching the handler with no bound
    /// arguments. Absent match is a silent no-op.
    pub fn unsubscribe(&self, handler: &Handler<E>) {
        self.unsubscribe_with(handler, &[]);
    }

    /// Remove the single subscription whose handler and bound arguments match
    /// exactly. Absent match is a silent no-op.
    pub fn unsubscribe_with(&self, handler: &Handler<E>, bound: &[&str]) {
        let bound: Vec<String> = bound.iter().map(|s| s.to_string()).collect();
        let mut subs = self.subscriptions.lock().unwrap();
        if let Some(pos) = subs.iter().position(|s| s.matches(handler, &bound)) {
            subs.remove(pos);
        }
    }

    /// Remove every subscription with the given handler, regardless of bound
    /// arguments.
    pub fn unsubscribe_all(&self, handler: &Handler<E>) {
        let mut subs = self.subscriptions.lock().unwrap();
        subs.retain(|s| !Arc::ptr_eq(&s.handler, handler));
    }

    /// Remove all subscriptions.
    pub fn clear(&self) {
        self.subscriptions.lock().unwrap().clear();
    }

    /// Number of current subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }

    /// Whether the dispatcher has no subscriptions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver an event to every subscriber present when the call began.
    ///
    /// Iterates over a snapshot of the table, so a handler may subscribe or
    /// unsubscribe (including itself) without disturbing the iteration.
    /// Entries removed before their turn are skipped; entries added during
    /// dispatch are not invoked until the next notification.
    pub fn notify(&self, event: &E) -> LinkResult<()> {
        let snapshot: Vec<Subscription<E>> = self.subscriptions.lock().unwrap().clone();
        trace!(subscribers = snapshot.len(), "dispatching event");
        for sub in snapshot {
            // Re-check membership so a subscriber removed mid-dispatch is
            // not invoked after its removal.
            let still_subscribed = self
                .subscriptions
                .lock()
                .unwrap()
                .iter()
                .any(|s| s.matches(&sub.handler, &sub.bound));
            if !still_subscribed {
                continue;
            }
            if let Err(e) = (sub.handler)(&sub.bound, event) {
                return Err(match e {
                    LinkError::ArgumentMismatch { .. } => e,
                    other => LinkError::ObserverFailure(Box::new(other)),
                });
            }
        }
        Ok(())
    }
}

impl<E> Default for Dispatcher<E> {
    fn default() -> Self {
        Self::new()
    }
}
