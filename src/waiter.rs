//! Single-shot wait for a specific inbound line.
//!
//! A [`ResponseWaiter`] subscribes a matcher to the line dispatcher and blocks
//! the calling thread until a payload equal to the expected message arrives,
//! the timeout elapses, or the wait is cancelled. The matcher is always
//! unsubscribed before the call returns, on every path, so no subscription can
//! leak.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::dispatch::{Dispatcher, Handler};
use crate::error::{LinkError, LinkResult};

/// Outcome of a single wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The expected message arrived before the timeout.
    Satisfied,
    /// The timeout elapsed without the expected message.
    TimedOut,
    /// The wait was cancelled (link loss or explicit shutdown).
    Cancelled,
}

/// Flags guarded by the wait condition's lock.
struct WaitFlags {
    satisfied: bool,
    cancelled: bool,
}

/// Lock/condvar pair shared between the waiting thread, the matcher and
/// whoever cancels the wait.
struct WaitShared {
    flags: Mutex<WaitFlags>,
    condvar: Condvar,
}

impl WaitShared {
    fn new() -> Self {
        WaitShared {
            flags: Mutex::new(WaitFlags {
                satisfied: false,
                cancelled: false,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Wake any blocked wait as cancelled. Sticky: once cancelled, every
    /// later wait on this state resolves as cancelled immediately.
    fn cancel(&self) {
        let mut flags = self.flags.lock().unwrap();
        flags.cancelled = true;
        self.condvar.notify_all();
    }
}

/// Validate a seconds-based timeout from configuration input.
///
/// Negative or non-finite values signal [`LinkError::InvalidArgument`].
pub fn timeout_from_secs(secs: f64) -> LinkResult<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(LinkError::InvalidArgument(format!(
            "timeout must be a non-negative number, got {secs}"
        )));
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Blocks a thread until a specific line arrives on the dispatcher.
///
/// The waiter is reusable: each call to [`ResponseWaiter::wait_outcome`] arms
/// a fresh wait, though waits on one instance must be sequential (use one
/// waiter per blocked thread). Matching is strict string equality, and never
/// consumes the line from other concurrent waiters; dispatcher fan-out means
/// every waiter for the same message is satisfied by one notification.
pub struct ResponseWaiter {
    dispatcher: Arc<Dispatcher<String>>,
    expected: String,
    timeout: Option<Duration>,
    shared: Arc<WaitShared>,
    matcher: Handler<String>,
}

impl std::fmt::Debug for ResponseWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseWaiter")
            .field("expected", &self.expected)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ResponseWaiter {
    /// Create a waiter for the given expected message.
    ///
    /// An empty expected message signals [`LinkError::InvalidArgument`].
    pub fn new(
        dispatcher: Arc<Dispatcher<String>>,
        expected: impl Into<String>,
    ) -> LinkResult<Self> {
        let expected = expected.into();
        if expected.is_empty() {
            return Err(LinkError::InvalidArgument(
                "expected message must not be empty".to_string(),
            ));
        }
        let shared = Arc::new(WaitShared::new());

        let matcher_shared = Arc::clone(&shared);
        let matcher_expected = expected.clone();
        let matcher: Handler<String> = Arc::new(move |_bound, line: &String| {
            if *line == matcher_expected {
                let mut flags = matcher_shared.flags.lock().unwrap();
                flags.satisfied = true;
                matcher_shared.condvar.notify_all();
            }
            Ok(())
        });

        Ok(ResponseWaiter {
            dispatcher,
            expected,
            timeout: None,
            shared,
            matcher,
        })
    }

    /// Set the instance default timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the instance default timeout from a seconds value, validating it.
    pub fn with_timeout_secs(self, secs: f64) -> LinkResult<Self> {
        Ok(self.with_timeout(timeout_from_secs(secs)?))
    }

    /// The message this waiter resolves on.
    pub fn expected(&self) -> &str {
        &self.expected
    }

    /// Wake a blocked wait immediately as [`WaitOutcome::Cancelled`].
    ///
    /// Safe to call from any thread and any number of times. Cancellation is
    /// sticky: a cancelled waiter never blocks again.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    /// Block until the expected message arrives, the effective timeout
    /// elapses, or the wait is cancelled.
    ///
    /// The effective timeout is the explicit argument if given, else the
    /// instance default, else wait forever. The matcher is subscribed while
    /// the condition lock is held, so a notification arriving between
    /// subscribe and the first block cannot be missed.
    pub fn wait_outcome(&self, timeout: Option<Duration>) -> WaitOutcome {
        let effective = timeout.or(self.timeout);
        trace!(expected = %self.expected, timeout = ?effective, "arming wait");

        let mut flags = self.shared.flags.lock().unwrap();
        flags.satisfied = false;
        if flags.cancelled {
            return WaitOutcome::Cancelled;
        }
        self.dispatcher.subscribe(Arc::clone(&self.matcher));

        let deadline = effective.map(|d| Instant::now() + d);
        let outcome = loop {
            if flags.cancelled {
                break WaitOutcome::Cancelled;
            }
            if flags.satisfied {
                break WaitOutcome::Satisfied;
            }
            match deadline {
                None => {
                    flags = self.shared.condvar.wait(flags).unwrap();
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break WaitOutcome::TimedOut;
                    }
                    let (guard, _) = self
                        .shared
                        .condvar
                        .wait_timeout(flags, deadline - now)
                        .unwrap();
                    flags = guard;
                }
            }
        };
        drop(flags);

        self.dispatcher.unsubscribe(&self.matcher);
        match outcome {
            WaitOutcome::Satisfied => trace!(expected = %self.expected, "wait satisfied"),
            WaitOutcome::TimedOut => debug!(expected = %self.expected, "wait timed out"),
            WaitOutcome::Cancelled => debug!(expected = %self.expected, "wait cancelled"),
        }
        outcome
    }

    /// Wait, signalling [`LinkError::Timeout`] on expiry and
    /// [`LinkError::Cancelled`] on cancellation.
    pub fn wait(&self, timeout: Option<Duration>) -> LinkResult<()> {
        match self.wait_outcome(timeout) {
            WaitOutcome::Satisfied => Ok(()),
            WaitOutcome::TimedOut => Err(LinkError::Timeout(self.expected.clone())),
            WaitOutcome::Cancelled => Err(LinkError::Cancelled(self.expected.clone())),
        }
    }

    /// Non-fatal polling variant: whether the expected message was observed
    /// before the timeout. Timed-out and cancelled waits both report `false`.
    pub fn wait_satisfied(&self, timeout: Option<Duration>) -> bool {
        self.wait_outcome(timeout) == WaitOutcome::Satisfied
    }
}
